//! Separable windowed reconstruction of one output texel.

use super::lut::PhaseSupportLut;
use super::state::WrapMode;

/// Where tap offsets and weights come from.
pub trait TapTable {
    fn windows(&self) -> [u32; 3];
    fn first_tap(&self, axis: usize, o: u32) -> i32;
    fn weight(&self, axis: usize, o: u32, k: u32) -> f32;
}

impl TapTable for PhaseSupportLut {
    fn windows(&self) -> [u32; 3] {
        PhaseSupportLut::windows(self)
    }

    #[inline]
    fn first_tap(&self, axis: usize, o: u32) -> i32 {
        self.axes[axis].first_tap(o)
    }

    #[inline]
    fn weight(&self, axis: usize, o: u32, k: u32) -> f32 {
        self.axes[axis].phase_weights(o)[k as usize]
    }
}

/// View over the packed table as uploaded to scratch memory.
pub struct PackedLut<'a> {
    pub words: &'a [u32],
    pub offsets: [u32; 3],
    pub windows: [u32; 3],
    pub phase_count: [u32; 3],
    pub period: [u32; 3],
}

impl TapTable for PackedLut<'_> {
    fn windows(&self) -> [u32; 3] {
        self.windows
    }

    #[inline]
    fn first_tap(&self, axis: usize, o: u32) -> i32 {
        let p = o % self.phase_count[axis];
        let base = self.words[(self.offsets[axis] + p) as usize] as i32;
        base + ((o / self.phase_count[axis]) * self.period[axis]) as i32
    }

    #[inline]
    fn weight(&self, axis: usize, o: u32, k: u32) -> f32 {
        let p = o % self.phase_count[axis];
        let index = self.offsets[axis] + self.phase_count[axis] + p * self.windows[axis] + k;
        f32::from_bits(self.words[index as usize])
    }
}

/// Input image addressing for the sampler.
pub struct Source<'a> {
    pub texels: &'a [[f32; 4]],
    pub extent: [u32; 3],
    pub wrap: [WrapMode; 3],
    pub border: [f32; 4],
}

impl Source<'_> {
    #[inline]
    fn fetch(&self, i: [i32; 3]) -> [f32; 4] {
        let x = self.wrap[0].resolve(i[0], self.extent[0]);
        let y = self.wrap[1].resolve(i[1], self.extent[1]);
        let z = self.wrap[2].resolve(i[2], self.extent[2]);
        match (x, y, z) {
            (Some(x), Some(y), Some(z)) => {
                let index = (z as usize * self.extent[1] as usize + y as usize) * self.extent[0] as usize + x as usize;
                self.texels[index]
            }
            _ => self.border,
        }
    }
}

/// Weighted sum over the tap window of output texel `o`.
pub fn filter_texel<T: TapTable + ?Sized>(taps: &T, src: &Source<'_>, o: [u32; 3]) -> [f32; 4] {
    let w = taps.windows();
    let first = [taps.first_tap(0, o[0]), taps.first_tap(1, o[1]), taps.first_tap(2, o[2])];
    let mut acc = [0.0f32; 4];
    for kz in 0..w[2] {
        let wz = taps.weight(2, o[2], kz);
        for ky in 0..w[1] {
            let wy = taps.weight(1, o[1], ky) * wz;
            for kx in 0..w[0] {
                let weight = taps.weight(0, o[0], kx) * wy;
                if weight == 0.0 {
                    continue;
                }
                let t = src.fetch([first[0] + kx as i32, first[1] + ky as i32, first[2] + kz as i32]);
                for c in 0..4 {
                    acc[c] += weight * t[c];
                }
            }
        }
    }
    acc
}

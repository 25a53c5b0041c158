//! Phase-support lookup tables.
//!
//! Output texel `o` on an axis with ratio `s = in / out` is centred at input
//! coordinate `c = (o + 1/2) s`. Its taps are the input texels whose centres
//! fall inside the kernel support scaled by `s`. Centres repeat every
//! `phase_count = out / gcd(in, out)` outputs shifted by `in / gcd` texels, so
//! one first-tap offset and one row of `window` weights per phase is enough.

use crate::util::{gcd, Error, Result};

use super::kernel::Kernel;
use super::state::BlitState;

const EDGE_EPSILON: f64 = 1e-9;

/// Table for one axis.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisLut {
    pub input: u32,
    pub output: u32,
    pub phase_count: u32,
    pub window: u32,
    /// First tap of each phase, relative to phase 0 of its period.
    pub first: Vec<i32>,
    /// `window` normalized weights per phase.
    pub weights: Vec<f32>,
}

impl AxisLut {
    pub fn build(input: u32, output: u32, kernel: &dyn Kernel) -> Result<Self> {
        if input == 0 || output == 0 {
            return Err(Error::filter(format!("axis {input} -> {output} is empty")));
        }
        if input == 1 && output == 1 {
            return Ok(Self { input, output, phase_count: 1, window: 1, first: vec![0], weights: vec![1.0] });
        }
        let g = gcd(input, output);
        let phase_count = output / g;
        let scale = input as f64 / output as f64;
        let (neg, pos) = kernel.support();
        let (neg, pos) = (neg as f64 * scale, pos as f64 * scale);

        let mut first = Vec::with_capacity(phase_count as usize);
        let mut last = Vec::with_capacity(phase_count as usize);
        for p in 0..phase_count {
            let c = (p as f64 + 0.5) * scale;
            let f = (c + neg - 0.5 - EDGE_EPSILON).ceil() as i32;
            let l = ((c + pos - 0.5).ceil() as i32 - 1).max(f);
            first.push(f);
            last.push(l);
        }
        let window = first.iter().zip(&last).map(|(f, l)| (l - f + 1) as u32).max().unwrap_or(1).max(1);

        let mut weights = vec![0.0f32; (phase_count * window) as usize];
        for p in 0..phase_count as usize {
            let c = (p as f64 + 0.5) * scale;
            let row = &mut weights[p * window as usize..(p + 1) * window as usize];
            let mut sum = 0.0f64;
            for (k, w) in row.iter_mut().enumerate() {
                let i = first[p] + k as i32;
                if i > last[p] {
                    break;
                }
                let x = (i as f64 + 0.5 - c) / scale;
                let v = kernel.weight(x as f32) as f64;
                *w = v as f32;
                sum += v;
            }
            if sum.abs() < 1e-12 {
                // support narrower than a texel: take the texel containing the centre
                row.fill(0.0);
                let k = (c.floor() as i32 - first[p]).clamp(0, window as i32 - 1);
                row[k as usize] = 1.0;
            } else {
                for w in row.iter_mut() {
                    *w = (*w as f64 / sum) as f32;
                }
            }
        }
        Ok(Self { input, output, phase_count, window, first, weights })
    }

    /// First tap of output texel `o`.
    #[inline]
    pub fn first_tap(&self, o: u32) -> i32 {
        let period = self.input / gcd(self.input, self.output);
        let p = o % self.phase_count;
        self.first[p as usize] + ((o / self.phase_count) * period) as i32
    }

    #[inline]
    pub fn phase_weights(&self, o: u32) -> &[f32] {
        let p = (o % self.phase_count) as usize;
        let w = self.window as usize;
        &self.weights[p * w..(p + 1) * w]
    }

    /// Input texels one period advances (`in / gcd`).
    pub fn period(&self) -> u32 {
        self.input / gcd(self.input, self.output)
    }

    /// Words this axis occupies in the packed table.
    pub fn word_count(&self) -> usize {
        (self.phase_count * (1 + self.window)) as usize
    }

    /// `[first as i32; P][weights as f32; P * W]` as raw words.
    pub fn pack(&self, out: &mut Vec<u32>) {
        out.extend(self.first.iter().map(|&f| f as u32));
        out.extend(self.weights.iter().map(|w| w.to_bits()));
    }
}

/// Tables for all three axes.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseSupportLut {
    pub axes: [AxisLut; 3],
}

impl PhaseSupportLut {
    pub fn build(state: &BlitState) -> Result<Self> {
        state.validate()?;
        let i = state.input_extent.to_array();
        let o = state.output_extent.to_array();
        Ok(Self {
            axes: [
                AxisLut::build(i[0], o[0], state.kernels[0].as_ref())?,
                AxisLut::build(i[1], o[1], state.kernels[1].as_ref())?,
                AxisLut::build(i[2], o[2], state.kernels[2].as_ref())?,
            ],
        })
    }

    pub fn windows(&self) -> [u32; 3] {
        [self.axes[0].window, self.axes[1].window, self.axes[2].window]
    }

    /// Texels in the full tap window.
    pub fn window_texels(&self) -> u32 {
        self.windows().iter().product()
    }

    /// Word offset of each axis inside [`Self::pack`].
    pub fn axis_offsets(&self) -> [u32; 3] {
        let a = self.axes[0].word_count() as u32;
        let b = a + self.axes[1].word_count() as u32;
        [0, a, b]
    }

    pub fn word_count(&self) -> usize {
        self.axes.iter().map(AxisLut::word_count).sum()
    }

    pub fn pack(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.word_count());
        for axis in &self.axes {
            axis.pack(&mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blit::kernel::{BoxKernel, LanczosKernel, TriangleKernel};

    fn assert_normalized(lut: &AxisLut) {
        for p in 0..lut.phase_count {
            let sum: f32 = lut.phase_weights(p).iter().sum();
            assert!((sum - 1.0).abs() < 1e-5, "phase {p} sums to {sum}");
        }
    }

    #[test]
    fn test_phase_count_is_out_over_gcd() {
        for (i, o) in [(300u32, 100u32), (700, 100), (5, 3), (3, 5), (64, 64), (17, 4)] {
            for kernel in [&BoxKernel as &dyn Kernel, &TriangleKernel, &LanczosKernel::default()] {
                let lut = AxisLut::build(i, o, kernel).unwrap();
                assert_eq!(lut.phase_count, o / gcd(i, o));
                assert_eq!(lut.weights.len(), (lut.phase_count * lut.window) as usize);
                assert_eq!(lut.first.len(), lut.phase_count as usize);
                assert_normalized(&lut);
            }
        }
    }

    #[test]
    fn test_box_downscale_by_three() {
        let lut = AxisLut::build(300, 100, &BoxKernel).unwrap();
        assert_eq!(lut.phase_count, 1);
        assert_eq!(lut.window, 3);
        assert_eq!(lut.first_tap(0), 0);
        assert_eq!(lut.first_tap(7), 21);
        for w in lut.phase_weights(0) {
            assert!((w - 1.0 / 3.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_first_tap_matches_direct_computation() {
        let lut = AxisLut::build(5, 3, &TriangleKernel).unwrap();
        let scale = 5.0f64 / 3.0;
        for o in 0..9u32 {
            let c = (o as f64 + 0.5) * scale;
            let direct = (c - scale - 0.5 - EDGE_EPSILON).ceil() as i32;
            assert_eq!(lut.first_tap(o), direct, "output {o}");
        }
    }

    #[test]
    fn test_box_upscale_picks_nearest_texel() {
        let lut = AxisLut::build(2, 4, &BoxKernel).unwrap();
        assert_eq!(lut.phase_count, 2);
        for o in 0..4 {
            let w = lut.phase_weights(o);
            let k = w.iter().position(|&x| x == 1.0).unwrap();
            assert_eq!(lut.first_tap(o) + k as i32, (o / 2) as i32);
        }
    }

    #[test]
    fn test_packed_layout() {
        let state = BlitState::new(crate::util::Extent3::new(6, 4, 1), crate::util::Extent3::new(4, 2, 1));
        let lut = PhaseSupportLut::build(&state).unwrap();
        let packed = lut.pack();
        assert_eq!(packed.len(), lut.word_count());
        let [x, y, z] = lut.axis_offsets();
        assert_eq!(x, 0);
        assert_eq!(packed[x as usize] as i32, lut.axes[0].first[0]);
        assert_eq!(f32::from_bits(packed[(x + lut.axes[0].phase_count) as usize]), lut.axes[0].weights[0]);
        assert_eq!(y as usize, lut.axes[0].word_count());
        assert_eq!(z as usize, y as usize + lut.axes[1].word_count());
        assert_eq!(lut.windows()[2], 1);
    }
}

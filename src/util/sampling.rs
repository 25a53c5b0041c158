//! Sample sequences and per-pixel scrambles for progressive rendering.
//!
//! The sequence buffer holds `samples × dimensions` 32-bit fixed-point values
//! (sample-major). Each dimension is a base-2 radical inverse with a hashed
//! digital shift, and the scramble buffer holds one random key per pixel that
//! shaders XOR into the sequence value.

/// Seed used for the scramble buffer when none is configured.
pub const DEFAULT_SCRAMBLE_SEED: u32 = 0xbadc_0ffe;

/// Seed used for the per-dimension digital shifts.
pub const DEFAULT_SEQUENCE_SEED: u32 = 0xdead_beef;

/// Minimal xorshift generator.
#[derive(Debug, Clone)]
pub struct XorShift32 {
    state: u32,
}

impl XorShift32 {
    pub fn new(seed: u32) -> Self {
        Self { state: if seed == 0 { 0x9e37_79b9 } else { seed } }
    }

    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        x
    }

    /// Uniform float in `[0, 1)`.
    #[inline]
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 * (1.0 / (1u32 << 24) as f32)
    }
}

/// Base-2 radical inverse as 32-bit fixed point.
#[inline]
pub fn radical_inverse_bits(i: u32) -> u32 {
    i.reverse_bits()
}

/// Convert a fixed-point sample to `[0, 1)`.
#[inline]
pub fn bits_to_unit(bits: u32) -> f32 {
    (bits >> 8) as f32 * (1.0 / (1u32 << 24) as f32)
}

/// Integer hash (lowbias32).
#[inline]
pub fn hash_u32(mut x: u32) -> u32 {
    x ^= x >> 16;
    x = x.wrapping_mul(0x7feb_352d);
    x ^= x >> 15;
    x = x.wrapping_mul(0x846c_a68b);
    x ^= x >> 16;
    x
}

/// Sample-major table of fixed-point sequence values.
#[derive(Debug, Clone)]
pub struct SampleSequence {
    dimensions: u32,
    samples: u32,
    data: Vec<u32>,
}

impl SampleSequence {
    pub fn generate(dimensions: u32, samples: u32, seed: u32) -> Self {
        let mut data = Vec::with_capacity(dimensions as usize * samples as usize);
        for s in 0..samples {
            for d in 0..dimensions {
                let shift = hash_u32(seed ^ hash_u32(d));
                // dimension 0 keeps the plain van der Corput sequence
                let value = if d == 0 { radical_inverse_bits(s) } else { radical_inverse_bits(s) ^ shift };
                data.push(value);
            }
        }
        Self { dimensions, samples, data }
    }

    #[inline]
    pub fn dimensions(&self) -> u32 {
        self.dimensions
    }

    #[inline]
    pub fn samples(&self) -> u32 {
        self.samples
    }

    #[inline]
    pub fn get(&self, sample: u32, dimension: u32) -> u32 {
        let s = sample % self.samples.max(1);
        let d = dimension % self.dimensions.max(1);
        self.data[(s * self.dimensions + d) as usize]
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.data
    }
}

/// One random scramble key per pixel.
pub fn scramble_keys(pixel_count: usize, seed: u32) -> Vec<u32> {
    let mut rng = XorShift32::new(seed);
    (0..pixel_count).map(|_| rng.next_u32()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_radical_inverse() {
        assert_eq!(bits_to_unit(radical_inverse_bits(0)), 0.0);
        assert_eq!(bits_to_unit(radical_inverse_bits(1)), 0.5);
        assert_eq!(bits_to_unit(radical_inverse_bits(2)), 0.25);
        assert_eq!(bits_to_unit(radical_inverse_bits(3)), 0.75);
    }

    #[test]
    fn test_sequence_stratified_in_first_dimension() {
        let seq = SampleSequence::generate(3, 16, DEFAULT_SEQUENCE_SEED);
        assert_eq!(seq.as_slice().len(), 48);
        // 16 samples land in 16 distinct strata
        let mut strata: Vec<u32> = (0..16).map(|s| (bits_to_unit(seq.get(s, 0)) * 16.0) as u32).collect();
        strata.sort();
        assert_eq!(strata, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_scramble_deterministic() {
        let a = scramble_keys(8, DEFAULT_SCRAMBLE_SEED);
        let b = scramble_keys(8, DEFAULT_SCRAMBLE_SEED);
        assert_eq!(a, b);
        assert!(a.windows(2).all(|w| w[0] != w[1]));
    }
}

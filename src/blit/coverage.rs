//! Alpha coverage bookkeeping.

/// Histogram resolution of the blit pass.
pub const ALPHA_BIN_COUNT: u32 = 256;

/// Lower bound of the adjusted threshold.
pub const MIN_THRESHOLD: f32 = 1e-6;

#[inline]
pub fn alpha_bin(alpha: f32) -> usize {
    ((alpha * ALPHA_BIN_COUNT as f32).floor() as i32).clamp(0, ALPHA_BIN_COUNT as i32 - 1) as usize
}

/// Fraction of `alphas` strictly above `reference`.
pub fn coverage(alphas: impl IntoIterator<Item = f32>, reference: f32) -> f32 {
    let (mut pass, mut total) = (0u64, 0u64);
    for a in alphas {
        total += 1;
        if a > reference {
            pass += 1;
        }
    }
    if total == 0 { 0.0 } else { pass as f32 / total as f32 }
}

/// Threshold `t'` above which the output holds as many texels, relative
/// to its size, as the input held above the reference.
///
/// Picks the highest bin whose suffix count reaches the target and
/// interpolates inside it assuming alphas spread evenly over the bin.
pub fn adjusted_threshold(histogram: &[u32], passed: u32, input_texels: u64, output_texels: u64) -> f32 {
    let target = passed as f32 * output_texels as f32 / input_texels.max(1) as f32;
    if target <= 0.0 {
        return 1.0;
    }
    let mut suffix = 0.0f32;
    for b in (0..histogram.len()).rev() {
        let count = histogram[b] as f32;
        suffix += count;
        if suffix >= target && count > 0.0 {
            let t = (b as f32 + (suffix - target) / count) / histogram.len() as f32;
            return t.max(MIN_THRESHOLD);
        }
    }
    MIN_THRESHOLD
}

#[inline]
pub fn rescale_alpha(alpha: f32, reference: f32, threshold: f32) -> f32 {
    (alpha * reference / threshold).clamp(0.0, 1.0)
}

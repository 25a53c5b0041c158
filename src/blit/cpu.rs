//! CPU reference blit.

use rayon::prelude::*;

use crate::util::{Error, Result};

use super::coverage::{adjusted_threshold, alpha_bin, rescale_alpha, ALPHA_BIN_COUNT};
use super::image::{Image, TexelFormat};
use super::lut::PhaseSupportLut;
use super::sampler::{filter_texel, Source};
use super::state::BlitState;

/// Result of a blit, with the coverage statistics of coverage mode.
#[derive(Debug, Clone)]
pub struct BlitOutput {
    pub texels: Vec<[f32; 4]>,
    /// Texels that passed the alpha test on the input.
    pub passed: u32,
    /// Output alpha histogram before normalization.
    pub histogram: Vec<u32>,
    /// Adjusted threshold used by normalization.
    pub threshold: Option<f32>,
}

/// Blit linear texels.
#[tracing::instrument(skip_all, fields(input = ?state.input_extent, output = ?state.output_extent, coverage = state.coverage()))]
pub fn blit_linear(state: &BlitState, input: &[[f32; 4]]) -> Result<BlitOutput> {
    let lut = PhaseSupportLut::build(state)?;
    if input.len() as u64 != state.input_extent.texel_count() {
        return Err(Error::range(format!("{} input texels for {:?}", input.len(), state.input_extent)));
    }
    let reference = state.reference_alpha;
    let passed = if state.coverage() {
        input.par_iter().filter(|t| t[3] > reference).count() as u32
    } else {
        0
    };

    let src = Source {
        texels: input,
        extent: state.input_extent.to_array(),
        wrap: state.wrap,
        border: state.border.rgba(),
    };
    let out = state.output_extent;
    let row = out.width as usize;
    let mut texels = vec![[0.0f32; 4]; out.texel_count() as usize];
    texels.par_chunks_mut(row).enumerate().for_each(|(r, chunk)| {
        let y = (r % out.height as usize) as u32;
        let z = (r / out.height as usize) as u32;
        for (x, t) in chunk.iter_mut().enumerate() {
            *t = filter_texel(&lut, &src, [x as u32, y, z]);
        }
    });

    let mut histogram = vec![0u32; ALPHA_BIN_COUNT as usize];
    let mut threshold = None;
    if state.coverage() {
        for t in &texels {
            histogram[alpha_bin(t[3])] += 1;
        }
        let t = adjusted_threshold(&histogram, passed, state.input_extent.texel_count(), out.texel_count());
        texels.par_iter_mut().for_each(|texel| texel[3] = rescale_alpha(texel[3], reference, t));
        threshold = Some(t);
    }
    tracing::debug!(passed, ?threshold, window = ?lut.windows(), "cpu blit done");
    Ok(BlitOutput { texels, passed, histogram, threshold })
}

/// Blit an image, encoding the result in `format`.
pub fn blit(state: &BlitState, input: &Image, format: TexelFormat) -> Result<Image> {
    if input.extent() != state.input_extent {
        return Err(Error::filter(format!("image is {:?}, state expects {:?}", input.extent(), state.input_extent)));
    }
    let out = blit_linear(state, &input.to_linear())?;
    Image::from_linear(state.output_extent, format, &out.texels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blit::coverage::coverage;
    use crate::blit::kernel::TriangleKernel;
    use crate::blit::state::{BorderColor, WrapMode};
    use crate::util::Extent3;
    use std::sync::Arc;

    #[test]
    fn test_constant_image_is_preserved() {
        let state = BlitState::new(Extent3::d2(9, 6), Extent3::d2(4, 5)).with_kernel(Arc::new(TriangleKernel));
        let input = vec![[0.25, 0.5, 0.75, 1.0]; 54];
        let out = blit_linear(&state, &input).unwrap();
        for t in &out.texels {
            for c in 0..4 {
                assert!((t[c] - input[0][c]).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_box_downscale_averages() {
        let state = BlitState::new(Extent3::d2(4, 2), Extent3::d2(2, 1));
        let input: Vec<[f32; 4]> = (0..8).map(|i| [i as f32, 0.0, 0.0, 1.0]).collect();
        let out = blit_linear(&state, &input).unwrap();
        assert!((out.texels[0][0] - 2.5).abs() < 1e-5);
        assert!((out.texels[1][0] - 4.5).abs() < 1e-5);
    }

    #[test]
    fn test_border_color_bleeds_in() {
        let state = BlitState::new(Extent3::d2(2, 2), Extent3::d2(1, 1))
            .with_kernel(Arc::new(TriangleKernel))
            .with_wrap(WrapMode::ClampToBorder)
            .with_border(BorderColor::OpaqueWhite);
        let out = blit_linear(&state, &[[0.0; 4]; 4]).unwrap();
        // weight inside the image is (3/4)^2
        assert!((out.texels[0][0] - (1.0 - 0.5625)).abs() < 1e-5);
    }

    #[test]
    fn test_coverage_is_restored() {
        let (w, h) = (60, 60);
        let input: Vec<[f32; 4]> = (0..w * h)
            .map(|i| {
                let (x, y) = (i % w, i / w);
                let a = if (x / 3 + y / 3) % 4 == 0 { 0.9 } else { 0.3 };
                [1.0, 1.0, 1.0, a]
            })
            .collect();
        let state = BlitState::new(Extent3::d2(w, h), Extent3::d2(20, 20)).with_coverage(0.5);
        let before = coverage(input.iter().map(|t| t[3]), 0.5);
        let out = blit_linear(&state, &input).unwrap();
        assert_eq!(out.passed as f32 / (w * h) as f32, before);
        assert_eq!(out.histogram.iter().sum::<u32>(), 400);
        let after = coverage(out.texels.iter().map(|t| t[3]), 0.5);
        assert!((after - before).abs() / before < 0.02, "before {before}, after {after}");
    }
}

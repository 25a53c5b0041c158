//! Host-device kernels for the three blit passes.
//!
//! Each kernel reads the same bindings and push constants as its WGSL
//! counterpart and only touches invocations the dispatch actually covers.

use rayon::prelude::*;

use crate::util::{Error, Result};
use crate::video::{HostDispatch, HostKernel};

use super::coverage::{adjusted_threshold, alpha_bin, rescale_alpha, ALPHA_BIN_COUNT};
use super::params::{
    AlphaTestParams, BlitParams, NormalizationParams, BINDING_HISTOGRAM, BINDING_INPUT, BINDING_LUT, BINDING_OUTPUT,
    HISTOGRAM_WORDS, PASS_COUNTER_WORD,
};
use super::sampler::{filter_texel, Source};
use super::state::WrapMode;

fn covered(ctx: &HostDispatch<'_>, extent: [u32; 4]) -> [u32; 3] {
    let inv = ctx.invocations();
    [extent[0].min(inv[0]), extent[1].min(inv[1]), extent[2].min(inv[2])]
}

fn wrap_mode(code: u32) -> WrapMode {
    match code {
        1 => WrapMode::Repeat,
        2 => WrapMode::MirroredRepeat,
        3 => WrapMode::ClampToBorder,
        _ => WrapMode::ClampToEdge,
    }
}

fn require_len<T>(data: &[T], len: u64, what: &str) -> Result<()> {
    if (data.len() as u64) < len {
        return Err(Error::range(format!("{what} binding holds {} elements, pass needs {len}", data.len())));
    }
    Ok(())
}

fn texel_count(extent: [u32; 4]) -> u64 {
    extent[0] as u64 * extent[1] as u64 * extent[2] as u64
}

fn texel_index(extent: [u32; 4], x: u32, y: u32, z: u32) -> usize {
    (z as usize * extent[1] as usize + y as usize) * extent[0] as usize + x as usize
}

/// Counts input texels whose alpha exceeds the reference.
#[derive(Debug, Default)]
pub struct AlphaTestKernel;

impl HostKernel for AlphaTestKernel {
    fn dispatch(&self, ctx: &mut HostDispatch<'_>) -> Result<()> {
        let params: AlphaTestParams = ctx.push_constants()?;
        let input = ctx.read::<[f32; 4]>(BINDING_INPUT)?;
        require_len(&input, texel_count(params.input_extent), "input")?;
        let [w, h, d] = covered(ctx, params.input_extent);
        let extent = params.input_extent;
        let passed: u32 = (0..d * h)
            .into_par_iter()
            .map(|row| {
                let (y, z) = (row % h, row / h);
                (0..w).filter(|&x| input[texel_index(extent, x, y, z)][3] > params.reference_alpha).count() as u32
            })
            .sum();
        let mut histogram = ctx.read::<u32>(BINDING_HISTOGRAM)?;
        require_len(&histogram, HISTOGRAM_WORDS as u64, "histogram")?;
        histogram[PASS_COUNTER_WORD as usize] += passed;
        ctx.write(BINDING_HISTOGRAM, &histogram)
    }
}

/// Windowed resampling plus the output alpha histogram.
#[derive(Debug, Default)]
pub struct BlitKernel;

impl HostKernel for BlitKernel {
    fn dispatch(&self, ctx: &mut HostDispatch<'_>) -> Result<()> {
        let params: BlitParams = ctx.push_constants()?;
        let input = ctx.read::<[f32; 4]>(BINDING_INPUT)?;
        require_len(&input, texel_count(params.input_extent), "input")?;
        let words = ctx.read::<u32>(BINDING_LUT)?;
        let lut = params.lut(&words)?;
        let src = Source {
            texels: &input,
            extent: [params.input_extent[0], params.input_extent[1], params.input_extent[2]],
            wrap: [wrap_mode(params.wrap[0]), wrap_mode(params.wrap[1]), wrap_mode(params.wrap[2])],
            border: params.border,
        };
        let extent = params.output_extent;
        let [w, h, d] = covered(ctx, extent);
        let rows: Vec<(u32, u32, Vec<[f32; 4]>)> = (0..d * h)
            .into_par_iter()
            .map(|row| {
                let (y, z) = (row % h, row / h);
                (y, z, (0..w).map(|x| filter_texel(&lut, &src, [x, y, z])).collect())
            })
            .collect();

        let mut output = ctx.read::<[f32; 4]>(BINDING_OUTPUT)?;
        require_len(&output, texel_count(extent), "output")?;
        let mut bins = vec![0u32; ALPHA_BIN_COUNT as usize];
        for (y, z, texels) in rows {
            let start = texel_index(extent, 0, y, z);
            for (x, t) in texels.into_iter().enumerate() {
                if params.coverage() {
                    bins[alpha_bin(t[3])] += 1;
                }
                output[start + x] = t;
            }
        }
        ctx.write(BINDING_OUTPUT, &output)?;
        if params.coverage() {
            let mut histogram = ctx.read::<u32>(BINDING_HISTOGRAM)?;
            require_len(&histogram, HISTOGRAM_WORDS as u64, "histogram")?;
            for (dst, add) in histogram.iter_mut().zip(&bins) {
                *dst += add;
            }
            ctx.write(BINDING_HISTOGRAM, &histogram)?;
        }
        Ok(())
    }
}

/// Rescales output alpha so the reference threshold keeps the input coverage.
#[derive(Debug, Default)]
pub struct NormalizationKernel;

impl HostKernel for NormalizationKernel {
    fn dispatch(&self, ctx: &mut HostDispatch<'_>) -> Result<()> {
        let params: NormalizationParams = ctx.push_constants()?;
        let histogram = ctx.read::<u32>(BINDING_HISTOGRAM)?;
        require_len(&histogram, HISTOGRAM_WORDS as u64, "histogram")?;
        let bins = ALPHA_BIN_COUNT as usize;
        let threshold = adjusted_threshold(
            &histogram[..bins],
            histogram[PASS_COUNTER_WORD as usize],
            params.input_texels as u64,
            params.output_texels as u64,
        );
        let extent = params.output_extent;
        let [w, h, d] = covered(ctx, extent);
        let reference = params.reference_alpha;
        let mut output = ctx.read::<[f32; 4]>(BINDING_OUTPUT)?;
        require_len(&output, texel_count(extent), "output")?;
        output.par_chunks_mut(extent[0].max(1) as usize).enumerate().for_each(|(row, chunk)| {
            let (y, z) = (row as u32 % extent[1].max(1), row as u32 / extent[1].max(1));
            if y >= h || z >= d {
                return;
            }
            for t in chunk.iter_mut().take(w as usize) {
                t[3] = rescale_alpha(t[3], reference, threshold);
            }
        });
        tracing::trace!(threshold, "normalization pass");
        ctx.write(BINDING_OUTPUT, &output)
    }
}

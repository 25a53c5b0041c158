//! Device-visible layouts of the three passes.

use bytemuck::{Pod, Zeroable};

use crate::config::BlitConfig;
use crate::util::{align_up, Error, Extent3, Result};
use crate::video::DeviceLimits;

use super::coverage::ALPHA_BIN_COUNT;
use super::lut::PhaseSupportLut;
use super::sampler::PackedLut;
use super::state::BlitState;

/// Bytes of shared memory one window texel occupies (RGBA f32).
pub const WINDOW_TEXEL_BYTES: u32 = 16;

pub const BINDING_INPUT: u32 = 0;
pub const BINDING_OUTPUT: u32 = 1;
pub const BINDING_LUT: u32 = 2;
pub const BINDING_HISTOGRAM: u32 = 3;

/// Histogram bins followed by the alpha-test pass counter.
pub const HISTOGRAM_WORDS: u32 = ALPHA_BIN_COUNT + 1;
pub const PASS_COUNTER_WORD: u32 = ALPHA_BIN_COUNT;

/// Alpha-test push constants.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct AlphaTestParams {
    pub input_extent: [u32; 4],
    pub reference_alpha: f32,
    pub _pad: [u32; 3],
}

/// Blit push constants. `wrap[3]` is non-zero in coverage mode.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct BlitParams {
    pub input_extent: [u32; 4],
    pub output_extent: [u32; 4],
    pub wrap: [u32; 4],
    pub window: [u32; 4],
    pub phase_count: [u32; 4],
    pub period: [u32; 4],
    pub lut_offset: [u32; 4],
    pub border: [f32; 4],
}

/// Normalization push constants.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct NormalizationParams {
    pub output_extent: [u32; 4],
    pub input_texels: u32,
    pub output_texels: u32,
    pub reference_alpha: f32,
    pub _pad: u32,
}

fn extent4(e: [u32; 3]) -> [u32; 4] {
    [e[0], e[1], e[2], 0]
}

impl AlphaTestParams {
    pub fn new(state: &BlitState) -> Self {
        Self {
            input_extent: extent4(state.input_extent.to_array()),
            reference_alpha: state.reference_alpha,
            _pad: [0; 3],
        }
    }
}

impl BlitParams {
    pub fn new(state: &BlitState, lut: &PhaseSupportLut) -> Self {
        let w = state.wrap;
        let offsets = lut.axis_offsets();
        Self {
            input_extent: extent4(state.input_extent.to_array()),
            output_extent: extent4(state.output_extent.to_array()),
            wrap: [w[0].code(), w[1].code(), w[2].code(), state.coverage() as u32],
            window: extent4(lut.windows()),
            phase_count: extent4([0, 1, 2].map(|a| lut.axes[a].phase_count)),
            period: extent4([0, 1, 2].map(|a| lut.axes[a].period())),
            lut_offset: extent4(offsets),
            border: state.border.rgba(),
        }
    }

    pub fn coverage(&self) -> bool {
        self.wrap[3] != 0
    }

    /// Read the packed table back out of `words`.
    pub fn lut<'a>(&self, words: &'a [u32]) -> Result<PackedLut<'a>> {
        let mut needed = 0u32;
        for a in 0..3 {
            if self.phase_count[a] == 0 || self.window[a] == 0 {
                return Err(Error::filter(format!("axis {a} has no phases")));
            }
            needed = needed.max(self.lut_offset[a] + self.phase_count[a] * (1 + self.window[a]));
        }
        if needed as usize > words.len() {
            return Err(Error::range(format!("table needs {needed} words, binding holds {}", words.len())));
        }
        Ok(PackedLut {
            words,
            offsets: [self.lut_offset[0], self.lut_offset[1], self.lut_offset[2]],
            windows: [self.window[0], self.window[1], self.window[2]],
            phase_count: [self.phase_count[0], self.phase_count[1], self.phase_count[2]],
            period: [self.period[0], self.period[1], self.period[2]],
        })
    }
}

impl NormalizationParams {
    /// Fails when a texel count does not fit the shader's 32-bit counters.
    pub fn new(state: &BlitState) -> Result<Self> {
        let count = |extent: Extent3, what: &str| {
            let texels = extent.texel_count();
            u32::try_from(texels)
                .map_err(|_| Error::Unsupported(format!("{what} of {texels} texels exceeds 32-bit coverage counters")))
        };
        Ok(Self {
            output_extent: extent4(state.output_extent.to_array()),
            input_texels: count(state.input_extent, "input")?,
            output_texels: count(state.output_extent, "output")?,
            reference_alpha: state.reference_alpha,
            _pad: 0,
        })
    }
}

/// Where the table and the histogram live inside caller scratch memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchLayout {
    pub lut_offset: u64,
    pub lut_size: u64,
    pub histogram_offset: u64,
    pub histogram_size: u64,
    pub total: u64,
}

impl ScratchLayout {
    pub fn new(lut: &PhaseSupportLut, limits: &DeviceLimits) -> Self {
        let lut_size = lut.word_count() as u64 * 4;
        let histogram_offset = align_up(lut_size, limits.min_storage_buffer_offset_alignment.max(4) as u64);
        let histogram_size = HISTOGRAM_WORDS as u64 * 4;
        Self { lut_offset: 0, lut_size, histogram_offset, histogram_size, total: histogram_offset + histogram_size }
    }
}

/// Reject a blit whose tap window cannot be dispatched.
pub fn check_window(lut: &PhaseSupportLut, config: &BlitConfig, limits: &DeviceLimits) -> Result<()> {
    let texels = lut.window_texels();
    let required = texels.saturating_mul(WINDOW_TEXEL_BYTES);
    let budget = config.shared_memory_budget.min(limits.max_compute_shared_memory_size);
    if required > budget {
        return Err(Error::SharedMemoryBudget { texels, required, budget });
    }
    let invocations = config.blit_invocations.min(limits.max_compute_workgroup_invocations);
    if texels > invocations {
        return Err(Error::WorkgroupLimit { what: "window texels".into(), requested: texels, limit: invocations });
    }
    for (axis, (&window, &limit)) in lut.windows().iter().zip(&limits.max_compute_workgroup_size).enumerate() {
        if window > limit {
            return Err(Error::WorkgroupLimit { what: format!("window on axis {axis}"), requested: window, limit });
        }
    }
    Ok(())
}

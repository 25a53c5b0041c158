//! Device path of the blit.
//!
//! ## Usage
//! ```ignore
//! let pipelines = BlitPipelines::new(&ctx)?;
//! let layout = pipelines.scratch_layout(&state)?;
//! // caller allocates input, output and `layout.total` bytes of scratch
//! let fence = pipelines.execute(&ctx, &state, input, output, scratch)?;
//! ctx.wait(fence)?;
//! ```

use std::sync::Arc;

use crate::util::{dispatch_size, Error, Result};
use crate::video::{
    Access, Barrier, BindingDesc, BindingKind, BufferDesc, BufferHandle, BufferRange, BufferUsage, CommandList,
    ComputePipelineDesc, ComputeShader, Context, Device, DeviceLimits, FenceHandle, PipelineHandle, PipelineStage,
};

use super::coverage::ALPHA_BIN_COUNT;
use super::host::{AlphaTestKernel, BlitKernel, NormalizationKernel};
use super::image::{Image, TexelFormat};
use super::lut::PhaseSupportLut;
use super::params::{
    check_window, AlphaTestParams, BlitParams, NormalizationParams, ScratchLayout, BINDING_HISTOGRAM, BINDING_INPUT,
    BINDING_LUT, BINDING_OUTPUT,
};
use super::state::BlitState;

const ALPHA_TEST_WGSL: &str = include_str!("shaders/alpha_test.wgsl");
const BLIT_WGSL: &str = include_str!("shaders/blit.wgsl");
const NORMALIZATION_WGSL: &str = include_str!("shaders/normalization.wgsl");

pub const ALPHA_BIN_COUNT_DEFINE: &str = "_NBL_GLSL_BLIT_ALPHA_BIN_COUNT_";

/// Usage of the buffer holding input texels.
pub const INPUT_USAGE: BufferUsage = BufferUsage::STORAGE.union(BufferUsage::TRANSFER_DST);
/// Usage of the buffer receiving output texels.
pub const OUTPUT_USAGE: BufferUsage = BufferUsage::STORAGE.union(BufferUsage::TRANSFER_SRC);
/// Usage of caller scratch memory.
pub const SCRATCH_USAGE: BufferUsage = BufferUsage::STORAGE.union(BufferUsage::TRANSFER_DST);

const TEXEL_BYTES: u64 = 16;

fn fit_workgroup(requested: [u32; 3], limits: &DeviceLimits) -> [u32; 3] {
    let mut size = [0, 1, 2].map(|a| requested[a].clamp(1, limits.max_compute_workgroup_size[a]));
    while size.iter().product::<u32>() > limits.max_compute_workgroup_invocations {
        let axis = if size[0] >= size[1] { 0 } else { 1 };
        size[axis] = (size[axis] / 2).max(1);
    }
    size
}

/// The three compute pipelines, created once and reused per blit.
pub struct BlitPipelines {
    device: Arc<dyn Device>,
    alpha_test: PipelineHandle,
    blit: PipelineHandle,
    normalization: PipelineHandle,
    alpha_test_workgroup: [u32; 3],
    blit_workgroup: [u32; 3],
    normalization_workgroup: [u32; 3],
}

impl BlitPipelines {
    #[tracing::instrument(skip_all, fields(device = ctx.device().name()))]
    pub fn new(ctx: &Context) -> Result<Self> {
        let device = ctx.device_arc();
        let limits = device.limits();
        let config = &ctx.config().blit;
        let bins = [(ALPHA_BIN_COUNT_DEFINE, ALPHA_BIN_COUNT.to_string())];

        let alpha_test_workgroup = fit_workgroup(config.alpha_test_workgroup, &limits);
        let blit_workgroup = fit_workgroup([config.blit_invocations, 1, 1], &limits);
        let normalization_workgroup = fit_workgroup([config.normalization_invocations, 1, 1], &limits);

        let alpha_test = device.create_compute_pipeline(&ComputePipelineDesc {
            label: "blit alpha test".into(),
            shader: ComputeShader::new("alpha_test.wgsl", ALPHA_TEST_WGSL, alpha_test_workgroup, &bins)?
                .with_host_kernel(Arc::new(AlphaTestKernel)),
            bindings: vec![
                BindingDesc::new(BINDING_INPUT, BindingKind::StorageRead),
                BindingDesc::new(BINDING_HISTOGRAM, BindingKind::StorageReadWrite),
            ],
            push_constant_size: std::mem::size_of::<AlphaTestParams>() as u32,
        })?;
        let blit = device.create_compute_pipeline(&ComputePipelineDesc {
            label: "blit".into(),
            shader: ComputeShader::new("blit.wgsl", BLIT_WGSL, blit_workgroup, &bins)?
                .with_host_kernel(Arc::new(BlitKernel)),
            bindings: vec![
                BindingDesc::new(BINDING_INPUT, BindingKind::StorageRead),
                BindingDesc::new(BINDING_OUTPUT, BindingKind::StorageReadWrite),
                BindingDesc::new(BINDING_LUT, BindingKind::StorageReadWrite),
                BindingDesc::new(BINDING_HISTOGRAM, BindingKind::StorageReadWrite),
            ],
            push_constant_size: std::mem::size_of::<BlitParams>() as u32,
        })?;
        let normalization = device.create_compute_pipeline(&ComputePipelineDesc {
            label: "blit normalization".into(),
            shader: ComputeShader::new("normalization.wgsl", NORMALIZATION_WGSL, normalization_workgroup, &bins)?
                .with_host_kernel(Arc::new(NormalizationKernel)),
            bindings: vec![
                BindingDesc::new(BINDING_OUTPUT, BindingKind::StorageReadWrite),
                BindingDesc::new(BINDING_HISTOGRAM, BindingKind::StorageReadWrite),
            ],
            push_constant_size: std::mem::size_of::<NormalizationParams>() as u32,
        })?;
        tracing::debug!(?alpha_test_workgroup, ?blit_workgroup, ?normalization_workgroup, "blit pipelines created");
        Ok(Self {
            device,
            alpha_test,
            blit,
            normalization,
            alpha_test_workgroup,
            blit_workgroup,
            normalization_workgroup,
        })
    }

    /// Invocations per blit workgroup, the bound on the tap window.
    pub fn blit_invocations(&self) -> u32 {
        self.blit_workgroup.iter().product()
    }

    /// Build the table and check it against the dispatch limits.
    pub fn prepare(&self, ctx: &Context, state: &BlitState) -> Result<(PhaseSupportLut, ScratchLayout)> {
        let lut = PhaseSupportLut::build(state)?;
        let limits = self.device.limits();
        let config = crate::config::BlitConfig { blit_invocations: self.blit_invocations(), ..ctx.config().blit.clone() };
        check_window(&lut, &config, &limits)?;
        let layout = ScratchLayout::new(&lut, &limits);
        Ok((lut, layout))
    }

    /// Scratch bytes a blit of `state` needs.
    pub fn scratch_size(&self, ctx: &Context, state: &BlitState) -> Result<u64> {
        Ok(self.prepare(ctx, state)?.1.total)
    }

    /// Record the passes. The table must already be in scratch memory.
    pub fn record(
        &self,
        list: &mut CommandList,
        state: &BlitState,
        lut: &PhaseSupportLut,
        layout: &ScratchLayout,
        input: BufferRange,
        output: BufferRange,
        scratch: BufferRange,
    ) -> Result<()> {
        let lut_range = scratch.slice(layout.lut_offset, layout.lut_size)?;
        let histogram = scratch.slice(layout.histogram_offset, layout.histogram_size)?;
        let in_extent = state.input_extent.to_array();
        let out_extent = state.output_extent.to_array();
        let compute_rw = Access::SHADER_READ | Access::SHADER_WRITE;

        if state.coverage() {
            list.fill_buffer(histogram, 0);
            list.pipeline_barrier(
                Barrier::new(PipelineStage::TRANSFER, PipelineStage::COMPUTE_SHADER).buffer(
                    histogram,
                    Access::TRANSFER_WRITE,
                    compute_rw,
                ),
            );
            list.bind_compute_pipeline(self.alpha_test)
                .bind_buffer(BINDING_INPUT, input)
                .bind_buffer(BINDING_HISTOGRAM, histogram)
                .push_constants(&AlphaTestParams::new(state))
                .dispatch(dispatch_size(in_extent, self.alpha_test_workgroup));
            list.pipeline_barrier(
                Barrier::new(PipelineStage::COMPUTE_SHADER, PipelineStage::COMPUTE_SHADER).buffer(
                    histogram,
                    Access::SHADER_WRITE,
                    compute_rw,
                ),
            );
        }

        list.bind_compute_pipeline(self.blit)
            .bind_buffer(BINDING_INPUT, input)
            .bind_buffer(BINDING_OUTPUT, output)
            .bind_buffer(BINDING_LUT, lut_range)
            .bind_buffer(BINDING_HISTOGRAM, histogram)
            .push_constants(&BlitParams::new(state, lut))
            .dispatch(dispatch_size(out_extent, self.blit_workgroup));

        if state.coverage() {
            list.pipeline_barrier(
                Barrier::new(PipelineStage::COMPUTE_SHADER, PipelineStage::COMPUTE_SHADER)
                    .buffer(histogram, Access::SHADER_WRITE, compute_rw)
                    .buffer(output, Access::SHADER_WRITE, compute_rw),
            );
            list.bind_compute_pipeline(self.normalization)
                .bind_buffer(BINDING_OUTPUT, output)
                .bind_buffer(BINDING_HISTOGRAM, histogram)
                .push_constants(&NormalizationParams::new(state)?)
                .dispatch(dispatch_size(out_extent, self.normalization_workgroup));
        }
        Ok(())
    }

    /// Upload the table into `scratch`, record and submit on the compute queue.
    #[tracing::instrument(skip_all, fields(input = ?state.input_extent, output = ?state.output_extent, coverage = state.coverage()))]
    pub fn execute(
        &self,
        ctx: &Context,
        state: &BlitState,
        input: BufferRange,
        output: BufferRange,
        scratch: BufferRange,
    ) -> Result<FenceHandle> {
        let (lut, layout) = self.prepare(ctx, state)?;
        if scratch.size < layout.total {
            return Err(Error::range(format!("blit scratch needs {} bytes, range has {}", layout.total, scratch.size)));
        }
        let in_bytes = state.input_extent.texel_count() * TEXEL_BYTES;
        let out_bytes = state.output_extent.texel_count() * TEXEL_BYTES;
        if input.size < in_bytes || output.size < out_bytes {
            return Err(Error::range(format!(
                "image ranges hold {}/{} bytes, blit needs {in_bytes}/{out_bytes}",
                input.size, output.size
            )));
        }
        let table: Vec<u8> = bytemuck::cast_slice(&lut.pack()).to_vec();
        self.device.update_buffer_range_via_staging_buffer(
            ctx.queues().transfer,
            scratch.slice(layout.lut_offset, layout.lut_size)?,
            &table,
        )?;

        let mut list = CommandList::new("blit");
        self.record(
            &mut list,
            state,
            &lut,
            &layout,
            input.slice(0, in_bytes)?,
            output.slice(0, out_bytes)?,
            scratch,
        )?;
        self.device.submit(ctx.queues().compute, list)
    }
}

impl Drop for BlitPipelines {
    fn drop(&mut self) {
        for pipeline in [self.alpha_test, self.blit, self.normalization] {
            if let Err(e) = self.device.destroy_compute_pipeline(pipeline) {
                tracing::warn!("failed to destroy blit pipeline: {e}");
            }
        }
    }
}

struct Transient<'a> {
    device: &'a dyn Device,
    buffers: Vec<BufferHandle>,
}

impl Drop for Transient<'_> {
    fn drop(&mut self) {
        for buffer in self.buffers.drain(..) {
            if let Err(e) = self.device.destroy_buffer(buffer) {
                tracing::warn!(?buffer, "failed to release blit buffer: {e}");
            }
        }
    }
}

/// One-shot blit of linear texels: allocate, run, wait and read back.
pub fn blit_linear_blocking(
    ctx: &Context,
    pipelines: &BlitPipelines,
    state: &BlitState,
    input: &[[f32; 4]],
) -> Result<Vec<[f32; 4]>> {
    if input.len() as u64 != state.input_extent.texel_count() {
        return Err(Error::range(format!("{} input texels for {:?}", input.len(), state.input_extent)));
    }
    let device = ctx.device();
    let scratch_size = pipelines.scratch_size(ctx, state)?;
    let in_bytes = input.len() as u64 * TEXEL_BYTES;
    let out_bytes = state.output_extent.texel_count() * TEXEL_BYTES;

    let mut transient = Transient { device, buffers: Vec::with_capacity(3) };
    let input_buffer =
        device.create_buffer_with_data(&BufferDesc::new("blit input", in_bytes, INPUT_USAGE), bytemuck::cast_slice(input))?;
    transient.buffers.push(input_buffer);
    let output_buffer = device.create_buffer(&BufferDesc::new("blit output", out_bytes, OUTPUT_USAGE))?;
    transient.buffers.push(output_buffer);
    let scratch = device.create_buffer(&BufferDesc::new("blit scratch", scratch_size, SCRATCH_USAGE))?;
    transient.buffers.push(scratch);

    let fence = pipelines.execute(
        ctx,
        state,
        BufferRange::whole(input_buffer, in_bytes),
        BufferRange::whole(output_buffer, out_bytes),
        BufferRange::whole(scratch, scratch_size),
    )?;
    ctx.wait(fence)?;
    let bytes = device.read_buffer(BufferRange::whole(output_buffer, out_bytes))?;
    Ok(bytemuck::pod_collect_to_vec(&bytes))
}

/// One-shot blit of an image, encoding the result in `format`.
pub fn blit_blocking(
    ctx: &Context,
    pipelines: &BlitPipelines,
    state: &BlitState,
    input: &Image,
    format: TexelFormat,
) -> Result<Image> {
    if input.extent() != state.input_extent {
        return Err(Error::filter(format!("image is {:?}, state expects {:?}", input.extent(), state.input_extent)));
    }
    let texels = blit_linear_blocking(ctx, pipelines, state, &input.to_linear())?;
    Image::from_linear(state.output_extent, format, &texels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blit::cpu;
    use crate::blit::kernel::TriangleKernel;
    use crate::blit::state::WrapMode;
    use crate::config::Config;
    use crate::util::{sampling::XorShift32, Extent3};
    use crate::video::{HostDevice, QueueKind};

    fn host_context() -> (Arc<HostDevice>, Context) {
        let host = Arc::new(HostDevice::new());
        let ctx = Context::new(host.clone(), Config::default());
        (host, ctx)
    }

    fn noise(count: usize, seed: u32) -> Vec<[f32; 4]> {
        let mut rng = XorShift32::new(seed);
        (0..count).map(|_| [rng.next_f32(), rng.next_f32(), rng.next_f32(), rng.next_f32()]).collect()
    }

    #[test]
    fn test_host_matches_cpu_reference() {
        let (_, ctx) = host_context();
        let pipelines = BlitPipelines::new(&ctx).unwrap();
        let input = noise(31 * 17, 7);
        let state = BlitState::new(Extent3::d2(31, 17), Extent3::d2(12, 9))
            .with_kernel(Arc::new(TriangleKernel))
            .with_wrap(WrapMode::MirroredRepeat)
            .with_coverage(0.5);
        let reference = cpu::blit_linear(&state, &input).unwrap();
        let device = blit_linear_blocking(&ctx, &pipelines, &state, &input).unwrap();
        assert_eq!(device.len(), reference.texels.len());
        for (a, b) in device.iter().zip(&reference.texels) {
            for c in 0..4 {
                assert!((a[c] - b[c]).abs() < 1e-5, "{a:?} vs {b:?}");
            }
        }
    }

    #[test]
    fn test_recorded_passes_are_barriered() {
        let (host, ctx) = host_context();
        let pipelines = BlitPipelines::new(&ctx).unwrap();
        let state = BlitState::new(Extent3::d2(8, 8), Extent3::d2(4, 4)).with_coverage(0.5);
        let (lut, layout) = pipelines.prepare(&ctx, &state).unwrap();
        let input = host.create_buffer(&BufferDesc::new("in", 64 * 16, INPUT_USAGE)).unwrap();
        let output = host.create_buffer(&BufferDesc::new("out", 16 * 16, OUTPUT_USAGE)).unwrap();
        let scratch = host.create_buffer(&BufferDesc::new("scratch", layout.total, SCRATCH_USAGE)).unwrap();

        let mut list = CommandList::new("blit");
        pipelines
            .record(
                &mut list,
                &state,
                &lut,
                &layout,
                BufferRange::whole(input, 64 * 16),
                BufferRange::whole(output, 256),
                BufferRange::whole(scratch, layout.total),
            )
            .unwrap();
        let barriers = list.commands().iter().filter(|c| matches!(c, crate::video::Command::PipelineBarrier(_))).count();
        assert_eq!(barriers, 3);
        host.submit(QueueKind::Compute, list.clone()).unwrap();

        // dropping the barrier before normalization must be caught
        let mut broken = CommandList::new("blit without final barrier");
        let last_barrier = list
            .commands()
            .iter()
            .rposition(|c| matches!(c, crate::video::Command::PipelineBarrier(_)))
            .unwrap();
        for (i, c) in list.commands().iter().enumerate() {
            if i != last_barrier {
                broken.push(c.clone());
            }
        }
        let err = host.submit(QueueKind::Compute, broken).unwrap_err();
        assert!(matches!(err, Error::MissingBarrier { .. }), "{err}");
    }

    #[test]
    fn test_blocking_blit_releases_buffers() {
        let (host, ctx) = host_context();
        let pipelines = BlitPipelines::new(&ctx).unwrap();
        let state = BlitState::new(Extent3::d2(8, 8), Extent3::d2(4, 4)).with_coverage(0.5);
        let input = noise(64, 3);
        let before = host.live_buffers();
        blit_linear_blocking(&ctx, &pipelines, &state, &input).unwrap();
        assert_eq!(host.live_buffers(), before);

        // a hung compute queue still releases the transient buffers
        host.stall_queue(QueueKind::Compute);
        let err = blit_linear_blocking(&ctx, &pipelines, &state, &input).unwrap_err();
        assert!(err.is_timeout(), "{err}");
        assert_eq!(host.live_buffers(), before);
    }

    #[test]
    fn test_scratch_too_small() {
        let (host, ctx) = host_context();
        let pipelines = BlitPipelines::new(&ctx).unwrap();
        let state = BlitState::new(Extent3::d2(8, 8), Extent3::d2(4, 4)).with_coverage(0.5);
        let needed = pipelines.scratch_size(&ctx, &state).unwrap();
        let buffer = host.create_buffer(&BufferDesc::new("scratch", needed, SCRATCH_USAGE)).unwrap();
        let image = host.create_buffer(&BufferDesc::new("image", 64 * 16, INPUT_USAGE | OUTPUT_USAGE)).unwrap();
        let err = pipelines
            .execute(
                &ctx,
                &state,
                BufferRange::whole(image, 64 * 16),
                BufferRange::whole(image, 64 * 16),
                BufferRange::whole(buffer, needed - 4),
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRange(_)));
    }
}

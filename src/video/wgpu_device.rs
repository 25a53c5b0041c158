//! wgpu backend.
//!
//! One wgpu queue serves the graphics, compute and transfer queue kinds.
//! Push constants become a small uniform buffer at `@group(1) @binding(0)`.
//! wgpu tracks hazards itself, so a recorded barrier only ends the current
//! compute pass; the list is still validated like on every other backend.
//! Acceleration structures are not exposed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use wgpu::util::DeviceExt;

use crate::accel::{
    AccelerationStructureBuild, AccelerationStructureCreateParams, BuildGeometryInfo, BuildSizes,
};
use crate::util::{align_up, Error, Handle, Result, SlotArena};

use super::command::{Command, CommandList};
use super::device::{BufferInfo, Device};
use super::hazard::{self, UseResolver};
use super::shader::{BindingKind, ComputePipelineDesc};
use super::types::{
    AccelerationStructureHandle, BufferDesc, BufferHandle, BufferRange, BufferUsage, DeviceFeatures, DeviceLimits,
    FenceHandle, FenceStatus, PipelineHandle, QueueKind,
};

const PUSH_CONSTANT_GROUP: u32 = 1;

struct GpuBuffer {
    label: String,
    size: u64,
    usage: BufferUsage,
    buffer: wgpu::Buffer,
}

struct GpuPipeline {
    label: String,
    bindings: Vec<super::shader::BindingDesc>,
    push_constant_size: u32,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    push_layout: Option<wgpu::BindGroupLayout>,
}

struct GpuFence {
    submission: wgpu::SubmissionIndex,
    done: Arc<AtomicBool>,
}

/// Device backed by a wgpu adapter.
pub struct WgpuDevice {
    name: String,
    device: wgpu::Device,
    queue: wgpu::Queue,
    limits: DeviceLimits,
    staging_timeout: Duration,
    buffers: RwLock<SlotArena<GpuBuffer>>,
    pipelines: RwLock<SlotArena<GpuPipeline>>,
    fences: RwLock<SlotArena<GpuFence>>,
}

fn to_wgpu_usage(usage: BufferUsage) -> wgpu::BufferUsages {
    let mut out = wgpu::BufferUsages::empty();
    let map = [
        (BufferUsage::TRANSFER_SRC, wgpu::BufferUsages::COPY_SRC),
        (BufferUsage::TRANSFER_DST, wgpu::BufferUsages::COPY_DST),
        (BufferUsage::UNIFORM, wgpu::BufferUsages::UNIFORM),
        (BufferUsage::STORAGE, wgpu::BufferUsages::STORAGE),
        (BufferUsage::INDEX, wgpu::BufferUsages::INDEX),
        (BufferUsage::VERTEX, wgpu::BufferUsages::VERTEX),
        (BufferUsage::INDIRECT, wgpu::BufferUsages::INDIRECT),
        (BufferUsage::MAP_READ, wgpu::BufferUsages::MAP_READ),
        (BufferUsage::MAP_WRITE, wgpu::BufferUsages::MAP_WRITE),
        (BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY, wgpu::BufferUsages::STORAGE),
        (BufferUsage::ACCELERATION_STRUCTURE_STORAGE, wgpu::BufferUsages::STORAGE),
    ];
    for (ours, theirs) in map {
        if usage.contains(ours) {
            out |= theirs;
        }
    }
    if out.is_empty() {
        out = wgpu::BufferUsages::STORAGE;
    }
    out
}

impl WgpuDevice {
    /// Open the default adapter without a surface.
    pub fn new_headless() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::from_env_or_default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| Error::Gpu(format!("no adapter: {e}")))?;
        let info = adapter.get_info();
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("nabla"),
            required_limits: adapter.limits(),
            ..Default::default()
        }))
        .map_err(|e| Error::Gpu(format!("request_device failed: {e}")))?;

        let l = device.limits();
        let limits = DeviceLimits {
            max_compute_workgroup_size: [
                l.max_compute_workgroup_size_x,
                l.max_compute_workgroup_size_y,
                l.max_compute_workgroup_size_z,
            ],
            max_compute_workgroup_invocations: l.max_compute_invocations_per_workgroup,
            max_compute_shared_memory_size: l.max_compute_workgroup_storage_size,
            max_compute_workgroups_per_dimension: l.max_compute_workgroups_per_dimension,
            max_storage_buffer_range: l.max_storage_buffer_binding_size as u64,
            max_buffer_size: l.max_buffer_size,
            min_storage_buffer_offset_alignment: l.min_storage_buffer_offset_alignment,
            max_push_constants_size: 128,
        };
        tracing::info!(adapter = %info.name, backend = ?info.backend, "wgpu device opened");
        Ok(Self {
            name: format!("wgpu ({})", info.name),
            device,
            queue,
            limits,
            staging_timeout: Duration::from_secs(5),
            buffers: RwLock::new(SlotArena::new()),
            pipelines: RwLock::new(SlotArena::new()),
            fences: RwLock::new(SlotArena::new()),
        })
    }

    pub fn with_staging_timeout(mut self, timeout: Duration) -> Self {
        self.staging_timeout = timeout;
        self
    }

    fn invalid<T>(kind: &'static str, handle: Handle<T>) -> Error {
        Error::InvalidHandle { kind, index: handle.index(), generation: handle.generation() }
    }

    fn check_aligned(range: &BufferRange, what: &str) -> Result<()> {
        if range.offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 || range.size % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(Error::range(format!("{what} {}+{} is not 4-byte aligned", range.offset, range.size)));
        }
        Ok(())
    }

    fn usage(&self, buffer: BufferHandle) -> Result<(String, BufferUsage, u64)> {
        let buffers = self.buffers.read();
        let b = buffers.get(buffer.cast()).ok_or_else(|| Self::invalid("buffer", buffer))?;
        Ok((b.label.clone(), b.usage, b.size))
    }

    fn wait_submission(&self, submission: wgpu::SubmissionIndex, timeout: Duration) -> Result<FenceStatus> {
        match self.device.poll(wgpu::PollType::Wait { submission_index: Some(submission), timeout: Some(timeout) }) {
            Ok(_) => Ok(FenceStatus::Signaled),
            Err(wgpu::PollError::Timeout) => Ok(FenceStatus::Timeout),
            Err(e) => Err(Error::Gpu(e.to_string())),
        }
    }

    fn bind_group(
        &self,
        pipeline: &GpuPipeline,
        bound: &std::collections::BTreeMap<u32, BufferRange>,
        buffers: &SlotArena<GpuBuffer>,
    ) -> Result<wgpu::BindGroup> {
        let mut entries = Vec::with_capacity(pipeline.bindings.len());
        for b in &pipeline.bindings {
            let range = bound.get(&b.binding).ok_or_else(|| Error::Shader {
                name: pipeline.label.clone(),
                reason: format!("binding {} has no buffer", b.binding),
            })?;
            let buffer = buffers.get(range.buffer.cast()).ok_or_else(|| Self::invalid("buffer", range.buffer))?;
            let required = if b.kind == BindingKind::Uniform { BufferUsage::UNIFORM } else { BufferUsage::STORAGE };
            buffer.usage.require(required, &format!("binding {} '{}'", b.binding, buffer.label))?;
            entries.push(wgpu::BindGroupEntry {
                binding: b.binding,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &buffer.buffer,
                    offset: range.offset,
                    size: wgpu::BufferSize::new(range.size),
                }),
            });
        }
        Ok(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&pipeline.label),
            layout: &pipeline.layout,
            entries: &entries,
        }))
    }
}

type EncodedDispatch = (PipelineHandle, wgpu::BindGroup, Option<wgpu::BindGroup>, [u32; 3]);

enum Segment {
    Compute(Vec<EncodedDispatch>),
    Fill { range: BufferRange, value: u32 },
    Copy { src: BufferRange, dst: BufferHandle, dst_offset: u64 },
}

impl UseResolver for WgpuDevice {
    fn binding_kind(&self, pipeline: PipelineHandle, binding: u32) -> Result<Option<BindingKind>> {
        let pipelines = self.pipelines.read();
        let p = pipelines.get(pipeline.cast()).ok_or_else(|| Self::invalid("pipeline", pipeline))?;
        Ok(p.bindings.iter().find(|b| b.binding == binding).map(|b| b.kind))
    }

    fn structure_range(&self, _structure: AccelerationStructureHandle) -> Result<BufferRange> {
        Err(Error::Unsupported("acceleration structures on the wgpu backend".into()))
    }

    fn build_dependencies(&self, _build: &AccelerationStructureBuild) -> Result<Vec<AccelerationStructureHandle>> {
        Err(Error::Unsupported("acceleration structures on the wgpu backend".into()))
    }
}

impl Device for WgpuDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn features(&self) -> DeviceFeatures {
        DeviceFeatures::default()
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle> {
        desc.usage.validate()?;
        if desc.size == 0 || desc.size > self.limits.max_buffer_size {
            return Err(Error::range(format!("buffer '{}' size {} is outside (0, {}]", desc.label, desc.size, self.limits.max_buffer_size)));
        }
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&desc.label),
            size: align_up(desc.size, wgpu::COPY_BUFFER_ALIGNMENT),
            usage: to_wgpu_usage(desc.usage),
            mapped_at_creation: false,
        });
        let handle = self.buffers.write().insert(GpuBuffer {
            label: desc.label.clone(),
            size: desc.size,
            usage: desc.usage,
            buffer,
        });
        Ok(handle.cast())
    }

    fn create_buffer_with_data(&self, desc: &BufferDesc, data: &[u8]) -> Result<BufferHandle> {
        desc.usage.validate()?;
        if data.len() as u64 > desc.size || desc.size == 0 {
            return Err(Error::range(format!("{} initial bytes for buffer '{}' of {}", data.len(), desc.label, desc.size)));
        }
        let mut contents = data.to_vec();
        contents.resize(align_up(desc.size, wgpu::COPY_BUFFER_ALIGNMENT) as usize, 0);
        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(&desc.label),
            contents: &contents,
            usage: to_wgpu_usage(desc.usage),
        });
        let handle = self.buffers.write().insert(GpuBuffer {
            label: desc.label.clone(),
            size: desc.size,
            usage: desc.usage,
            buffer,
        });
        Ok(handle.cast())
    }

    fn destroy_buffer(&self, buffer: BufferHandle) -> Result<()> {
        let b = self.buffers.write().remove(buffer.cast()).ok_or_else(|| Self::invalid("buffer", buffer))?;
        b.buffer.destroy();
        Ok(())
    }

    fn buffer_info(&self, buffer: BufferHandle) -> Result<BufferInfo> {
        let (label, usage, size) = self.usage(buffer)?;
        Ok(BufferInfo { label, size, usage })
    }

    fn buffer_device_address(&self, _buffer: BufferHandle) -> Result<u64> {
        Err(Error::Unsupported("buffer device addresses on the wgpu backend".into()))
    }

    fn update_buffer_range_via_staging_buffer(&self, _queue: QueueKind, range: BufferRange, data: &[u8]) -> Result<()> {
        if data.len() as u64 != range.size {
            return Err(Error::range(format!("{} bytes for a staging upload of {}", data.len(), range.size)));
        }
        Self::check_aligned(&range, "staging upload")?;
        let (label, usage, size) = self.usage(range.buffer)?;
        usage.require(BufferUsage::TRANSFER_DST, &format!("upload target '{label}'"))?;
        if range.end() > align_up(size, wgpu::COPY_BUFFER_ALIGNMENT) {
            return Err(Error::range(format!("upload past the end of '{label}'")));
        }
        if data.is_empty() {
            return Ok(());
        }
        let staging = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("staging"),
            contents: data,
            usage: wgpu::BufferUsages::COPY_SRC,
        });
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("staging upload") });
        {
            let buffers = self.buffers.read();
            let dst = buffers.get(range.buffer.cast()).ok_or_else(|| Self::invalid("buffer", range.buffer))?;
            encoder.copy_buffer_to_buffer(&staging, 0, &dst.buffer, range.offset, range.size);
        }
        let submission = self.queue.submit(Some(encoder.finish()));
        match self.wait_submission(submission, self.staging_timeout)? {
            FenceStatus::Signaled => Ok(()),
            FenceStatus::Timeout => Err(Error::FenceTimeout { timeout_ms: self.staging_timeout.as_millis() as u64 }),
        }
    }

    fn read_buffer(&self, range: BufferRange) -> Result<Vec<u8>> {
        let (label, usage, size) = self.usage(range.buffer)?;
        usage.require(BufferUsage::TRANSFER_SRC, &format!("readback source '{label}'"))?;
        if range.end() > size {
            return Err(Error::range(format!("readback {}..{} outside '{label}' of {size} bytes", range.offset, range.end())));
        }
        if range.size == 0 {
            return Ok(Vec::new());
        }
        // copies move whole words; the allocation is padded to cover them
        let start = range.offset & !(wgpu::COPY_BUFFER_ALIGNMENT - 1);
        let end = align_up(range.end(), wgpu::COPY_BUFFER_ALIGNMENT);
        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size: end - start,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("readback") });
        {
            let buffers = self.buffers.read();
            let src = buffers.get(range.buffer.cast()).ok_or_else(|| Self::invalid("buffer", range.buffer))?;
            encoder.copy_buffer_to_buffer(&src.buffer, start, &readback, 0, end - start);
        }
        self.queue.submit(Some(encoder.finish()));

        let slice = readback.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| Error::Gpu(e.to_string()))?;
        rx.recv()
            .map_err(|_| Error::Gpu("map_async callback dropped".into()))?
            .map_err(|e| Error::Gpu(e.to_string()))?;
        let skip = (range.offset - start) as usize;
        let out = slice.get_mapped_range()[skip..skip + range.size as usize].to_vec();
        readback.unmap();
        Ok(out)
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc) -> Result<PipelineHandle> {
        desc.shader.validate(&self.limits)?;
        let mut entries = Vec::with_capacity(desc.bindings.len());
        for b in &desc.bindings {
            let ty = match b.kind {
                BindingKind::StorageRead => wgpu::BufferBindingType::Storage { read_only: true },
                BindingKind::StorageReadWrite => wgpu::BufferBindingType::Storage { read_only: false },
                BindingKind::Uniform => wgpu::BufferBindingType::Uniform,
                BindingKind::AccelerationStructure => {
                    return Err(Error::Unsupported("acceleration structure bindings on the wgpu backend".into()));
                }
            };
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: b.binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer { ty, has_dynamic_offset: false, min_binding_size: None },
                count: None,
            });
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&desc.shader.name),
            source: wgpu::ShaderSource::Wgsl(desc.shader.source.as_str().into()),
        });
        let layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(&desc.label),
            entries: &entries,
        });
        let push_layout = (desc.push_constant_size > 0).then(|| {
            self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("push constants"),
                entries: &[wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                }],
            })
        });
        let mut layouts = vec![&layout];
        layouts.extend(push_layout.as_ref());
        let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(&desc.label),
            bind_group_layouts: &layouts,
            push_constant_ranges: &[],
        });
        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(&desc.label),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some(desc.shader.entry_point.as_str()),
            compilation_options: Default::default(),
            cache: None,
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(Error::Shader { name: desc.shader.name.clone(), reason: err.to_string() });
        }
        let handle = self.pipelines.write().insert(GpuPipeline {
            label: desc.label.clone(),
            bindings: desc.bindings.clone(),
            push_constant_size: desc.push_constant_size,
            pipeline,
            layout,
            push_layout,
        });
        tracing::debug!(label = %desc.label, "compute pipeline created");
        Ok(handle.cast())
    }

    fn destroy_compute_pipeline(&self, pipeline: PipelineHandle) -> Result<()> {
        self.pipelines.write().remove(pipeline.cast()).map(|_| ()).ok_or_else(|| Self::invalid("pipeline", pipeline))
    }

    fn acceleration_structure_build_sizes(&self, _info: &BuildGeometryInfo, _counts: &[u32]) -> Result<BuildSizes> {
        Err(Error::Unsupported("acceleration structures on the wgpu backend".into()))
    }

    fn create_acceleration_structure(&self, _params: &AccelerationStructureCreateParams) -> Result<AccelerationStructureHandle> {
        Err(Error::Unsupported("acceleration structures on the wgpu backend".into()))
    }

    fn destroy_acceleration_structure(&self, structure: AccelerationStructureHandle) -> Result<()> {
        Err(Self::invalid("acceleration structure", structure))
    }

    fn acceleration_structure_reference(&self, structure: AccelerationStructureHandle) -> Result<u64> {
        Err(Self::invalid("acceleration structure", structure))
    }

    #[tracing::instrument(skip_all, fields(label = list.label(), commands = list.len(), ?queue))]
    fn submit(&self, queue: QueueKind, list: CommandList) -> Result<FenceHandle> {
        hazard::validate(&list, self)?;

        let mut segments: Vec<Segment> = Vec::new();
        {
            let pipelines = self.pipelines.read();
            let buffers = self.buffers.read();
            let mut pipeline: Option<PipelineHandle> = None;
            let mut bound = std::collections::BTreeMap::new();
            let mut push_constants: Vec<u8> = Vec::new();
            let mut pass: Vec<EncodedDispatch> = Vec::new();
            let flush = |pass: &mut Vec<EncodedDispatch>, segments: &mut Vec<Segment>| {
                if !pass.is_empty() {
                    segments.push(Segment::Compute(std::mem::take(pass)));
                }
            };
            for command in list.commands() {
                match command {
                    Command::BindComputePipeline(p) => pipeline = Some(*p),
                    Command::BindBuffer { binding, range } => {
                        bound.insert(*binding, *range);
                    }
                    Command::BindAccelerationStructure { .. } | Command::BuildAccelerationStructures(_) => {
                        return Err(Error::Unsupported("acceleration structures on the wgpu backend".into()));
                    }
                    Command::PushConstants(bytes) => push_constants = bytes.clone(),
                    Command::Dispatch(groups) => {
                        let handle = pipeline.ok_or_else(|| Error::other("dispatch without a bound compute pipeline"))?;
                        let p = pipelines.get(handle.cast()).ok_or_else(|| Self::invalid("pipeline", handle))?;
                        let group = self.bind_group(p, &bound, &buffers)?;
                        let push = match &p.push_layout {
                            Some(layout) => {
                                if push_constants.len() < p.push_constant_size as usize {
                                    return Err(Error::Shader {
                                        name: p.label.clone(),
                                        reason: format!("expects {} push-constant bytes, {} pushed", p.push_constant_size, push_constants.len()),
                                    });
                                }
                                let mut bytes = push_constants.clone();
                                bytes.resize(align_up(bytes.len() as u64, 16) as usize, 0);
                                let uniform = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                                    label: Some("push constants"),
                                    contents: &bytes,
                                    usage: wgpu::BufferUsages::UNIFORM,
                                });
                                Some(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                                    label: Some("push constants"),
                                    layout,
                                    entries: &[wgpu::BindGroupEntry { binding: 0, resource: uniform.as_entire_binding() }],
                                }))
                            }
                            None => None,
                        };
                        pass.push((handle, group, push, *groups));
                    }
                    Command::PipelineBarrier(_) => flush(&mut pass, &mut segments),
                    Command::FillBuffer { range, value } => {
                        flush(&mut pass, &mut segments);
                        Self::check_aligned(range, "fill")?;
                        let b = buffers.get(range.buffer.cast()).ok_or_else(|| Self::invalid("buffer", range.buffer))?;
                        b.usage.require(BufferUsage::TRANSFER_DST, &format!("fill target '{}'", b.label))?;
                        segments.push(Segment::Fill { range: *range, value: *value });
                    }
                    Command::CopyBuffer { src, dst, dst_offset } => {
                        flush(&mut pass, &mut segments);
                        Self::check_aligned(src, "copy")?;
                        segments.push(Segment::Copy { src: *src, dst: *dst, dst_offset: *dst_offset });
                    }
                }
            }
            flush(&mut pass, &mut segments);
        }

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(list.label()) });
        {
            let pipelines = self.pipelines.read();
            let buffers = self.buffers.read();
            for segment in &segments {
                match segment {
                    Segment::Compute(dispatches) => {
                        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                            label: Some(list.label()),
                            timestamp_writes: None,
                        });
                        for (handle, group, push, groups) in dispatches {
                            let p = pipelines.get(handle.cast()).ok_or_else(|| Self::invalid("pipeline", *handle))?;
                            pass.set_pipeline(&p.pipeline);
                            pass.set_bind_group(0, group, &[]);
                            if let Some(push) = push {
                                pass.set_bind_group(PUSH_CONSTANT_GROUP, push, &[]);
                            }
                            pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
                        }
                    }
                    Segment::Fill { range, value } => {
                        let b = buffers.get(range.buffer.cast()).ok_or_else(|| Self::invalid("buffer", range.buffer))?;
                        if *value == 0 {
                            encoder.clear_buffer(&b.buffer, range.offset, Some(range.size));
                        } else {
                            let words = vec![*value; (range.size / 4) as usize];
                            let src = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                                label: Some("fill"),
                                contents: bytemuck::cast_slice(&words),
                                usage: wgpu::BufferUsages::COPY_SRC,
                            });
                            encoder.copy_buffer_to_buffer(&src, 0, &b.buffer, range.offset, range.size);
                        }
                    }
                    Segment::Copy { src, dst, dst_offset } => {
                        let s = buffers.get(src.buffer.cast()).ok_or_else(|| Self::invalid("buffer", src.buffer))?;
                        let d = buffers.get(dst.cast()).ok_or_else(|| Self::invalid("buffer", *dst))?;
                        s.usage.require(BufferUsage::TRANSFER_SRC, &format!("copy source '{}'", s.label))?;
                        d.usage.require(BufferUsage::TRANSFER_DST, &format!("copy target '{}'", d.label))?;
                        encoder.copy_buffer_to_buffer(&s.buffer, src.offset, &d.buffer, *dst_offset, src.size);
                    }
                }
            }
        }
        let submission = self.queue.submit(Some(encoder.finish()));
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        self.queue.on_submitted_work_done(move || flag.store(true, Ordering::Release));

        Ok(self.fences.write().insert(GpuFence { submission, done }).cast())
    }

    fn fence_status(&self, fence: FenceHandle) -> Result<FenceStatus> {
        let _ = self.device.poll(wgpu::PollType::Poll);
        let fences = self.fences.read();
        let f = fences.get(fence.cast()).ok_or_else(|| Self::invalid("fence", fence))?;
        Ok(if f.done.load(Ordering::Acquire) { FenceStatus::Signaled } else { FenceStatus::Timeout })
    }

    fn wait_for_fence(&self, fence: FenceHandle, timeout: Duration) -> Result<FenceStatus> {
        let submission = {
            let fences = self.fences.read();
            let f = fences.get(fence.cast()).ok_or_else(|| Self::invalid("fence", fence))?;
            if f.done.load(Ordering::Acquire) {
                return Ok(FenceStatus::Signaled);
            }
            f.submission.clone()
        };
        self.wait_submission(submission, timeout)
    }
}

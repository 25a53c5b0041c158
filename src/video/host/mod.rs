//! Software device.
//!
//! Buffers are plain byte vectors, compute shaders run through their
//! [`HostKernel`] and acceleration structures are built by
//! [`crate::accel::software`] into their backing ranges. Submissions execute
//! synchronously unless their queue is stalled with [`HostDevice::stall_queue`];
//! work on a stalled queue stays pending (and its fences unsignaled) until
//! [`HostDevice::resume_queue`].

mod dispatch;

pub use dispatch::*;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::accel::layout::{self, StructureImage};
use crate::accel::software::{self, BuildSource};
use crate::accel::{
    AccelerationStructureBuild, AccelerationStructureCreateParams, AccelerationStructureType, BuildGeometryInfo,
    BuildSizes, GeometryData, Instance, SceneView,
};
use crate::accel::bvh::BvhOptions;
use crate::config::BvhConfig;
use crate::util::{Aabb, Error, Handle, Result, SlotArena};

use super::command::{Command, CommandList};
use super::device::{block_on_fence, BufferInfo, Device};
use super::hazard::{self, UseResolver};
use super::shader::{BindingKind, ComputePipelineDesc};
use super::types::{
    AccelerationStructureHandle, BufferDesc, BufferHandle, BufferRange, BufferUsage, DeviceFeatures, DeviceLimits,
    FenceHandle, FenceStatus, PipelineHandle, QueueKind,
};

const REFERENCE_TAG: u64 = 1 << 63;
const ADDRESS_BASE: u64 = 1 << 32;

struct HostBuffer {
    label: String,
    usage: BufferUsage,
    address: u64,
    data: Vec<u8>,
}

struct HostStructure {
    ty: AccelerationStructureType,
    range: BufferRange,
    built: bool,
}

struct HostFence {
    signaled: bool,
}

#[derive(Default)]
struct QueueState {
    stalled: bool,
    pending: VecDeque<(FenceHandle, CommandList)>,
}

/// CPU device implementing [`Device`].
pub struct HostDevice {
    limits: DeviceLimits,
    bvh: BvhConfig,
    staging_wait: (Duration, u32),
    buffers: RwLock<SlotArena<HostBuffer>>,
    pipelines: RwLock<SlotArena<ComputePipelineDesc>>,
    structures: RwLock<SlotArena<HostStructure>>,
    fences: RwLock<SlotArena<HostFence>>,
    queues: Mutex<HashMap<QueueKind, QueueState>>,
    next_address: Mutex<u64>,
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDevice {
    pub fn new() -> Self {
        Self {
            limits: DeviceLimits::default(),
            bvh: BvhConfig::default(),
            staging_wait: (Duration::from_millis(100), 3),
            buffers: RwLock::new(SlotArena::new()),
            pipelines: RwLock::new(SlotArena::new()),
            structures: RwLock::new(SlotArena::new()),
            fences: RwLock::new(SlotArena::new()),
            queues: Mutex::new(QueueKind::ALL.iter().map(|q| (*q, QueueState::default())).collect()),
            next_address: Mutex::new(ADDRESS_BASE),
        }
    }

    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_bvh_config(mut self, bvh: BvhConfig) -> Self {
        self.bvh = bvh;
        self
    }

    /// Timeout and attempts used by the blocking staging upload.
    pub fn with_staging_wait(mut self, timeout: Duration, attempts: u32) -> Self {
        self.staging_wait = (timeout, attempts);
        self
    }

    /// Buffers created and not yet destroyed.
    pub fn live_buffers(&self) -> usize {
        self.buffers.read().len()
    }

    /// Hold back every later submission on `queue`.
    pub fn stall_queue(&self, queue: QueueKind) {
        self.queues.lock().entry(queue).or_default().stalled = true;
        tracing::debug!(?queue, "queue stalled");
    }

    /// Execute the work held back on `queue`, in submission order.
    pub fn resume_queue(&self, queue: QueueKind) -> Result<()> {
        let pending = {
            let mut queues = self.queues.lock();
            let state = queues.entry(queue).or_default();
            state.stalled = false;
            std::mem::take(&mut state.pending)
        };
        tracing::debug!(?queue, pending = pending.len(), "queue resumed");
        for (fence, list) in pending {
            self.execute(&list)?;
            self.signal(fence);
        }
        Ok(())
    }

    pub fn pending_submissions(&self, queue: QueueKind) -> usize {
        self.queues.lock().get(&queue).map_or(0, |q| q.pending.len())
    }

    fn signal(&self, fence: FenceHandle) {
        if let Some(f) = self.fences.write().get_mut(fence.cast()) {
            f.signaled = true;
        }
    }

    fn invalid<T>(kind: &'static str, handle: Handle<T>) -> Error {
        Error::InvalidHandle { kind, index: handle.index(), generation: handle.generation() }
    }

    fn check_range(&self, range: &BufferRange) -> Result<()> {
        let buffers = self.buffers.read();
        let buffer = buffers.get(range.buffer.cast()).ok_or_else(|| Self::invalid("buffer", range.buffer))?;
        if range.end() > buffer.data.len() as u64 {
            return Err(Error::range(format!(
                "{}..{} outside buffer '{}' of {} bytes",
                range.offset,
                range.end(),
                buffer.label,
                buffer.data.len()
            )));
        }
        Ok(())
    }

    fn read_range(&self, range: BufferRange) -> Result<Vec<u8>> {
        self.check_range(&range)?;
        let buffers = self.buffers.read();
        let buffer = buffers.get(range.buffer.cast()).ok_or_else(|| Self::invalid("buffer", range.buffer))?;
        Ok(buffer.data[range.offset as usize..range.end() as usize].to_vec())
    }

    fn write_range(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        self.check_range(&BufferRange::new(buffer, offset, data.len() as u64))?;
        let mut buffers = self.buffers.write();
        let b = buffers.get_mut(buffer.cast()).ok_or_else(|| Self::invalid("buffer", buffer))?;
        b.data[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn usage(&self, buffer: BufferHandle) -> Result<(String, BufferUsage)> {
        let buffers = self.buffers.read();
        let b = buffers.get(buffer.cast()).ok_or_else(|| Self::invalid("buffer", buffer))?;
        Ok((b.label.clone(), b.usage))
    }

    fn structure_for_reference(&self, reference: u64) -> Result<AccelerationStructureHandle> {
        if reference & REFERENCE_TAG == 0 {
            return Err(Error::other(format!("{reference:#x} is not an acceleration structure reference")));
        }
        Ok(AccelerationStructureHandle::from_bits(reference & !REFERENCE_TAG))
    }

    /// Decode a built structure from its backing range.
    fn load_structure(&self, handle: AccelerationStructureHandle) -> Result<StructureImage> {
        let range = {
            let structures = self.structures.read();
            let s = structures.get(handle.cast()).ok_or_else(|| Self::invalid("acceleration structure", handle))?;
            if !s.built {
                return Err(Error::UnbuiltDependency {
                    structure: "ray query".into(),
                    dependency: format!("{} {handle:?}", s.ty.name()),
                });
            }
            s.range
        };
        StructureImage::decode(&self.read_range(range)?)
    }

    fn load_scene(&self, tlas: AccelerationStructureHandle) -> Result<SceneView> {
        let top = self.load_structure(tlas)?;
        let mut bottom = HashMap::new();
        if let layout::Records::Instances(instances) = &top.records {
            for record in instances {
                let reference = record.instance.acceleration_structure_reference;
                if let std::collections::hash_map::Entry::Vacant(slot) = bottom.entry(reference) {
                    let handle = self.structure_for_reference(reference)?;
                    slot.insert(Arc::new(self.load_structure(handle)?));
                }
            }
        }
        SceneView::new(Arc::new(top), bottom)
    }

    fn instance_references(&self, build: &AccelerationStructureBuild) -> Result<Vec<u64>> {
        let mut refs = Vec::new();
        for (geometry, range) in build.info.geometries.iter().zip(&build.ranges) {
            if let GeometryData::Instances { data } = &geometry.data {
                let bytes = self.read_range(*data)?;
                for i in 0..range.primitive_count as usize {
                    let offset = range.primitive_offset as usize + i * Instance::STRIDE as usize;
                    let Some(raw) = bytes.get(offset..offset + Instance::STRIDE as usize) else {
                        return Err(Error::range(format!("instance {i} outside instance data")));
                    };
                    let instance: Instance = bytemuck::pod_read_unaligned(raw);
                    if instance.acceleration_structure_reference != 0 {
                        refs.push(instance.acceleration_structure_reference);
                    }
                }
            }
        }
        Ok(refs)
    }

    fn execute(&self, list: &CommandList) -> Result<()> {
        let mut pipeline: Option<PipelineHandle> = None;
        let mut buffers: BTreeMap<u32, BufferRange> = BTreeMap::new();
        let mut structures: BTreeMap<u32, AccelerationStructureHandle> = BTreeMap::new();
        let mut push_constants: Vec<u8> = Vec::new();
        for command in list.commands() {
            match command {
                Command::BindComputePipeline(p) => pipeline = Some(*p),
                Command::BindBuffer { binding, range } => {
                    buffers.insert(*binding, *range);
                }
                Command::BindAccelerationStructure { binding, structure } => {
                    structures.insert(*binding, *structure);
                }
                Command::PushConstants(bytes) => push_constants = bytes.clone(),
                Command::Dispatch(groups) => {
                    let p = pipeline.ok_or_else(|| Error::other("dispatch without a bound compute pipeline"))?;
                    self.dispatch(p, *groups, &buffers, &structures, &push_constants)?;
                }
                Command::PipelineBarrier(_) => {}
                Command::FillBuffer { range, value } => {
                    let (label, usage) = self.usage(range.buffer)?;
                    usage.require(BufferUsage::TRANSFER_DST, &format!("fill target '{label}'"))?;
                    if range.offset % 4 != 0 || range.size % 4 != 0 {
                        return Err(Error::range("fill range must be 4-byte aligned"));
                    }
                    let bytes: Vec<u8> = std::iter::repeat_n(value.to_le_bytes(), (range.size / 4) as usize)
                        .flatten()
                        .collect();
                    self.write_range(range.buffer, range.offset, &bytes)?;
                }
                Command::CopyBuffer { src, dst, dst_offset } => {
                    let (src_label, src_usage) = self.usage(src.buffer)?;
                    src_usage.require(BufferUsage::TRANSFER_SRC, &format!("copy source '{src_label}'"))?;
                    let (dst_label, dst_usage) = self.usage(*dst)?;
                    dst_usage.require(BufferUsage::TRANSFER_DST, &format!("copy target '{dst_label}'"))?;
                    let bytes = self.read_range(*src)?;
                    self.write_range(*dst, *dst_offset, &bytes)?;
                }
                Command::BuildAccelerationStructures(builds) => {
                    for build in builds {
                        self.execute_build(build)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn dispatch(
        &self,
        pipeline: PipelineHandle,
        groups: [u32; 3],
        buffers: &BTreeMap<u32, BufferRange>,
        structures: &BTreeMap<u32, AccelerationStructureHandle>,
        push_constants: &[u8],
    ) -> Result<()> {
        let desc = self
            .pipelines
            .read()
            .get(pipeline.cast())
            .cloned()
            .ok_or_else(|| Self::invalid("pipeline", pipeline))?;
        let kernel = desc.shader.host.clone().ok_or_else(|| {
            Error::Unsupported(format!("pipeline '{}' has no host implementation", desc.label))
        })?;
        let max = self.limits.max_compute_workgroups_per_dimension;
        if groups.iter().any(|&g| g > max) {
            return Err(Error::WorkgroupLimit { what: "count".into(), requested: groups.into_iter().max().unwrap_or(0), limit: max });
        }
        if (desc.push_constant_size as usize) > push_constants.len() {
            return Err(Error::Shader {
                name: desc.label.clone(),
                reason: format!("expects {} push-constant bytes, {} pushed", desc.push_constant_size, push_constants.len()),
            });
        }

        let mut bound = BTreeMap::new();
        for b in &desc.bindings {
            let resource = match b.kind {
                BindingKind::AccelerationStructure => {
                    let s = structures.get(&b.binding).ok_or_else(|| Error::Shader {
                        name: desc.label.clone(),
                        reason: format!("binding {} has no acceleration structure", b.binding),
                    })?;
                    BoundResource::Scene(Arc::new(self.load_scene(*s)?))
                }
                kind => {
                    let range = buffers.get(&b.binding).ok_or_else(|| Error::Shader {
                        name: desc.label.clone(),
                        reason: format!("binding {} has no buffer", b.binding),
                    })?;
                    let (label, usage) = self.usage(range.buffer)?;
                    let required = if kind == BindingKind::Uniform { BufferUsage::UNIFORM } else { BufferUsage::STORAGE };
                    usage.require(required, &format!("binding {} '{label}'", b.binding))?;
                    if range.offset % self.limits.min_storage_buffer_offset_alignment as u64 != 0 {
                        return Err(Error::range(format!("binding {} offset {} is misaligned", b.binding, range.offset)));
                    }
                    BoundResource::Buffer { kind, data: self.read_range(*range)?, dirty: false }
                }
            };
            bound.insert(b.binding, resource);
        }

        let mut ctx = HostDispatch::new(&desc.label, groups, desc.shader.workgroup_size, push_constants, bound);
        kernel.dispatch(&mut ctx)?;

        for (binding, resource) in ctx.bindings {
            if let BoundResource::Buffer { data, dirty: true, .. } = resource {
                if let Some(range) = buffers.get(&binding) {
                    self.write_range(range.buffer, range.offset, &data)?;
                }
            }
        }
        Ok(())
    }

    fn execute_build(&self, build: &AccelerationStructureBuild) -> Result<()> {
        let info = &build.info;
        let dst = info.dst.ok_or_else(|| Error::range("build without a destination structure"))?;
        let dst_range = {
            let structures = self.structures.read();
            let s = structures.get(dst.cast()).ok_or_else(|| Self::invalid("acceleration structure", dst))?;
            if s.ty != info.ty {
                return Err(Error::range(format!("{} build into a {} structure", info.ty.name(), s.ty.name())));
            }
            s.range
        };
        // referenced bottom-level structures must already be built
        for reference in self.instance_references(build)? {
            let handle = self.structure_for_reference(reference)?;
            let structures = self.structures.read();
            let s = structures.get(handle.cast()).ok_or_else(|| Self::invalid("acceleration structure", handle))?;
            if !s.built {
                return Err(Error::UnbuiltDependency {
                    structure: format!("{} {dst:?}", info.ty.name()),
                    dependency: format!("{} {handle:?}", s.ty.name()),
                });
            }
        }

        let options = BvhOptions::from_flags(info.flags, &self.bvh);
        let built = software::build(info, &build.ranges, self, options)?;
        let bytes = built.image.encode();
        if bytes.len() as u64 > dst_range.size {
            return Err(Error::StructureTooSmall { required: bytes.len() as u64, actual: dst_range.size });
        }
        if let Some(scratch) = info.scratch {
            let n = built.scratch.len().min(scratch.size as usize);
            self.write_range(scratch.buffer, scratch.offset, &built.scratch[..n])?;
        }
        self.write_range(dst_range.buffer, dst_range.offset, &bytes)?;
        if let Some(s) = self.structures.write().get_mut(dst.cast()) {
            s.built = true;
        }
        Ok(())
    }
}

impl BuildSource for HostDevice {
    fn read(&self, range: BufferRange) -> Result<Vec<u8>> {
        self.read_range(range)
    }

    fn referenced_bounds(&self, reference: u64) -> Result<Aabb> {
        let handle = self.structure_for_reference(reference)?;
        Ok(self.load_structure(handle)?.bounds())
    }
}

impl UseResolver for HostDevice {
    fn binding_kind(&self, pipeline: PipelineHandle, binding: u32) -> Result<Option<BindingKind>> {
        let pipelines = self.pipelines.read();
        let desc = pipelines.get(pipeline.cast()).ok_or_else(|| Self::invalid("pipeline", pipeline))?;
        Ok(desc.binding(binding))
    }

    fn structure_range(&self, structure: AccelerationStructureHandle) -> Result<BufferRange> {
        let structures = self.structures.read();
        structures
            .get(structure.cast())
            .map(|s| s.range)
            .ok_or_else(|| Self::invalid("acceleration structure", structure))
    }

    fn build_dependencies(&self, build: &AccelerationStructureBuild) -> Result<Vec<AccelerationStructureHandle>> {
        self.instance_references(build)?
            .into_iter()
            .map(|r| self.structure_for_reference(r))
            .collect()
    }
}

impl Device for HostDevice {
    fn name(&self) -> &str {
        "host"
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn features(&self) -> DeviceFeatures {
        DeviceFeatures { acceleration_structure: true, ray_query: true }
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle> {
        self.create_buffer_with_data(desc, &[])
    }

    fn create_buffer_with_data(&self, desc: &BufferDesc, data: &[u8]) -> Result<BufferHandle> {
        desc.usage.validate()?;
        if desc.size == 0 || desc.size > self.limits.max_buffer_size {
            return Err(Error::range(format!("buffer '{}' size {} is outside (0, {}]", desc.label, desc.size, self.limits.max_buffer_size)));
        }
        if data.len() as u64 > desc.size {
            return Err(Error::range(format!("{} initial bytes for buffer '{}' of {}", data.len(), desc.label, desc.size)));
        }
        let mut bytes = vec![0u8; desc.size as usize];
        bytes[..data.len()].copy_from_slice(data);
        let address = if desc.usage.contains(BufferUsage::SHADER_DEVICE_ADDRESS) {
            let mut next = self.next_address.lock();
            let address = *next;
            *next = crate::util::align_up(address + desc.size, 256);
            address
        } else {
            0
        };
        let handle = self.buffers.write().insert(HostBuffer {
            label: desc.label.clone(),
            usage: desc.usage,
            address,
            data: bytes,
        });
        tracing::trace!(label = %desc.label, size = desc.size, usage = ?desc.usage, "buffer created");
        Ok(handle.cast())
    }

    fn destroy_buffer(&self, buffer: BufferHandle) -> Result<()> {
        self.buffers.write().remove(buffer.cast()).map(|_| ()).ok_or_else(|| Self::invalid("buffer", buffer))
    }

    fn buffer_info(&self, buffer: BufferHandle) -> Result<BufferInfo> {
        let buffers = self.buffers.read();
        let b = buffers.get(buffer.cast()).ok_or_else(|| Self::invalid("buffer", buffer))?;
        Ok(BufferInfo { label: b.label.clone(), size: b.data.len() as u64, usage: b.usage })
    }

    fn buffer_device_address(&self, buffer: BufferHandle) -> Result<u64> {
        let buffers = self.buffers.read();
        let b = buffers.get(buffer.cast()).ok_or_else(|| Self::invalid("buffer", buffer))?;
        b.usage.require(BufferUsage::SHADER_DEVICE_ADDRESS, &format!("buffer '{}'", b.label))?;
        Ok(b.address)
    }

    fn update_buffer_range_via_staging_buffer(&self, queue: QueueKind, range: BufferRange, data: &[u8]) -> Result<()> {
        if data.len() as u64 != range.size {
            return Err(Error::range(format!("{} bytes for a staging upload of {}", data.len(), range.size)));
        }
        let (label, usage) = self.usage(range.buffer)?;
        usage.require(BufferUsage::TRANSFER_DST, &format!("upload target '{label}'"))?;
        self.check_range(&range)?;
        if data.is_empty() {
            return Ok(());
        }
        let staging = self.create_buffer_with_data(
            &BufferDesc::new("staging", range.size, BufferUsage::TRANSFER_SRC | BufferUsage::MAP_WRITE),
            data,
        )?;
        let mut list = CommandList::new("staging upload");
        list.copy_buffer(BufferRange::whole(staging, range.size), range.buffer, range.offset);
        let fence = self.submit(queue, list)?;
        let (timeout, attempts) = self.staging_wait;
        // on a hang the pending copy still owns the staging buffer
        block_on_fence(self, fence, timeout, attempts)?;
        self.destroy_buffer(staging)
    }

    fn read_buffer(&self, range: BufferRange) -> Result<Vec<u8>> {
        let (label, usage) = self.usage(range.buffer)?;
        usage.require(BufferUsage::TRANSFER_SRC, &format!("readback source '{label}'"))?;
        self.read_range(range)
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc) -> Result<PipelineHandle> {
        desc.shader.validate(&self.limits)?;
        if desc.push_constant_size > self.limits.max_push_constants_size {
            return Err(Error::Shader {
                name: desc.label.clone(),
                reason: format!("{} push-constant bytes exceed limit {}", desc.push_constant_size, self.limits.max_push_constants_size),
            });
        }
        if desc.shader.host.is_none() {
            return Err(Error::Unsupported(format!("shader '{}' has no host implementation", desc.shader.name)));
        }
        let handle = self.pipelines.write().insert(desc.clone());
        tracing::debug!(label = %desc.label, shader = %desc.shader.name, "compute pipeline created");
        Ok(handle.cast())
    }

    fn destroy_compute_pipeline(&self, pipeline: PipelineHandle) -> Result<()> {
        self.pipelines.write().remove(pipeline.cast()).map(|_| ()).ok_or_else(|| Self::invalid("pipeline", pipeline))
    }

    fn acceleration_structure_build_sizes(&self, info: &BuildGeometryInfo, max_primitive_counts: &[u32]) -> Result<BuildSizes> {
        layout::build_sizes(info, max_primitive_counts)
    }

    fn create_acceleration_structure(&self, params: &AccelerationStructureCreateParams) -> Result<AccelerationStructureHandle> {
        let (label, usage) = self.usage(params.range.buffer)?;
        usage.require(BufferUsage::ACCELERATION_STRUCTURE_STORAGE, &format!("{} storage '{label}'", params.ty.name()))?;
        self.check_range(&params.range)?;
        if params.range.offset % layout::STRUCTURE_ALIGNMENT != 0 {
            return Err(Error::range(format!("structure offset {} is not 256-byte aligned", params.range.offset)));
        }
        let handle = self.structures.write().insert(HostStructure {
            ty: params.ty,
            range: params.range,
            built: false,
        });
        Ok(handle.cast())
    }

    fn destroy_acceleration_structure(&self, structure: AccelerationStructureHandle) -> Result<()> {
        self.structures
            .write()
            .remove(structure.cast())
            .map(|_| ())
            .ok_or_else(|| Self::invalid("acceleration structure", structure))
    }

    fn acceleration_structure_reference(&self, structure: AccelerationStructureHandle) -> Result<u64> {
        if !self.structures.read().contains(structure.cast()) {
            return Err(Self::invalid("acceleration structure", structure));
        }
        Ok(structure.to_bits() | REFERENCE_TAG)
    }

    #[tracing::instrument(skip_all, fields(label = list.label(), commands = list.len(), ?queue))]
    fn submit(&self, queue: QueueKind, list: CommandList) -> Result<FenceHandle> {
        hazard::validate(&list, self)?;
        let fence: FenceHandle = self.fences.write().insert(HostFence { signaled: false }).cast();
        {
            let mut queues = self.queues.lock();
            let state = queues.entry(queue).or_default();
            if state.stalled {
                state.pending.push_back((fence, list));
                tracing::debug!(?fence, "held on stalled queue");
                return Ok(fence);
            }
        }
        self.execute(&list)?;
        self.signal(fence);
        Ok(fence)
    }

    fn fence_status(&self, fence: FenceHandle) -> Result<FenceStatus> {
        let fences = self.fences.read();
        let f = fences.get(fence.cast()).ok_or_else(|| Self::invalid("fence", fence))?;
        Ok(if f.signaled { FenceStatus::Signaled } else { FenceStatus::Timeout })
    }

    /// Host work is either done or stalled, so an unsignaled fence times out
    /// without sleeping.
    fn wait_for_fence(&self, fence: FenceHandle, _timeout: Duration) -> Result<FenceStatus> {
        self.fence_status(fence)
    }
}

//! Size queries, structure creation and build submission.
//!
//! The builder never inserts synchronization between dependent builds. A
//! top-level build must be recorded after the bottom-level builds it
//! references completed (earlier submission) or behind an
//! `ACCELERATION_STRUCTURE_BUILD / WRITE -> ACCELERATION_STRUCTURE_BUILD / READ`
//! barrier; the device rejects anything else.

use crate::util::{Error, Result};
use crate::video::{
    Access, AccelerationStructureHandle, Barrier, BufferRange, BufferUsage, CommandList, Context, FenceHandle,
    PipelineStage, QueueKind,
};

use super::types::{
    AccelerationStructureBuild, AccelerationStructureCreateParams, AccelerationStructureType, BuildFlags,
    BuildGeometryInfo, BuildMode, BuildRangeInfo, BuildSizes,
};

/// Usage every build input buffer must declare.
pub const BUILD_INPUT_USAGE: BufferUsage = BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY
    .union(BufferUsage::SHADER_DEVICE_ADDRESS);
/// Usage every scratch buffer must declare.
pub const SCRATCH_USAGE: BufferUsage = BufferUsage::STORAGE.union(BufferUsage::SHADER_DEVICE_ADDRESS);
/// Usage every structure backing buffer must declare.
pub const STORAGE_USAGE: BufferUsage = BufferUsage::ACCELERATION_STRUCTURE_STORAGE;

/// Barrier making finished bottom-level builds visible to later top-level builds.
pub fn build_barrier() -> Barrier {
    Barrier::memory(
        PipelineStage::ACCELERATION_STRUCTURE_BUILD,
        Access::ACCELERATION_STRUCTURE_WRITE,
        PipelineStage::ACCELERATION_STRUCTURE_BUILD,
        Access::ACCELERATION_STRUCTURE_READ,
    )
}

/// Front end over the device's acceleration structure entry points.
pub struct AccelerationStructureBuilder<'a> {
    ctx: &'a Context,
}

impl<'a> AccelerationStructureBuilder<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    /// Pure size query.
    pub fn get_build_sizes(&self, info: &BuildGeometryInfo, max_primitive_counts: &[u32]) -> Result<BuildSizes> {
        self.ctx.device().acceleration_structure_build_sizes(info, max_primitive_counts)
    }

    /// Bind a structure to `range`, which must hold at least `sizes.structure_size` bytes.
    #[tracing::instrument(skip_all, fields(ty = ty.name(), size = range.size))]
    pub fn create_structure(
        &self,
        ty: AccelerationStructureType,
        flags: BuildFlags,
        range: BufferRange,
        sizes: &BuildSizes,
    ) -> Result<AccelerationStructureHandle> {
        let info = self.ctx.device().buffer_info(range.buffer)?;
        info.usage.require(STORAGE_USAGE, &format!("{} storage '{}'", ty.name(), info.label))?;
        if range.size < sizes.structure_size {
            return Err(Error::StructureTooSmall { required: sizes.structure_size, actual: range.size });
        }
        self.ctx
            .device()
            .create_acceleration_structure(&AccelerationStructureCreateParams { ty, flags, range })
    }

    fn check_build(&self, info: &BuildGeometryInfo, ranges: &[BuildRangeInfo]) -> Result<()> {
        if info.mode == BuildMode::Update || info.src.is_some() {
            return Err(Error::Unsupported("acceleration structure updates".into()));
        }
        if info.dst.is_none() {
            return Err(Error::range("build without a destination structure"));
        }
        if ranges.len() != info.geometries.len() {
            return Err(Error::range(format!("{} build ranges for {} geometries", ranges.len(), info.geometries.len())));
        }
        let device = self.ctx.device();
        for geometry in &info.geometries {
            for input in geometry.data.input_ranges() {
                let buffer = device.buffer_info(input.buffer)?;
                buffer.usage.require(BUILD_INPUT_USAGE, &format!("build input '{}'", buffer.label))?;
            }
        }
        let scratch = info.scratch.ok_or_else(|| Error::range("build without a scratch range"))?;
        let buffer = device.buffer_info(scratch.buffer)?;
        buffer.usage.require(SCRATCH_USAGE, &format!("scratch '{}'", buffer.label))?;

        let counts: Vec<u32> = ranges.iter().map(|r| r.primitive_count).collect();
        let sizes = device.acceleration_structure_build_sizes(info, &counts)?;
        if scratch.size < sizes.build_scratch_size {
            return Err(Error::ScratchTooSmall { required: sizes.build_scratch_size, actual: scratch.size });
        }
        Ok(())
    }

    /// Record `builds` into `list` after validating them.
    pub fn record(&self, list: &mut CommandList, builds: Vec<AccelerationStructureBuild>) -> Result<()> {
        for b in &builds {
            self.check_build(&b.info, &b.ranges)?;
        }
        list.build_acceleration_structures(builds);
        Ok(())
    }

    /// Validate and submit one batch of builds on `queue`.
    #[tracing::instrument(skip_all, fields(count = infos.len()))]
    pub fn build(
        &self,
        queue: QueueKind,
        infos: Vec<BuildGeometryInfo>,
        ranges: Vec<Vec<BuildRangeInfo>>,
    ) -> Result<FenceHandle> {
        if infos.len() != ranges.len() {
            return Err(Error::range(format!("{} build infos with {} range lists", infos.len(), ranges.len())));
        }
        let builds: Vec<AccelerationStructureBuild> =
            infos.into_iter().zip(ranges).map(|(info, ranges)| AccelerationStructureBuild { info, ranges }).collect();
        let mut list = CommandList::new("acceleration structure build");
        self.record(&mut list, builds)?;
        self.ctx.device().submit(queue, list)
    }

    /// [`Self::build`] on the compute queue, then block on its fence.
    pub fn build_blocking(&self, infos: Vec<BuildGeometryInfo>, ranges: Vec<Vec<BuildRangeInfo>>) -> Result<()> {
        let fence = self.build(self.ctx.queues().compute, infos, ranges)?;
        self.ctx.wait(fence)
    }
}

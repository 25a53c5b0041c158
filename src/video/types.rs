//! Device object descriptions: handles, usage flags, stages, limits.

use bitflags::bitflags;

use crate::util::{Error, Handle, Result};

/// Marker for buffer handles.
pub enum BufferTag {}
/// Marker for compute pipeline handles.
pub enum PipelineTag {}
/// Marker for acceleration structure handles.
pub enum AccelerationStructureTag {}
/// Marker for fence handles.
pub enum FenceTag {}

pub type BufferHandle = Handle<BufferTag>;
pub type PipelineHandle = Handle<PipelineTag>;
pub type AccelerationStructureHandle = Handle<AccelerationStructureTag>;
pub type FenceHandle = Handle<FenceTag>;

bitflags! {
    /// Declared buffer usage. Devices reject operations the usage does not allow.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const INDEX = 1 << 4;
        const VERTEX = 1 << 5;
        const INDIRECT = 1 << 6;
        const SHADER_DEVICE_ADDRESS = 1 << 7;
        const ACCELERATION_STRUCTURE_STORAGE = 1 << 8;
        const ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY = 1 << 9;
        const MAP_READ = 1 << 10;
        const MAP_WRITE = 1 << 11;
    }
}

impl BufferUsage {
    /// Reject combinations no backend can create.
    pub fn validate(self) -> Result<()> {
        let invalid = |reason: &str| Error::InvalidUsage { usage: format!("{self:?}"), reason: reason.into() };
        if self.is_empty() {
            return Err(invalid("no usage declared"));
        }
        if self.contains(Self::MAP_READ) && !(Self::MAP_READ | Self::TRANSFER_DST).contains(self) {
            return Err(invalid("MAP_READ may only be combined with TRANSFER_DST"));
        }
        if self.contains(Self::MAP_WRITE) && !(Self::MAP_WRITE | Self::TRANSFER_SRC).contains(self) {
            return Err(invalid("MAP_WRITE may only be combined with TRANSFER_SRC"));
        }
        if self.contains(Self::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY)
            && !self.contains(Self::SHADER_DEVICE_ADDRESS)
        {
            return Err(invalid("build inputs are read by device address"));
        }
        Ok(())
    }

    /// Error unless every flag in `required` is declared.
    pub fn require(self, required: BufferUsage, resource: &str) -> Result<()> {
        if self.contains(required) {
            Ok(())
        } else {
            Err(Error::MissingUsage {
                resource: resource.to_string(),
                required: format!("{:?}", required.difference(self)),
            })
        }
    }
}

bitflags! {
    /// Pipeline stages used by barriers and hazard tracking.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PipelineStage: u32 {
        const TRANSFER = 1 << 0;
        const COMPUTE_SHADER = 1 << 1;
        const ACCELERATION_STRUCTURE_BUILD = 1 << 2;
        const HOST = 1 << 3;
        const ALL_COMMANDS = Self::TRANSFER.bits()
            | Self::COMPUTE_SHADER.bits()
            | Self::ACCELERATION_STRUCTURE_BUILD.bits()
            | Self::HOST.bits();
    }
}

bitflags! {
    /// Memory access kinds used by barriers and hazard tracking.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Access: u32 {
        const TRANSFER_READ = 1 << 0;
        const TRANSFER_WRITE = 1 << 1;
        const SHADER_READ = 1 << 2;
        const SHADER_WRITE = 1 << 3;
        const UNIFORM_READ = 1 << 4;
        const ACCELERATION_STRUCTURE_READ = 1 << 5;
        const ACCELERATION_STRUCTURE_WRITE = 1 << 6;
        const HOST_READ = 1 << 7;
        const HOST_WRITE = 1 << 8;
        const MEMORY_READ = 1 << 9;
        const MEMORY_WRITE = 1 << 10;
    }
}

impl Access {
    const READS: Access = Access::TRANSFER_READ
        .union(Access::SHADER_READ)
        .union(Access::UNIFORM_READ)
        .union(Access::ACCELERATION_STRUCTURE_READ)
        .union(Access::HOST_READ);
    const WRITES: Access = Access::TRANSFER_WRITE
        .union(Access::SHADER_WRITE)
        .union(Access::ACCELERATION_STRUCTURE_WRITE)
        .union(Access::HOST_WRITE);

    /// Expand the MEMORY_* catch-alls into the concrete kinds they imply.
    pub fn expanded(self) -> Access {
        let mut out = self;
        if self.contains(Access::MEMORY_READ) {
            out |= Self::READS;
        }
        if self.contains(Access::MEMORY_WRITE) {
            out |= Self::WRITES;
        }
        out
    }

    #[inline]
    pub fn covers(self, other: Access) -> bool {
        self.expanded().contains(other.expanded() - (Access::MEMORY_READ | Access::MEMORY_WRITE))
    }

    /// The write kinds in `self`, catch-alls expanded.
    #[inline]
    pub fn writes(self) -> Access {
        self.expanded() & Self::WRITES
    }

    #[inline]
    pub fn is_write(self) -> bool {
        self.expanded().intersects(Self::WRITES)
    }
}

impl PipelineStage {
    #[inline]
    pub fn covers(self, other: PipelineStage) -> bool {
        self.contains(other)
    }
}

/// Queue families a submission may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum QueueKind {
    Graphics,
    Compute,
    Transfer,
}

impl QueueKind {
    pub const ALL: [QueueKind; 3] = [QueueKind::Graphics, QueueKind::Compute, QueueKind::Transfer];
}

/// Buffer creation parameters.
#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub label: String,
    pub size: u64,
    pub usage: BufferUsage,
}

impl BufferDesc {
    pub fn new(label: impl Into<String>, size: u64, usage: BufferUsage) -> Self {
        Self { label: label.into(), size, usage }
    }
}

/// Byte range of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferRange {
    pub buffer: BufferHandle,
    pub offset: u64,
    pub size: u64,
}

impl BufferRange {
    #[inline]
    pub fn new(buffer: BufferHandle, offset: u64, size: u64) -> Self {
        Self { buffer, offset, size }
    }

    #[inline]
    pub fn whole(buffer: BufferHandle, size: u64) -> Self {
        Self { buffer, offset: 0, size }
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    #[inline]
    pub fn overlaps(&self, other: &BufferRange) -> bool {
        self.buffer == other.buffer && self.offset < other.end() && other.offset < self.end()
    }

    /// Sub-range relative to this range's start.
    pub fn slice(&self, offset: u64, size: u64) -> Result<BufferRange> {
        if offset + size > self.size {
            return Err(Error::range(format!(
                "slice {offset}+{size} exceeds range of {} bytes",
                self.size
            )));
        }
        Ok(BufferRange { buffer: self.buffer, offset: self.offset + offset, size })
    }
}

/// Device limits relevant to the compute and build paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_compute_workgroup_size: [u32; 3],
    pub max_compute_workgroup_invocations: u32,
    pub max_compute_shared_memory_size: u32,
    pub max_compute_workgroups_per_dimension: u32,
    pub max_storage_buffer_range: u64,
    pub max_buffer_size: u64,
    pub min_storage_buffer_offset_alignment: u32,
    pub max_push_constants_size: u32,
}

impl Default for DeviceLimits {
    /// Conservative limits every backend is expected to meet.
    fn default() -> Self {
        Self {
            max_compute_workgroup_size: [256, 256, 64],
            max_compute_workgroup_invocations: 256,
            max_compute_shared_memory_size: 16 * 1024,
            max_compute_workgroups_per_dimension: 65535,
            max_storage_buffer_range: 128 << 20,
            max_buffer_size: 256 << 20,
            min_storage_buffer_offset_alignment: 256,
            max_push_constants_size: 128,
        }
    }
}

/// Optional device capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceFeatures {
    pub acceleration_structure: bool,
    pub ray_query: bool,
}

/// Result of a bounded fence wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Signaled,
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_validation() {
        assert!(BufferUsage::empty().validate().is_err());
        assert!((BufferUsage::MAP_READ | BufferUsage::TRANSFER_DST).validate().is_ok());
        assert!((BufferUsage::MAP_READ | BufferUsage::STORAGE).validate().is_err());
        assert!(BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY.validate().is_err());
        assert!((BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY
            | BufferUsage::SHADER_DEVICE_ADDRESS
            | BufferUsage::STORAGE
            | BufferUsage::TRANSFER_DST)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_usage_require_names_missing_flags() {
        let err = BufferUsage::STORAGE
            .require(BufferUsage::ACCELERATION_STRUCTURE_STORAGE, "blas storage")
            .unwrap_err();
        assert!(err.to_string().contains("ACCELERATION_STRUCTURE_STORAGE"));
    }

    #[test]
    fn test_access_coverage() {
        assert!(Access::MEMORY_READ.covers(Access::SHADER_READ));
        assert!(Access::MEMORY_WRITE.covers(Access::SHADER_WRITE));
        assert!(!Access::SHADER_READ.covers(Access::SHADER_WRITE));
        assert!((Access::SHADER_READ | Access::SHADER_WRITE).covers(Access::SHADER_WRITE));
        assert!(PipelineStage::ALL_COMMANDS.covers(PipelineStage::COMPUTE_SHADER));
        assert!(Access::ACCELERATION_STRUCTURE_WRITE.is_write());
        assert!(!Access::UNIFORM_READ.is_write());
        assert_eq!((Access::SHADER_READ | Access::SHADER_WRITE).writes(), Access::SHADER_WRITE);
        assert!(Access::UNIFORM_READ.writes().is_empty());
    }

    #[test]
    fn test_range_overlap_and_slice() {
        let h = BufferHandle::from_raw(0, 0);
        let a = BufferRange::new(h, 0, 64);
        let b = BufferRange::new(h, 32, 64);
        let c = BufferRange::new(h, 64, 16);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert_eq!(a.slice(16, 16).unwrap().offset, 16);
        assert!(a.slice(60, 16).is_err());
    }
}

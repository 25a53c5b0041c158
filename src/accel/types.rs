//! Build inputs and parameters for acceleration structures.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use crate::util::{Aabb, Affine3A};
use crate::video::{AccelerationStructureHandle, BufferRange};

/// Level of an acceleration structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelerationStructureType {
    BottomLevel,
    TopLevel,
}

impl AccelerationStructureType {
    pub fn name(self) -> &'static str {
        match self {
            Self::BottomLevel => "BLAS",
            Self::TopLevel => "TLAS",
        }
    }
}

bitflags! {
    /// Build hints.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BuildFlags: u32 {
        const ALLOW_UPDATE = 1 << 0;
        const ALLOW_COMPACTION = 1 << 1;
        const PREFER_FAST_TRACE = 1 << 2;
        const PREFER_FAST_BUILD = 1 << 3;
        const LOW_MEMORY = 1 << 4;
    }
}

bitflags! {
    /// Per-geometry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GeometryFlags: u32 {
        const OPAQUE = 1 << 0;
        const NO_DUPLICATE_ANY_HIT_INVOCATION = 1 << 1;
    }
}

bitflags! {
    /// Per-instance flags (8 bits in the packed instance).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InstanceFlags: u8 {
        const TRIANGLE_FACING_CULL_DISABLE = 1 << 0;
        const TRIANGLE_FLIP_FACING = 1 << 1;
        const FORCE_OPAQUE = 1 << 2;
        const FORCE_NO_OPAQUE = 1 << 3;
    }
}

/// Fresh build or refit. Only `Build` is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    Build,
    Update,
}

/// AABB input record (24 bytes, matches `VkAabbPositionsKHR`).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct AabbPositions {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl From<Aabb> for AabbPositions {
    fn from(b: Aabb) -> Self {
        Self { min: b.min, max: b.max }
    }
}

impl From<AabbPositions> for Aabb {
    fn from(p: AabbPositions) -> Self {
        Aabb::new(p.min, p.max)
    }
}

/// AABB record padded to a 64-byte stride.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PaddedAabb {
    pub aabb: AabbPositions,
    pub _pad: [f32; 10],
}

impl PaddedAabb {
    pub const STRIDE: u64 = std::mem::size_of::<Self>() as u64;

    pub fn new(aabb: Aabb) -> Self {
        Self { aabb: aabb.into(), _pad: [0.0; 10] }
    }
}

/// Top-level instance record (64 bytes, matches `VkAccelerationStructureInstanceKHR`).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Instance {
    /// Row-major 3x4 object-to-world transform.
    pub transform: [[f32; 4]; 3],
    /// Custom index in the low 24 bits, visibility mask in the high 8.
    pub custom_index_and_mask: u32,
    /// SBT record offset in the low 24 bits, [`InstanceFlags`] in the high 8.
    pub sbt_offset_and_flags: u32,
    /// Reference returned by `Device::acceleration_structure_reference`.
    pub acceleration_structure_reference: u64,
}

pub const IDENTITY_TRANSFORM: [[f32; 4]; 3] = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
];

impl Instance {
    pub const STRIDE: u64 = std::mem::size_of::<Self>() as u64;

    pub fn new(
        transform: Affine3A,
        custom_index: u32,
        mask: u8,
        sbt_offset: u32,
        flags: InstanceFlags,
        reference: u64,
    ) -> Self {
        Self {
            transform: affine_to_rows(&transform),
            custom_index_and_mask: (custom_index & 0x00ff_ffff) | ((mask as u32) << 24),
            sbt_offset_and_flags: (sbt_offset & 0x00ff_ffff) | ((flags.bits() as u32) << 24),
            acceleration_structure_reference: reference,
        }
    }

    #[inline]
    pub fn custom_index(&self) -> u32 {
        self.custom_index_and_mask & 0x00ff_ffff
    }

    #[inline]
    pub fn mask(&self) -> u8 {
        (self.custom_index_and_mask >> 24) as u8
    }

    #[inline]
    pub fn sbt_offset(&self) -> u32 {
        self.sbt_offset_and_flags & 0x00ff_ffff
    }

    #[inline]
    pub fn flags(&self) -> InstanceFlags {
        InstanceFlags::from_bits_truncate((self.sbt_offset_and_flags >> 24) as u8)
    }

    pub fn object_to_world(&self) -> Affine3A {
        rows_to_affine(&self.transform)
    }
}

/// Row-major 3x4 rows of an affine transform.
pub fn affine_to_rows(m: &Affine3A) -> [[f32; 4]; 3] {
    let c = m.matrix3;
    let t = m.translation;
    [
        [c.x_axis.x, c.y_axis.x, c.z_axis.x, t.x],
        [c.x_axis.y, c.y_axis.y, c.z_axis.y, t.y],
        [c.x_axis.z, c.y_axis.z, c.z_axis.z, t.z],
    ]
}

pub fn rows_to_affine(rows: &[[f32; 4]; 3]) -> Affine3A {
    use glam::{Mat3, Vec3};
    let m = Mat3::from_cols(
        Vec3::new(rows[0][0], rows[1][0], rows[2][0]),
        Vec3::new(rows[0][1], rows[1][1], rows[2][1]),
        Vec3::new(rows[0][2], rows[1][2], rows[2][2]),
    );
    Affine3A::from_mat3_translation(m, Vec3::new(rows[0][3], rows[1][3], rows[2][3]))
}

/// Vertex position formats accepted for triangle geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexFormat {
    Float32x3,
}

/// Index formats for triangle geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    None,
    U16,
    U32,
}

impl IndexType {
    pub fn size(self) -> u64 {
        match self {
            Self::None => 0,
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }
}

/// Source data for one geometry.
#[derive(Debug, Clone, PartialEq)]
pub enum GeometryData {
    Aabbs {
        data: BufferRange,
        stride: u64,
    },
    Triangles {
        vertex_data: BufferRange,
        vertex_stride: u64,
        vertex_format: VertexFormat,
        max_vertex: u32,
        index_data: Option<BufferRange>,
        index_type: IndexType,
    },
    Instances {
        data: BufferRange,
    },
}

impl GeometryData {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Aabbs { .. } => "aabbs",
            Self::Triangles { .. } => "triangles",
            Self::Instances { .. } => "instances",
        }
    }

    /// Buffer ranges the build reads.
    pub fn input_ranges(&self) -> Vec<BufferRange> {
        match self {
            Self::Aabbs { data, .. } | Self::Instances { data } => vec![*data],
            Self::Triangles { vertex_data, index_data, .. } => {
                let mut v = vec![*vertex_data];
                v.extend(index_data.iter().copied());
                v
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    pub flags: GeometryFlags,
    pub data: GeometryData,
}

impl Geometry {
    pub fn aabbs(data: BufferRange, stride: u64, flags: GeometryFlags) -> Self {
        Self { flags, data: GeometryData::Aabbs { data, stride } }
    }

    pub fn instances(data: BufferRange) -> Self {
        Self { flags: GeometryFlags::empty(), data: GeometryData::Instances { data } }
    }
}

/// Everything a build needs except the per-geometry ranges.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildGeometryInfo {
    pub ty: AccelerationStructureType,
    pub flags: BuildFlags,
    pub mode: BuildMode,
    pub src: Option<AccelerationStructureHandle>,
    pub dst: Option<AccelerationStructureHandle>,
    pub geometries: Vec<Geometry>,
    pub scratch: Option<BufferRange>,
}

impl BuildGeometryInfo {
    /// Fresh build description; `dst` and `scratch` are filled in once allocated.
    pub fn new(ty: AccelerationStructureType, flags: BuildFlags, geometries: Vec<Geometry>) -> Self {
        Self { ty, flags, mode: BuildMode::Build, src: None, dst: None, geometries, scratch: None }
    }
}

/// Per-geometry range: which primitives of the source data to consume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildRangeInfo {
    pub primitive_count: u32,
    /// Byte offset into the geometry's data range.
    pub primitive_offset: u32,
    pub first_vertex: u32,
    pub transform_offset: u32,
}

impl BuildRangeInfo {
    pub fn count(primitive_count: u32) -> Self {
        Self { primitive_count, ..Default::default() }
    }
}

/// Sizes returned by the size query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildSizes {
    pub structure_size: u64,
    pub update_scratch_size: u64,
    pub build_scratch_size: u64,
}

/// One build as recorded into a command list.
#[derive(Debug, Clone, PartialEq)]
pub struct AccelerationStructureBuild {
    pub info: BuildGeometryInfo,
    pub ranges: Vec<BuildRangeInfo>,
}

/// Creation parameters for a structure object.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccelerationStructureCreateParams {
    pub ty: AccelerationStructureType,
    pub flags: BuildFlags,
    pub range: BufferRange,
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};

    #[test]
    fn test_layout_sizes() {
        assert_eq!(std::mem::size_of::<AabbPositions>(), 24);
        assert_eq!(PaddedAabb::STRIDE, 64);
        assert_eq!(Instance::STRIDE, 64);
    }

    #[test]
    fn test_instance_packing() {
        let inst = Instance::new(
            Affine3A::IDENTITY,
            0x12_3456,
            0xff,
            7,
            InstanceFlags::TRIANGLE_FACING_CULL_DISABLE,
            42,
        );
        assert_eq!(inst.transform, IDENTITY_TRANSFORM);
        assert_eq!(inst.custom_index(), 0x12_3456);
        assert_eq!(inst.mask(), 0xff);
        assert_eq!(inst.sbt_offset(), 7);
        assert_eq!(inst.flags(), InstanceFlags::TRIANGLE_FACING_CULL_DISABLE);
    }

    #[test]
    fn test_transform_rows_roundtrip() {
        let m = Affine3A::from_scale_rotation_translation(
            Vec3::new(2.0, 1.0, 0.5),
            Quat::from_rotation_y(0.7),
            Vec3::new(1.0, -2.0, 3.0),
        );
        let back = rows_to_affine(&affine_to_rows(&m));
        let p = Vec3::new(0.3, 0.2, -0.9);
        assert!((m.transform_point3(p) - back.transform_point3(p)).length() < 1e-5);
    }
}

//! Serialized acceleration structure layout.
//!
//! ```text
//! [Header 32 B][BvhNode 32 B x nodes][record x prims][u32 source index x prims]
//! ```
//!
//! BLAS records are [`PrimitiveRecord`]s (80 B), TLAS records are
//! [`InstanceRecord`]s (112 B). Records are stored in BVH leaf order and the
//! trailing index table maps each record slot back to its source primitive
//! or instance. Sizes are computed for the requested primitive count even
//! when some primitives turn out to be inactive.

use bytemuck::{Pod, Zeroable};

use crate::util::{align_up, Aabb, Error, Result};

use super::bvh::{Bvh, BvhNode};
use super::types::{
    AccelerationStructureType, BuildFlags, BuildGeometryInfo, BuildSizes, GeometryData, Instance,
};

pub const STRUCTURE_MAGIC: u32 = u32::from_le_bytes(*b"NBAS");
pub const STRUCTURE_ALIGNMENT: u64 = 256;

/// Structure header (32 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct Header {
    pub magic: u32,
    pub kind: u32,
    pub node_count: u32,
    pub prim_count: u32,
    pub geometry_count: u32,
    pub flags: u32,
    pub nodes_offset: u32,
    pub records_offset: u32,
}

pub const KIND_BOTTOM: u32 = 0;
pub const KIND_TOP: u32 = 1;

pub const RECORD_AABB: u32 = 0;
pub const RECORD_TRIANGLE: u32 = 1;

/// Bottom-level primitive record (80 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PrimitiveRecord {
    pub min: [f32; 3],
    pub primitive_index: u32,
    pub max: [f32; 3],
    pub geometry_index: u32,
    pub v0: [f32; 3],
    pub kind: u32,
    pub v1: [f32; 3],
    pub geometry_flags: u32,
    pub v2: [f32; 3],
    pub _pad: u32,
}

impl PrimitiveRecord {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    pub fn aabb(bounds: Aabb, geometry_index: u32, primitive_index: u32, geometry_flags: u32) -> Self {
        Self {
            min: bounds.min,
            primitive_index,
            max: bounds.max,
            geometry_index,
            kind: RECORD_AABB,
            geometry_flags,
            ..Self::zeroed()
        }
    }

    pub fn triangle(v: [[f32; 3]; 3], geometry_index: u32, primitive_index: u32, geometry_flags: u32) -> Self {
        let mut bounds = Aabb::EMPTY;
        v.iter().for_each(|p| bounds.grow_point(*p));
        Self {
            min: bounds.min,
            primitive_index,
            max: bounds.max,
            geometry_index,
            v0: v[0],
            kind: RECORD_TRIANGLE,
            v1: v[1],
            geometry_flags,
            v2: v[2],
            _pad: 0,
        }
    }

    #[inline]
    pub fn bounds(&self) -> Aabb {
        Aabb::new(self.min, self.max)
    }
}

/// Top-level instance record (112 bytes): the instance plus its inverse transform.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceRecord {
    pub instance: Instance,
    pub world_to_object: [[f32; 4]; 3],
}

impl InstanceRecord {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;
}

const HEADER_SIZE: u64 = std::mem::size_of::<Header>() as u64;

fn record_size(ty: AccelerationStructureType) -> u64 {
    match ty {
        AccelerationStructureType::BottomLevel => PrimitiveRecord::SIZE,
        AccelerationStructureType::TopLevel => InstanceRecord::SIZE,
    }
}

/// Bytes one primitive of `data` occupies in its input buffer.
fn input_footprint(data: &GeometryData) -> u64 {
    match data {
        GeometryData::Aabbs { stride, .. } => *stride,
        GeometryData::Triangles { vertex_stride, index_type, .. } => 3 * (vertex_stride + index_type.size()),
        GeometryData::Instances { .. } => Instance::STRIDE,
    }
}

/// Size query. Pure, monotonic in every count.
pub fn build_sizes(info: &BuildGeometryInfo, max_primitive_counts: &[u32]) -> Result<BuildSizes> {
    if max_primitive_counts.len() != info.geometries.len() {
        return Err(Error::range(format!(
            "{} primitive counts for {} geometries",
            max_primitive_counts.len(),
            info.geometries.len()
        )));
    }
    validate_geometries(info)?;
    let record = record_size(info.ty);
    let n: u64 = max_primitive_counts.iter().map(|&c| c as u64).sum();
    let mut per_prim_payload = 0u64;
    for (geometry, &count) in info.geometries.iter().zip(max_primitive_counts) {
        // structure never smaller than its input data
        per_prim_payload += count as u64 * (record + 4).max(input_footprint(&geometry.data));
    }
    let nodes = Bvh::max_nodes(n as usize) as u64 * BvhNode::SIZE;
    let structure_size = align_up(HEADER_SIZE + nodes + per_prim_payload, STRUCTURE_ALIGNMENT);
    let build_scratch_size = align_up(n.max(1) * (record + 4), STRUCTURE_ALIGNMENT);
    let update_scratch_size = if info.flags.contains(BuildFlags::ALLOW_UPDATE) { build_scratch_size } else { 0 };
    Ok(BuildSizes { structure_size, update_scratch_size, build_scratch_size })
}

/// Geometry kinds must match the structure level; strides must be usable.
pub fn validate_geometries(info: &BuildGeometryInfo) -> Result<()> {
    for (i, geometry) in info.geometries.iter().enumerate() {
        match (&geometry.data, info.ty) {
            (GeometryData::Aabbs { stride, .. }, AccelerationStructureType::BottomLevel) => {
                if *stride < 24 || stride % 8 != 0 {
                    return Err(Error::range(format!("geometry {i}: AABB stride {stride} must be >= 24 and a multiple of 8")));
                }
            }
            (GeometryData::Triangles { vertex_stride, .. }, AccelerationStructureType::BottomLevel) => {
                if *vertex_stride < 12 || vertex_stride % 4 != 0 {
                    return Err(Error::range(format!("geometry {i}: vertex stride {vertex_stride} must be >= 12 and a multiple of 4")));
                }
            }
            (GeometryData::Instances { .. }, AccelerationStructureType::TopLevel) => {
                if info.geometries.len() != 1 {
                    return Err(Error::range("a top-level build takes exactly one instance geometry"));
                }
            }
            (data, ty) => {
                return Err(Error::range(format!("geometry {i}: {} geometry in a {} build", data.kind_name(), ty.name())));
            }
        }
    }
    Ok(())
}

/// Decoded records of one structure.
#[derive(Debug, Clone, PartialEq)]
pub enum Records {
    Primitives(Vec<PrimitiveRecord>),
    Instances(Vec<InstanceRecord>),
}

impl Records {
    pub fn len(&self) -> usize {
        match self {
            Self::Primitives(v) => v.len(),
            Self::Instances(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A structure as stored in its backing range.
#[derive(Debug, Clone, PartialEq)]
pub struct StructureImage {
    pub ty: AccelerationStructureType,
    pub flags: BuildFlags,
    pub geometry_count: u32,
    pub nodes: Vec<BvhNode>,
    pub records: Records,
    /// Source index of every record slot.
    pub source_index: Vec<u32>,
}

impl StructureImage {
    /// Root bounds, empty for a structure without active primitives.
    pub fn bounds(&self) -> Aabb {
        if self.records.is_empty() {
            Aabb::EMPTY
        } else {
            self.nodes[0].bounds()
        }
    }

    pub fn encoded_size(&self) -> u64 {
        HEADER_SIZE
            + self.nodes.len() as u64 * BvhNode::SIZE
            + self.records.len() as u64 * (record_size(self.ty) + 4)
    }

    pub fn encode(&self) -> Vec<u8> {
        let nodes_offset = HEADER_SIZE as u32;
        let records_offset = nodes_offset + (self.nodes.len() as u64 * BvhNode::SIZE) as u32;
        let header = Header {
            magic: STRUCTURE_MAGIC,
            kind: match self.ty {
                AccelerationStructureType::BottomLevel => KIND_BOTTOM,
                AccelerationStructureType::TopLevel => KIND_TOP,
            },
            node_count: self.nodes.len() as u32,
            prim_count: self.records.len() as u32,
            geometry_count: self.geometry_count,
            flags: self.flags.bits(),
            nodes_offset,
            records_offset,
        };
        let mut out = Vec::with_capacity(self.encoded_size() as usize);
        out.extend_from_slice(bytemuck::bytes_of(&header));
        out.extend_from_slice(bytemuck::cast_slice(&self.nodes));
        match &self.records {
            Records::Primitives(v) => out.extend_from_slice(bytemuck::cast_slice(v)),
            Records::Instances(v) => out.extend_from_slice(bytemuck::cast_slice(v)),
        }
        out.extend_from_slice(bytemuck::cast_slice(&self.source_index));
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let corrupt = |what: &str| Error::other(format!("corrupt acceleration structure: {what}"));
        if bytes.len() < HEADER_SIZE as usize {
            return Err(corrupt("truncated header"));
        }
        let header: Header = bytemuck::pod_read_unaligned(&bytes[..HEADER_SIZE as usize]);
        if header.magic != STRUCTURE_MAGIC {
            return Err(corrupt("bad magic, structure was never built"));
        }
        let ty = match header.kind {
            KIND_BOTTOM => AccelerationStructureType::BottomLevel,
            KIND_TOP => AccelerationStructureType::TopLevel,
            _ => return Err(corrupt("unknown kind")),
        };
        let n = header.prim_count as usize;
        let nodes_start = header.nodes_offset as usize;
        let nodes_end = nodes_start + header.node_count as usize * BvhNode::SIZE as usize;
        let records_start = header.records_offset as usize;
        let records_end = records_start + n * record_size(ty) as usize;
        let index_end = records_end + n * 4;
        if nodes_end > records_start || index_end > bytes.len() || header.node_count == 0 {
            return Err(corrupt("section out of bounds"));
        }
        let nodes: Vec<BvhNode> = bytemuck::pod_collect_to_vec(&bytes[nodes_start..nodes_end]);
        let records = match ty {
            AccelerationStructureType::BottomLevel => {
                Records::Primitives(bytemuck::pod_collect_to_vec(&bytes[records_start..records_end]))
            }
            AccelerationStructureType::TopLevel => {
                Records::Instances(bytemuck::pod_collect_to_vec(&bytes[records_start..records_end]))
            }
        };
        let source_index: Vec<u32> = bytemuck::pod_collect_to_vec(&bytes[records_end..index_end]);
        Ok(Self {
            ty,
            flags: BuildFlags::from_bits_truncate(header.flags),
            geometry_count: header.geometry_count,
            nodes,
            records,
            source_index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::types::{Geometry, GeometryFlags};
    use crate::video::{BufferHandle, BufferRange};

    fn aabb_info(stride: u64) -> BuildGeometryInfo {
        let range = BufferRange::new(BufferHandle::from_raw(0, 0), 0, 1024);
        BuildGeometryInfo::new(
            AccelerationStructureType::BottomLevel,
            BuildFlags::PREFER_FAST_TRACE,
            vec![Geometry::aabbs(range, stride, GeometryFlags::OPAQUE)],
        )
    }

    #[test]
    fn test_record_sizes() {
        assert_eq!(HEADER_SIZE, 32);
        assert_eq!(PrimitiveRecord::SIZE, 80);
        assert_eq!(InstanceRecord::SIZE, 112);
    }

    #[test]
    fn test_sizes_monotonic_and_cover_input() {
        let info = aabb_info(64);
        let mut last = build_sizes(&info, &[0]).unwrap();
        assert!(last.structure_size > 0);
        assert_eq!(last.structure_size % STRUCTURE_ALIGNMENT, 0);
        assert_eq!(last.update_scratch_size, 0);
        for count in [1, 2, 9, 100, 1000] {
            let sizes = build_sizes(&info, &[count]).unwrap();
            assert!(sizes.structure_size >= last.structure_size);
            assert!(sizes.build_scratch_size >= last.build_scratch_size);
            assert!(sizes.structure_size >= count as u64 * 64);
            last = sizes;
        }

        let wide = aabb_info(512);
        assert!(build_sizes(&wide, &[10]).unwrap().structure_size >= 5120);
    }

    #[test]
    fn test_update_scratch_only_when_allowed() {
        let mut info = aabb_info(24);
        info.flags |= BuildFlags::ALLOW_UPDATE;
        let sizes = build_sizes(&info, &[4]).unwrap();
        assert_eq!(sizes.update_scratch_size, sizes.build_scratch_size);
    }

    #[test]
    fn test_rejects_bad_stride_and_level() {
        assert!(build_sizes(&aabb_info(20), &[1]).is_err());
        assert!(build_sizes(&aabb_info(28), &[1]).is_err());
        let mut info = aabb_info(24);
        info.ty = AccelerationStructureType::TopLevel;
        assert!(build_sizes(&info, &[1]).is_err());
        assert!(build_sizes(&aabb_info(24), &[1, 2]).is_err());
    }

    #[test]
    fn test_encode_decode_image() {
        let image = StructureImage {
            ty: AccelerationStructureType::BottomLevel,
            flags: BuildFlags::PREFER_FAST_TRACE,
            geometry_count: 1,
            nodes: vec![BvhNode { aabb_min: [-1.0; 3], left_or_first: 0, aabb_max: [1.0; 3], count: 1 }],
            records: Records::Primitives(vec![PrimitiveRecord::aabb(
                Aabb::new([-1.0; 3], [1.0; 3]),
                0,
                3,
                GeometryFlags::OPAQUE.bits(),
            )]),
            source_index: vec![3],
        };
        let bytes = image.encode();
        assert_eq!(bytes.len() as u64, image.encoded_size());
        assert_eq!(StructureImage::decode(&bytes).unwrap(), image);
        assert!(StructureImage::decode(&vec![0u8; 256]).is_err());
    }
}

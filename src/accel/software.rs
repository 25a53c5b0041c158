//! Software builder used by the host device.
//!
//! Reads primitive data straight out of the input buffers, writes the
//! gathered records into scratch, builds a [`Bvh`] and lays the result out
//! as a [`StructureImage`] ready to be stored in the destination range.

use crate::util::{Aabb, Error, Result};
use crate::video::BufferRange;

use super::bvh::{self, BvhOptions};
use super::layout::{InstanceRecord, PrimitiveRecord, Records, StructureImage};
use super::types::{
    affine_to_rows, AabbPositions, AccelerationStructureType, BuildGeometryInfo, BuildRangeInfo, GeometryData,
    IndexType, Instance,
};

/// Buffer contents and referenced structures visible to a build.
pub trait BuildSource {
    fn read(&self, range: BufferRange) -> Result<Vec<u8>>;
    /// Root bounds of the bottom-level structure behind `reference`.
    fn referenced_bounds(&self, reference: u64) -> Result<Aabb>;
}

/// Output of [`build`].
#[derive(Debug, Clone)]
pub struct SoftwareBuild {
    pub image: StructureImage,
    /// Gathered records as written to the scratch range.
    pub scratch: Vec<u8>,
    /// Primitives skipped as inactive.
    pub inactive: u32,
}

fn slice_at<'a>(bytes: &'a [u8], offset: u64, len: u64, what: &str) -> Result<&'a [u8]> {
    let end = offset.checked_add(len).filter(|&e| e <= bytes.len() as u64).ok_or_else(|| {
        Error::range(format!("{what} at {offset}+{len} exceeds input range of {} bytes", bytes.len()))
    })?;
    Ok(&bytes[offset as usize..end as usize])
}

fn read_index(indices: &[u8], index_type: IndexType, i: u64) -> Result<u32> {
    let size = index_type.size();
    let raw = slice_at(indices, i * size, size, "index")?;
    Ok(match index_type {
        IndexType::U16 => u16::from_le_bytes([raw[0], raw[1]]) as u32,
        IndexType::U32 => u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
        IndexType::None => i as u32,
    })
}

fn gather_primitives(
    info: &BuildGeometryInfo,
    ranges: &[BuildRangeInfo],
    source: &dyn BuildSource,
) -> Result<(Vec<PrimitiveRecord>, u32)> {
    let mut records = Vec::new();
    let mut inactive = 0;
    for (g, (geometry, range)) in info.geometries.iter().zip(ranges).enumerate() {
        let g = g as u32;
        let flags = geometry.flags.bits();
        match &geometry.data {
            GeometryData::Aabbs { data, stride } => {
                let bytes = source.read(*data)?;
                for p in 0..range.primitive_count {
                    let offset = range.primitive_offset as u64 + p as u64 * stride;
                    let raw = slice_at(&bytes, offset, 24, "aabb")?;
                    let bounds: Aabb = bytemuck::pod_read_unaligned::<AabbPositions>(raw).into();
                    if bounds.is_degenerate() {
                        inactive += 1;
                        continue;
                    }
                    records.push(PrimitiveRecord::aabb(bounds, g, p, flags));
                }
            }
            GeometryData::Triangles { vertex_data, vertex_stride, max_vertex, index_data, index_type, .. } => {
                let vertices = source.read(*vertex_data)?;
                let indices = match index_data {
                    Some(r) if *index_type != IndexType::None => Some(source.read(*r)?),
                    _ => None,
                };
                let vertex = |v: u32| -> Result<[f32; 3]> {
                    if v > *max_vertex {
                        return Err(Error::range(format!("vertex {v} beyond max_vertex {max_vertex}")));
                    }
                    let base = if indices.is_some() { 0 } else { range.primitive_offset as u64 };
                    let raw = slice_at(&vertices, base + v as u64 * vertex_stride, 12, "vertex")?;
                    Ok(bytemuck::pod_read_unaligned(raw))
                };
                for p in 0..range.primitive_count {
                    let mut corners = [[0.0f32; 3]; 3];
                    for (k, corner) in corners.iter_mut().enumerate() {
                        let i = p as u64 * 3 + k as u64;
                        let v = match &indices {
                            Some(bytes) => {
                                let local = &bytes[(range.primitive_offset as usize).min(bytes.len())..];
                                read_index(local, *index_type, i)? + range.first_vertex
                            }
                            None => range.first_vertex + i as u32,
                        };
                        *corner = vertex(v)?;
                    }
                    let record = PrimitiveRecord::triangle(corners, g, p, flags);
                    if record.bounds().is_degenerate() {
                        inactive += 1;
                        continue;
                    }
                    records.push(record);
                }
            }
            GeometryData::Instances { .. } => {
                return Err(Error::range("instance geometry in a bottom-level build"));
            }
        }
    }
    Ok((records, inactive))
}

fn gather_instances(
    info: &BuildGeometryInfo,
    ranges: &[BuildRangeInfo],
    source: &dyn BuildSource,
) -> Result<(Vec<(u32, InstanceRecord, Aabb)>, u32)> {
    let mut out = Vec::new();
    let mut inactive = 0;
    for (geometry, range) in info.geometries.iter().zip(ranges) {
        let GeometryData::Instances { data } = &geometry.data else {
            return Err(Error::range(format!("{} geometry in a top-level build", geometry.data.kind_name())));
        };
        let bytes = source.read(*data)?;
        for i in 0..range.primitive_count {
            let offset = range.primitive_offset as u64 + i as u64 * Instance::STRIDE;
            let instance: Instance = bytemuck::pod_read_unaligned(slice_at(&bytes, offset, Instance::STRIDE, "instance")?);
            if instance.acceleration_structure_reference == 0 {
                inactive += 1;
                continue;
            }
            let local = source.referenced_bounds(instance.acceleration_structure_reference)?;
            let object_to_world = instance.object_to_world();
            let world = local.transformed(&object_to_world);
            if world.is_degenerate() {
                // references an empty structure
                inactive += 1;
                continue;
            }
            let record = InstanceRecord { instance, world_to_object: affine_to_rows(&object_to_world.inverse()) };
            out.push((i, record, world));
        }
    }
    Ok((out, inactive))
}

/// Build one structure from its inputs.
#[tracing::instrument(skip_all, fields(ty = info.ty.name(), geometries = info.geometries.len()))]
pub fn build(
    info: &BuildGeometryInfo,
    ranges: &[BuildRangeInfo],
    source: &dyn BuildSource,
    options: BvhOptions,
) -> Result<SoftwareBuild> {
    if ranges.len() != info.geometries.len() {
        return Err(Error::range(format!("{} build ranges for {} geometries", ranges.len(), info.geometries.len())));
    }
    let (image, scratch, inactive) = match info.ty {
        AccelerationStructureType::BottomLevel => {
            let (records, inactive) = gather_primitives(info, ranges, source)?;
            let mut scratch = Vec::with_capacity(records.len() * (PrimitiveRecord::SIZE as usize + 4));
            for r in &records {
                scratch.extend_from_slice(bytemuck::bytes_of(r));
                scratch.extend_from_slice(&r.primitive_index.to_le_bytes());
            }
            let bounds: Vec<Aabb> = records.iter().map(PrimitiveRecord::bounds).collect();
            let tree = bvh::build(&bounds, options);
            let ordered: Vec<PrimitiveRecord> = tree.order.iter().map(|&i| records[i as usize]).collect();
            let source_index = ordered.iter().map(|r| r.primitive_index).collect();
            let image = StructureImage {
                ty: info.ty,
                flags: info.flags,
                geometry_count: info.geometries.len() as u32,
                nodes: tree.nodes,
                records: Records::Primitives(ordered),
                source_index,
            };
            (image, scratch, inactive)
        }
        AccelerationStructureType::TopLevel => {
            let (instances, inactive) = gather_instances(info, ranges, source)?;
            let mut scratch = Vec::with_capacity(instances.len() * (InstanceRecord::SIZE as usize + 4));
            for (i, r, _) in &instances {
                scratch.extend_from_slice(bytemuck::bytes_of(r));
                scratch.extend_from_slice(&i.to_le_bytes());
            }
            let bounds: Vec<Aabb> = instances.iter().map(|(_, _, b)| *b).collect();
            let tree = bvh::build(&bounds, options);
            let image = StructureImage {
                ty: info.ty,
                flags: info.flags,
                geometry_count: info.geometries.len() as u32,
                nodes: tree.nodes,
                records: Records::Instances(tree.order.iter().map(|&i| instances[i as usize].1).collect()),
                source_index: tree.order.iter().map(|&i| instances[i as usize].0).collect(),
            };
            (image, scratch, inactive)
        }
    };
    tracing::debug!(records = image.records.len(), inactive, nodes = image.nodes.len(), "structure built");
    Ok(SoftwareBuild { image, scratch, inactive })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::types::{BuildFlags, Geometry, GeometryFlags, PaddedAabb, VertexFormat};
    use crate::util::Vec3;
    use crate::video::BufferHandle;
    use std::collections::HashMap;

    struct Buffers {
        data: HashMap<u32, Vec<u8>>,
        blas_bounds: Aabb,
    }

    impl BuildSource for Buffers {
        fn read(&self, range: BufferRange) -> Result<Vec<u8>> {
            let bytes = self.data.get(&range.buffer.index()).ok_or_else(|| Error::other("no buffer"))?;
            Ok(bytes[range.offset as usize..range.end() as usize].to_vec())
        }
        fn referenced_bounds(&self, _reference: u64) -> Result<Aabb> {
            Ok(self.blas_bounds)
        }
    }

    fn whole(index: u32, bytes: &[u8]) -> BufferRange {
        BufferRange::new(BufferHandle::from_raw(index, 0), 0, bytes.len() as u64)
    }

    #[test]
    fn test_degenerate_aabbs_are_inactive() {
        let boxes = [
            PaddedAabb::new(Aabb::from_sphere(Vec3::ZERO, 1.0)),
            PaddedAabb::new(Aabb::new([1.0; 3], [-1.0; 3])),
            PaddedAabb::new(Aabb::from_sphere(Vec3::X * 4.0, 1.0)),
        ];
        let bytes = bytemuck::cast_slice(&boxes).to_vec();
        let info = BuildGeometryInfo::new(
            AccelerationStructureType::BottomLevel,
            BuildFlags::PREFER_FAST_TRACE,
            vec![Geometry::aabbs(whole(0, &bytes), PaddedAabb::STRIDE, GeometryFlags::OPAQUE)],
        );
        let source = Buffers { data: HashMap::from([(0, bytes)]), blas_bounds: Aabb::EMPTY };
        let built = build(&info, &[BuildRangeInfo::count(3)], &source, BvhOptions::default()).unwrap();
        assert_eq!(built.inactive, 1);
        assert_eq!(built.image.records.len(), 2);
        let mut ids = built.image.source_index.clone();
        ids.sort();
        assert_eq!(ids, vec![0, 2]);
        assert_eq!(built.scratch.len(), 2 * 84);
    }

    #[test]
    fn test_indexed_triangles() {
        let vertices: [[f32; 3]; 4] = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [1.0, 1.0, 0.0]];
        let indices: [u16; 6] = [0, 1, 2, 1, 3, 2];
        let vbytes = bytemuck::cast_slice(&vertices).to_vec();
        let ibytes = bytemuck::cast_slice(&indices).to_vec();
        let geometry = Geometry {
            flags: GeometryFlags::OPAQUE,
            data: GeometryData::Triangles {
                vertex_data: whole(0, &vbytes),
                vertex_stride: 12,
                vertex_format: VertexFormat::Float32x3,
                max_vertex: 3,
                index_data: Some(whole(1, &ibytes)),
                index_type: IndexType::U16,
            },
        };
        let info = BuildGeometryInfo::new(AccelerationStructureType::BottomLevel, BuildFlags::empty(), vec![geometry]);
        let source = Buffers { data: HashMap::from([(0, vbytes), (1, ibytes)]), blas_bounds: Aabb::EMPTY };
        let built = build(&info, &[BuildRangeInfo::count(2)], &source, BvhOptions::default()).unwrap();
        assert_eq!(built.image.records.len(), 2);
        assert_eq!(built.image.bounds(), Aabb::new([0.0; 3], [1.0, 1.0, 0.0]));
    }

    #[test]
    fn test_instances_skip_null_reference() {
        use crate::accel::types::InstanceFlags;
        use crate::util::Affine3A;
        let instances = [
            Instance::new(Affine3A::from_translation(Vec3::X * 3.0), 7, 0xff, 0, InstanceFlags::empty(), 1),
            Instance::new(Affine3A::IDENTITY, 8, 0xff, 0, InstanceFlags::empty(), 0),
        ];
        let bytes = bytemuck::cast_slice(&instances).to_vec();
        let info = BuildGeometryInfo::new(
            AccelerationStructureType::TopLevel,
            BuildFlags::empty(),
            vec![Geometry::instances(whole(0, &bytes))],
        );
        let source = Buffers {
            data: HashMap::from([(0, bytes)]),
            blas_bounds: Aabb::new([-1.0; 3], [1.0; 3]),
        };
        let built = build(&info, &[BuildRangeInfo::count(2)], &source, BvhOptions::default()).unwrap();
        assert_eq!(built.inactive, 1);
        assert_eq!(built.image.source_index, vec![0]);
        assert_eq!(built.image.bounds(), Aabb::new([2.0, -1.0, -1.0], [4.0, 1.0, 1.0]));
    }
}

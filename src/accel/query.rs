//! Ray queries against built structures.
//!
//! Walks the top-level BVH, moves the ray into each candidate instance's
//! object space and walks its bottom-level BVH. Triangles are intersected
//! here; procedural (AABB) candidates go to an [`Intersector`], which plays
//! the role of a shader generating the intersection.

use std::collections::HashMap;
use std::sync::Arc;

use crate::util::{Aabb, Ray, Result, Error, Vec3};

use super::bvh::BvhNode;
use super::layout::{PrimitiveRecord, Records, StructureImage, RECORD_TRIANGLE};
use super::types::{rows_to_affine, AccelerationStructureType};

/// Procedural primitive reported during traversal, in object space.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub instance_index: u32,
    pub custom_index: u32,
    pub geometry_index: u32,
    pub primitive_index: u32,
    pub bounds: Aabb,
    pub object_ray: Ray,
}

/// Closest committed intersection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    pub t: f32,
    pub instance_index: u32,
    pub custom_index: u32,
    pub geometry_index: u32,
    pub primitive_index: u32,
    /// Barycentrics for triangles, zero for procedural hits.
    pub barycentrics: [f32; 2],
}

/// Decides procedural hits: return `Some(t)` inside `[t_min, t_max]` to commit.
pub trait Intersector {
    fn intersect(&mut self, candidate: &Candidate, t_min: f32, t_max: f32) -> Option<f32>;
}

impl<F> Intersector for F
where
    F: FnMut(&Candidate, f32, f32) -> Option<f32>,
{
    fn intersect(&mut self, candidate: &Candidate, t_min: f32, t_max: f32) -> Option<f32> {
        self(candidate, t_min, t_max)
    }
}

/// Accepts every candidate at its box entry distance.
pub struct BoundsIntersector;

impl Intersector for BoundsIntersector {
    fn intersect(&mut self, candidate: &Candidate, t_min: f32, t_max: f32) -> Option<f32> {
        candidate.bounds.intersect(&candidate.object_ray, t_min, t_max)
    }
}

/// A top-level structure together with every bottom-level structure it references.
#[derive(Debug, Clone)]
pub struct SceneView {
    tlas: Arc<StructureImage>,
    blas: HashMap<u64, Arc<StructureImage>>,
}

impl SceneView {
    pub fn new(tlas: Arc<StructureImage>, blas: HashMap<u64, Arc<StructureImage>>) -> Result<Self> {
        if tlas.ty != AccelerationStructureType::TopLevel {
            return Err(Error::range("ray queries start from a top-level structure"));
        }
        Ok(Self { tlas, blas })
    }

    pub fn top_level(&self) -> &StructureImage {
        &self.tlas
    }

    pub fn query(&self) -> RayQuery<'_> {
        RayQuery { scene: self }
    }
}

/// Closest-hit traversal over a [`SceneView`].
pub struct RayQuery<'a> {
    scene: &'a SceneView,
}

/// Calls `visit` for every leaf slot whose node box the ray enters before `t_max()`.
fn walk(nodes: &[BvhNode], ray: &Ray, t_min: f32, t_max: &dyn Fn() -> f32, mut visit: impl FnMut(usize)) {
    let mut stack = Vec::with_capacity(64);
    stack.push(0usize);
    while let Some(i) = stack.pop() {
        let node = &nodes[i];
        if node.bounds().intersect(ray, t_min, t_max()).is_none() {
            continue;
        }
        if node.is_leaf() {
            let first = node.left_or_first as usize;
            for slot in first..first + node.count as usize {
                visit(slot);
            }
        } else {
            let left = node.left_or_first as usize;
            if left + 1 < nodes.len() {
                stack.push(left + 1);
                stack.push(left);
            }
        }
    }
}

/// Möller-Trumbore, both faces.
fn intersect_triangle(record: &PrimitiveRecord, ray: &Ray, t_min: f32, t_max: f32) -> Option<(f32, [f32; 2])> {
    let v0 = Vec3::from_array(record.v0);
    let e1 = Vec3::from_array(record.v1) - v0;
    let e2 = Vec3::from_array(record.v2) - v0;
    let p = ray.direction.cross(e2);
    let det = e1.dot(p);
    if det.abs() < 1e-12 {
        return None;
    }
    let inv = 1.0 / det;
    let s = ray.origin - v0;
    let u = s.dot(p) * inv;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(e1);
    let v = ray.direction.dot(q) * inv;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = e2.dot(q) * inv;
    (t >= t_min && t <= t_max).then_some((t, [u, v]))
}

impl RayQuery<'_> {
    /// Closest hit along `ray` within `[t_min, t_max]` for instances whose
    /// mask intersects `cull_mask`.
    pub fn trace(
        &self,
        ray: Ray,
        t_min: f32,
        t_max: f32,
        cull_mask: u8,
        intersector: &mut dyn Intersector,
    ) -> Option<Hit> {
        let tlas = &self.scene.tlas;
        let Records::Instances(instances) = &tlas.records else { return None };
        if instances.is_empty() {
            return None;
        }
        let closest = std::cell::Cell::new(t_max);
        let mut best: Option<Hit> = None;
        walk(&tlas.nodes, &ray, t_min, &|| closest.get(), |slot| {
            let record = &instances[slot];
            let instance = &record.instance;
            if instance.mask() & cull_mask == 0 {
                return;
            }
            let Some(blas) = self.scene.blas.get(&instance.acceleration_structure_reference) else {
                return;
            };
            let Records::Primitives(prims) = &blas.records else { return };
            if prims.is_empty() {
                return;
            }
            let object_ray = ray.transformed(&rows_to_affine(&record.world_to_object));
            let instance_index = tlas.source_index[slot];
            let custom_index = instance.custom_index();
            walk(&blas.nodes, &object_ray, t_min, &|| closest.get(), |p| {
                let prim = &prims[p];
                let limit = closest.get();
                let hit = if prim.kind == RECORD_TRIANGLE {
                    intersect_triangle(prim, &object_ray, t_min, limit)
                } else {
                    let candidate = Candidate {
                        instance_index,
                        custom_index,
                        geometry_index: prim.geometry_index,
                        primitive_index: prim.primitive_index,
                        bounds: prim.bounds(),
                        object_ray,
                    };
                    intersector
                        .intersect(&candidate, t_min, limit)
                        .filter(|t| *t >= t_min && *t <= limit)
                        .map(|t| (t, [0.0, 0.0]))
                };
                if let Some((t, barycentrics)) = hit {
                    closest.set(t);
                    best = Some(Hit {
                        t,
                        instance_index,
                        custom_index,
                        geometry_index: prim.geometry_index,
                        primitive_index: prim.primitive_index,
                        barycentrics,
                    });
                }
            });
        });
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::bvh::{self, BvhOptions};
    use crate::accel::layout::InstanceRecord;
    use crate::accel::types::{affine_to_rows, BuildFlags, Instance, InstanceFlags};
    use crate::util::Affine3A;

    fn blas(boxes: &[Aabb]) -> StructureImage {
        let tree = bvh::build(boxes, BvhOptions::default());
        let records: Vec<PrimitiveRecord> =
            tree.order.iter().map(|&i| PrimitiveRecord::aabb(boxes[i as usize], 0, i, 0)).collect();
        StructureImage {
            ty: AccelerationStructureType::BottomLevel,
            flags: BuildFlags::empty(),
            geometry_count: 1,
            nodes: tree.nodes,
            source_index: tree.order.clone(),
            records: Records::Primitives(records),
        }
    }

    fn tlas(instances: &[(Affine3A, u8, Aabb)]) -> StructureImage {
        let bounds: Vec<Aabb> = instances.iter().map(|(m, _, b)| b.transformed(m)).collect();
        let tree = bvh::build(&bounds, BvhOptions::default());
        let records = tree
            .order
            .iter()
            .map(|&i| {
                let (m, mask, _) = instances[i as usize];
                InstanceRecord {
                    instance: Instance::new(m, 100 + i, mask, 0, InstanceFlags::empty(), 1),
                    world_to_object: affine_to_rows(&m.inverse()),
                }
            })
            .collect();
        StructureImage {
            ty: AccelerationStructureType::TopLevel,
            flags: BuildFlags::empty(),
            geometry_count: 1,
            nodes: tree.nodes,
            source_index: tree.order.clone(),
            records: Records::Instances(records),
        }
    }

    fn sphere_intersector(c: &Candidate, t_min: f32, t_max: f32) -> Option<f32> {
        let center = Vec3::from_array(c.bounds.centroid());
        let radius = (c.bounds.max[0] - c.bounds.min[0]) * 0.5;
        let oc = c.object_ray.origin - center;
        let a = c.object_ray.direction.length_squared();
        let b = oc.dot(c.object_ray.direction);
        let disc = b * b - a * (oc.length_squared() - radius * radius);
        if disc < 0.0 {
            return None;
        }
        let t = (-b - disc.sqrt()) / a;
        (t >= t_min && t <= t_max).then_some(t)
    }

    #[test]
    fn test_closest_of_two_instances() {
        let unit = Aabb::new([-1.0; 3], [1.0; 3]);
        let bottom = Arc::new(blas(&[unit]));
        let top = tlas(&[
            (Affine3A::from_translation(Vec3::Z * 10.0), 0xff, unit),
            (Affine3A::from_translation(Vec3::Z * 5.0), 0xff, unit),
        ]);
        let scene = SceneView::new(Arc::new(top), HashMap::from([(1u64, bottom)])).unwrap();
        let ray = Ray::new(Vec3::ZERO, Vec3::Z);
        let hit = scene.query().trace(ray, 0.0, 100.0, 0xff, &mut sphere_intersector).unwrap();
        assert!((hit.t - 4.0).abs() < 1e-4);
        assert_eq!(hit.instance_index, 1);
        assert_eq!(hit.custom_index, 101);
    }

    #[test]
    fn test_mask_and_range_cull() {
        let unit = Aabb::new([-1.0; 3], [1.0; 3]);
        let bottom = Arc::new(blas(&[unit]));
        let top = tlas(&[(Affine3A::from_translation(Vec3::Z * 5.0), 0x01, unit)]);
        let scene = SceneView::new(Arc::new(top), HashMap::from([(1u64, bottom)])).unwrap();
        let ray = Ray::new(Vec3::ZERO, Vec3::Z);
        assert!(scene.query().trace(ray, 0.0, 100.0, 0x02, &mut BoundsIntersector).is_none());
        assert!(scene.query().trace(ray, 0.0, 3.0, 0xff, &mut BoundsIntersector).is_none());
        assert!(scene.query().trace(ray, 0.0, 100.0, 0x01, &mut BoundsIntersector).is_some());
    }

    #[test]
    fn test_empty_tlas_never_hits() {
        let top = tlas(&[]);
        let scene = SceneView::new(Arc::new(top), HashMap::new()).unwrap();
        let ray = Ray::new(Vec3::ZERO, Vec3::Z);
        assert!(scene.query().trace(ray, 0.0, f32::MAX, 0xff, &mut BoundsIntersector).is_none());
    }

    #[test]
    fn test_triangle_hit() {
        let record = PrimitiveRecord::triangle([[-1.0, -1.0, 2.0], [1.0, -1.0, 2.0], [0.0, 1.0, 2.0]], 0, 0, 0);
        let ray = Ray::new(Vec3::ZERO, Vec3::Z);
        let (t, _) = intersect_triangle(&record, &ray, 0.0, 10.0).unwrap();
        assert!((t - 2.0).abs() < 1e-6);
        assert!(intersect_triangle(&record, &ray, 0.0, 1.0).is_none());
    }
}

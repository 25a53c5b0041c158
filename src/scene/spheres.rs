//! The nine-sphere demo scene: one bottom-level AABB structure holding every
//! sphere and one top-level structure with a single identity instance.

use bytemuck::{Pod, Zeroable};

use crate::accel::{
    AccelerationStructureBuilder, AccelerationStructureHandle, AccelerationStructureType, BuildFlags,
    BuildGeometryInfo, BuildRangeInfo, BuildSizes, Geometry, GeometryFlags, Instance, InstanceFlags, PaddedAabb,
};
use crate::util::{Aabb, Affine3A, Result, Vec3};
use crate::video::{BufferRange, Context};

use super::buffers::{OwnedBuffers, BUILD_SCRATCH_USAGE, GEOMETRY_INPUT_USAGE, SHADER_DATA_USAGE, STRUCTURE_USAGE};

pub const SPHERE_COUNT: usize = 9;
pub const INVALID_ID_16BIT: u32 = 0xffff;

/// Sphere record as shaders read it (32 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Sphere {
    pub position: [f32; 3],
    pub radius2: f32,
    /// BSDF id in the low 16 bits, light id in the high 16.
    pub bsdf_light_ids: u32,
    pub _pad: [u32; 3],
}

impl Default for Sphere {
    fn default() -> Self {
        Self { position: [0.0; 3], radius2: 0.0, bsdf_light_ids: INVALID_ID_16BIT << 16, _pad: [0; 3] }
    }
}

impl Sphere {
    pub fn new(position: Vec3, radius: f32, bsdf_id: u32, light_id: u32) -> Self {
        Self {
            position: position.to_array(),
            radius2: radius * radius,
            bsdf_light_ids: (bsdf_id & 0xffff) | ((light_id & 0xffff) << 16),
            _pad: [0; 3],
        }
    }

    #[inline]
    pub fn center(&self) -> Vec3 {
        Vec3::from_array(self.position)
    }

    #[inline]
    pub fn radius(&self) -> f32 {
        self.radius2.sqrt()
    }

    #[inline]
    pub fn bsdf_id(&self) -> u32 {
        self.bsdf_light_ids & 0xffff
    }

    #[inline]
    pub fn light_id(&self) -> u32 {
        self.bsdf_light_ids >> 16
    }

    pub fn aabb(&self) -> Aabb {
        Aabb::from_sphere(self.center(), self.radius())
    }

    /// Nearest ray parameter in `[t_min, t_max]` where `origin + t * direction`
    /// lies on the sphere.
    pub fn intersect(&self, origin: Vec3, direction: Vec3, t_min: f32, t_max: f32) -> Option<f32> {
        let oc = origin - self.center();
        let a = direction.length_squared();
        let b = oc.dot(direction);
        let c = oc.length_squared() - self.radius2;
        let disc = b * b - a * c;
        if disc < 0.0 || a == 0.0 {
            return None;
        }
        let sq = disc.sqrt();
        [(-b - sq) / a, (-b + sq) / a].into_iter().find(|t| *t >= t_min && *t <= t_max)
    }
}

/// Ground plus eight small spheres; the last one is a light.
pub fn demo_spheres() -> [Sphere; SPHERE_COUNT] {
    [
        Sphere::new(Vec3::new(0.0, -100.5, -1.0), 100.0, 0, INVALID_ID_16BIT),
        Sphere::new(Vec3::new(3.0, 0.0, -1.0), 0.5, 1, INVALID_ID_16BIT),
        Sphere::new(Vec3::new(0.0, 0.0, -1.0), 0.5, 2, INVALID_ID_16BIT),
        Sphere::new(Vec3::new(-3.0, 0.0, -1.0), 0.5, 3, INVALID_ID_16BIT),
        Sphere::new(Vec3::new(3.0, 0.0, 1.0), 0.5, 4, INVALID_ID_16BIT),
        Sphere::new(Vec3::new(0.0, 0.0, 1.0), 0.5, 4, INVALID_ID_16BIT),
        Sphere::new(Vec3::new(-3.0, 0.0, 1.0), 0.5, 5, INVALID_ID_16BIT),
        Sphere::new(Vec3::new(0.5, 1.0, 0.5), 0.5, 6, INVALID_ID_16BIT),
        Sphere::new(Vec3::new(-1.5, 1.5, 0.0), 0.3, INVALID_ID_16BIT, 0),
    ]
}

/// Built structures over a sphere list, plus the sphere buffer shaders read.
pub struct SphereScene {
    structures: Vec<AccelerationStructureHandle>,
    ctx: Context,
    pub blas: AccelerationStructureHandle,
    pub tlas: AccelerationStructureHandle,
    pub blas_sizes: BuildSizes,
    pub tlas_sizes: BuildSizes,
    pub spheres: BufferRange,
    pub sphere_count: u32,
    _buffers: OwnedBuffers,
}

impl SphereScene {
    /// Upload, size, allocate and build both levels. The top level is
    /// submitted only after the bottom-level build's fence signaled.
    #[tracing::instrument(skip_all, fields(spheres = spheres.len()))]
    pub fn build(ctx: &Context, spheres: &[Sphere]) -> Result<Self> {
        let builder = AccelerationStructureBuilder::new(ctx);
        let device = ctx.device();
        let mut buffers = OwnedBuffers::new(ctx.device_arc());
        let mut structures = Vec::new();
        let count = spheres.len() as u32;

        let aabbs: Vec<PaddedAabb> = spheres.iter().map(|s| PaddedAabb::new(s.aabb())).collect();
        let aabb_range = buffers.upload(ctx, "sphere aabbs", GEOMETRY_INPUT_USAGE, &aabbs)?;
        let mut blas_info = BuildGeometryInfo::new(
            AccelerationStructureType::BottomLevel,
            BuildFlags::PREFER_FAST_TRACE,
            vec![Geometry::aabbs(aabb_range, PaddedAabb::STRIDE, GeometryFlags::OPAQUE)],
        );
        let blas_sizes = builder.get_build_sizes(&blas_info, &[count])?;
        let storage = buffers.create("blas storage", blas_sizes.structure_size, STRUCTURE_USAGE)?;
        let blas = builder.create_structure(
            AccelerationStructureType::BottomLevel,
            BuildFlags::empty(),
            storage,
            &blas_sizes,
        )?;
        structures.push(blas);
        blas_info.dst = Some(blas);
        blas_info.scratch = Some(buffers.create("blas scratch", blas_sizes.build_scratch_size, BUILD_SCRATCH_USAGE)?);
        builder.build_blocking(vec![blas_info], vec![vec![BuildRangeInfo::count(count)]])?;

        let instance = Instance::new(
            Affine3A::IDENTITY,
            0,
            0xff,
            0,
            InstanceFlags::TRIANGLE_FACING_CULL_DISABLE,
            device.acceleration_structure_reference(blas)?,
        );
        let instance_range = buffers.upload(ctx, "sphere instances", GEOMETRY_INPUT_USAGE, &[instance])?;
        let mut tlas_info = BuildGeometryInfo::new(
            AccelerationStructureType::TopLevel,
            BuildFlags::PREFER_FAST_TRACE,
            vec![Geometry::instances(instance_range)],
        );
        let tlas_sizes = builder.get_build_sizes(&tlas_info, &[1])?;
        let storage = buffers.create("tlas storage", tlas_sizes.structure_size, STRUCTURE_USAGE)?;
        let tlas =
            builder.create_structure(AccelerationStructureType::TopLevel, BuildFlags::empty(), storage, &tlas_sizes)?;
        structures.push(tlas);
        tlas_info.dst = Some(tlas);
        tlas_info.scratch = Some(buffers.create("tlas scratch", tlas_sizes.build_scratch_size, BUILD_SCRATCH_USAGE)?);
        builder.build_blocking(vec![tlas_info], vec![vec![BuildRangeInfo::count(1)]])?;

        let sphere_range = buffers.upload(ctx, "spheres", SHADER_DATA_USAGE, spheres)?;
        tracing::debug!(
            blas_size = blas_sizes.structure_size,
            tlas_size = tlas_sizes.structure_size,
            "sphere scene built"
        );
        Ok(Self {
            structures,
            ctx: ctx.clone(),
            blas,
            tlas,
            blas_sizes,
            tlas_sizes,
            spheres: sphere_range,
            sphere_count: count,
            _buffers: buffers,
        })
    }
}

impl Drop for SphereScene {
    fn drop(&mut self) {
        for structure in self.structures.drain(..).rev() {
            if let Err(e) = self.ctx.device().destroy_acceleration_structure(structure) {
                tracing::warn!(?structure, "structure release failed: {e}");
            }
        }
    }
}

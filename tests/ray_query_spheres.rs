//! Sphere scene build and ray queries through the host device.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use nabla::accel::{
    build_barrier, AccelerationStructureBuild, AccelerationStructureBuilder, AccelerationStructureHandle,
    AccelerationStructureType, BuildFlags, BuildGeometryInfo, BuildRangeInfo, Candidate, Geometry, GeometryFlags,
    Instance, InstanceFlags, PaddedAabb, BUILD_INPUT_USAGE,
};
use nabla::config::Config;
use nabla::scene::buffers::{OwnedBuffers, BUILD_SCRATCH_USAGE, GEOMETRY_INPUT_USAGE, STRUCTURE_USAGE};
use nabla::scene::{demo_spheres, Sphere, SphereRenderer, SphereScene, SPHERE_COUNT};
use nabla::util::{Affine3A, Error, Extent3, Ray, Result, Vec3};
use nabla::video::{
    BindingDesc, BindingKind, BufferDesc, BufferRange, BufferUsage, CommandList, ComputePipelineDesc, ComputeShader,
    Context, HostDevice, HostDispatch, HostKernel,
};

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct RayArgs {
    origin: [f32; 4],
    direction: [f32; 4],
}

/// Traces one ray and writes `[primitive, t bits]`, primitive `u32::MAX` on a miss.
struct TraceKernel;

impl HostKernel for TraceKernel {
    fn dispatch(&self, ctx: &mut HostDispatch<'_>) -> Result<()> {
        let ray: RayArgs = ctx.push_constants()?;
        let scene = ctx.scene(0)?;
        let spheres: Vec<Sphere> = ctx.read(1)?;
        let mut intersector = |c: &Candidate, t_min: f32, t_max: f32| {
            spheres[c.primitive_index as usize].intersect(c.object_ray.origin, c.object_ray.direction, t_min, t_max)
        };
        let ray = Ray::new(Vec3::from_slice(&ray.origin[..3]), Vec3::from_slice(&ray.direction[..3]));
        let out = match scene.query().trace(ray, 1e-4, f32::MAX, 0xff, &mut intersector) {
            Some(hit) => [hit.primitive_index, hit.t.to_bits()],
            None => [u32::MAX, 0],
        };
        ctx.write(2, &out)
    }
}

fn host_ctx() -> Context {
    Context::new(Arc::new(HostDevice::new()), Config::default())
}

fn trace_scene(ctx: &Context, scene: &SphereScene, origin: Vec3, direction: Vec3) -> Option<(u32, f32)> {
    trace_one(ctx, scene.tlas, scene.spheres, origin, direction)
}

fn trace_one(
    ctx: &Context,
    tlas: AccelerationStructureHandle,
    spheres: BufferRange,
    origin: Vec3,
    direction: Vec3,
) -> Option<(u32, f32)> {
    let device = ctx.device();
    let shader = ComputeShader::new("trace one", "fn main() {}", [1, 1, 1], &[]).unwrap().with_host_kernel(Arc::new(TraceKernel));
    let pipeline = device
        .create_compute_pipeline(&ComputePipelineDesc {
            label: "trace one".into(),
            shader,
            bindings: vec![
                BindingDesc::new(0, BindingKind::AccelerationStructure),
                BindingDesc::new(1, BindingKind::StorageRead),
                BindingDesc::new(2, BindingKind::StorageReadWrite),
            ],
            push_constant_size: std::mem::size_of::<RayArgs>() as u32,
        })
        .unwrap();
    let usage = BufferUsage::STORAGE | BufferUsage::TRANSFER_SRC;
    let out = device.create_buffer(&BufferDesc::new("trace out", 8, usage)).unwrap();
    let out = BufferRange::whole(out, 8);

    let mut list = CommandList::new("trace one");
    list.bind_compute_pipeline(pipeline)
        .bind_acceleration_structure(0, tlas)
        .bind_buffer(1, spheres)
        .bind_buffer(2, out)
        .push_constants(&RayArgs { origin: origin.extend(1.0).to_array(), direction: direction.extend(0.0).to_array() })
        .dispatch([1, 1, 1]);
    ctx.submit_and_wait(ctx.queues().compute, list).unwrap();

    let result: Vec<u32> = bytemuck::pod_collect_to_vec(&device.read_buffer(out).unwrap());
    device.destroy_buffer(out.buffer).unwrap();
    device.destroy_compute_pipeline(pipeline).unwrap();
    (result[0] != u32::MAX).then(|| (result[0], f32::from_bits(result[1])))
}

#[test]
fn test_build_sizes_cover_inputs() {
    let ctx = host_ctx();
    let spheres = demo_spheres();
    let scene = SphereScene::build(&ctx, &spheres).unwrap();
    assert_eq!(scene.sphere_count, SPHERE_COUNT as u32);
    assert!(scene.blas_sizes.structure_size >= (SPHERE_COUNT as u64) * PaddedAabb::STRIDE);
    assert!(scene.tlas_sizes.structure_size > 0);
    assert!(scene.blas_sizes.build_scratch_size > 0);
}

#[test]
fn test_ray_through_center_hits_sphere_two() {
    let ctx = host_ctx();
    let scene = SphereScene::build(&ctx, &demo_spheres()).unwrap();

    // from above sphere 2 straight down: ground lies beyond it
    let (primitive, t) = trace_scene(&ctx, &scene, Vec3::new(0.0, 5.0, -1.0), -Vec3::Y).unwrap();
    assert_eq!(primitive, 2);
    assert!((t - 4.5).abs() < 1e-4, "t = {t}");

    // beside every small sphere the ground answers
    let (primitive, _) = trace_scene(&ctx, &scene, Vec3::new(1.5, 5.0, 0.0), -Vec3::Y).unwrap();
    assert_eq!(primitive, 0);

    // up into the sky
    assert!(trace_scene(&ctx, &scene, Vec3::new(0.0, 5.0, -1.0), Vec3::Y).is_none());
}

#[test]
fn test_light_is_hit_from_below() {
    let ctx = host_ctx();
    let scene = SphereScene::build(&ctx, &demo_spheres()).unwrap();
    let (primitive, t) = trace_scene(&ctx, &scene, Vec3::new(-1.5, 0.2, 0.0), Vec3::Y).unwrap();
    assert_eq!(primitive, 8);
    assert!((t - 1.0).abs() < 1e-4, "t = {t}");
}

#[test]
fn test_empty_bottom_level_builds_and_misses() {
    let ctx = host_ctx();
    let builder = AccelerationStructureBuilder::new(&ctx);
    let mut buffers = OwnedBuffers::new(ctx.device_arc());

    let aabbs = buffers.upload(&ctx, "aabbs", GEOMETRY_INPUT_USAGE, &[PaddedAabb::new(demo_spheres()[2].aabb())]).unwrap();
    let mut blas_info = BuildGeometryInfo::new(
        AccelerationStructureType::BottomLevel,
        BuildFlags::PREFER_FAST_TRACE,
        vec![Geometry::aabbs(aabbs, PaddedAabb::STRIDE, GeometryFlags::OPAQUE)],
    );
    let sizes = builder.get_build_sizes(&blas_info, &[0]).unwrap();
    assert!(sizes.structure_size > 0);
    let storage = buffers.create("blas", sizes.structure_size, STRUCTURE_USAGE).unwrap();
    let blas = builder
        .create_structure(AccelerationStructureType::BottomLevel, BuildFlags::empty(), storage, &sizes)
        .unwrap();
    blas_info.dst = Some(blas);
    blas_info.scratch = Some(buffers.create("blas scratch", sizes.build_scratch_size.max(4), BUILD_SCRATCH_USAGE).unwrap());
    builder.build_blocking(vec![blas_info], vec![vec![BuildRangeInfo::count(0)]]).unwrap();

    let instance = Instance::new(
        Affine3A::IDENTITY,
        0,
        0xff,
        0,
        InstanceFlags::empty(),
        ctx.device().acceleration_structure_reference(blas).unwrap(),
    );
    let instances = buffers.upload(&ctx, "instances", GEOMETRY_INPUT_USAGE, &[instance]).unwrap();
    let mut tlas_info = BuildGeometryInfo::new(
        AccelerationStructureType::TopLevel,
        BuildFlags::PREFER_FAST_TRACE,
        vec![Geometry::instances(instances)],
    );
    let tlas_sizes = builder.get_build_sizes(&tlas_info, &[1]).unwrap();
    let storage = buffers.create("tlas", tlas_sizes.structure_size, STRUCTURE_USAGE).unwrap();
    let tlas = builder
        .create_structure(AccelerationStructureType::TopLevel, BuildFlags::empty(), storage, &tlas_sizes)
        .unwrap();
    tlas_info.dst = Some(tlas);
    tlas_info.scratch =
        Some(buffers.create("tlas scratch", tlas_sizes.build_scratch_size.max(4), BUILD_SCRATCH_USAGE).unwrap());
    builder.build_blocking(vec![tlas_info], vec![vec![BuildRangeInfo::count(1)]]).unwrap();

    // the ray passes straight through where sphere 2 would be
    let spheres = buffers.upload(&ctx, "spheres", BufferUsage::STORAGE, &demo_spheres()).unwrap();
    assert!(trace_one(&ctx, tlas, spheres, Vec3::new(0.0, 5.0, -1.0), -Vec3::Y).is_none());

    ctx.device().destroy_acceleration_structure(tlas).unwrap();
    ctx.device().destroy_acceleration_structure(blas).unwrap();
}

#[test]
fn test_top_level_needs_built_bottom_level() {
    let ctx = host_ctx();
    let builder = AccelerationStructureBuilder::new(&ctx);
    let mut buffers = OwnedBuffers::new(ctx.device_arc());

    let aabbs = [PaddedAabb::new(demo_spheres()[2].aabb())];
    let aabbs = buffers.upload(&ctx, "aabbs", GEOMETRY_INPUT_USAGE, &aabbs).unwrap();
    let blas_info = BuildGeometryInfo::new(
        AccelerationStructureType::BottomLevel,
        BuildFlags::PREFER_FAST_TRACE,
        vec![Geometry::aabbs(aabbs, PaddedAabb::STRIDE, GeometryFlags::OPAQUE)],
    );
    let sizes = builder.get_build_sizes(&blas_info, &[1]).unwrap();
    let storage = buffers.create("blas", sizes.structure_size, STRUCTURE_USAGE).unwrap();
    let blas = builder
        .create_structure(AccelerationStructureType::BottomLevel, BuildFlags::empty(), storage, &sizes)
        .unwrap();

    let instance = Instance::new(
        Affine3A::IDENTITY,
        0,
        0xff,
        0,
        InstanceFlags::empty(),
        ctx.device().acceleration_structure_reference(blas).unwrap(),
    );
    let instances = buffers.upload(&ctx, "instances", GEOMETRY_INPUT_USAGE, &[instance]).unwrap();
    let mut tlas_info = BuildGeometryInfo::new(
        AccelerationStructureType::TopLevel,
        BuildFlags::PREFER_FAST_TRACE,
        vec![Geometry::instances(instances)],
    );
    let tlas_sizes = builder.get_build_sizes(&tlas_info, &[1]).unwrap();
    let storage = buffers.create("tlas", tlas_sizes.structure_size, STRUCTURE_USAGE).unwrap();
    let tlas = builder
        .create_structure(AccelerationStructureType::TopLevel, BuildFlags::empty(), storage, &tlas_sizes)
        .unwrap();
    tlas_info.dst = Some(tlas);
    tlas_info.scratch = Some(buffers.create("scratch", tlas_sizes.build_scratch_size, BUILD_SCRATCH_USAGE).unwrap());

    let err = builder.build_blocking(vec![tlas_info], vec![vec![BuildRangeInfo::count(1)]]).unwrap_err();
    assert!(matches!(err, Error::UnbuiltDependency { .. }), "{err}");

    ctx.device().destroy_acceleration_structure(tlas).unwrap();
    ctx.device().destroy_acceleration_structure(blas).unwrap();
}

/// BLAS and TLAS builds over one sphere, recorded into the same list.
fn record_both_levels(ctx: &Context, buffers: &mut OwnedBuffers, barrier: bool) -> Result<Vec<AccelerationStructureHandle>> {
    let builder = AccelerationStructureBuilder::new(ctx);
    let aabbs = buffers.upload(ctx, "aabbs", GEOMETRY_INPUT_USAGE, &[PaddedAabb::new(demo_spheres()[2].aabb())])?;
    let mut blas_info = BuildGeometryInfo::new(
        AccelerationStructureType::BottomLevel,
        BuildFlags::PREFER_FAST_TRACE,
        vec![Geometry::aabbs(aabbs, PaddedAabb::STRIDE, GeometryFlags::OPAQUE)],
    );
    let sizes = builder.get_build_sizes(&blas_info, &[1])?;
    let storage = buffers.create("blas", sizes.structure_size, STRUCTURE_USAGE)?;
    let blas = builder.create_structure(AccelerationStructureType::BottomLevel, BuildFlags::empty(), storage, &sizes)?;
    blas_info.dst = Some(blas);
    blas_info.scratch = Some(buffers.create("blas scratch", sizes.build_scratch_size.max(4), BUILD_SCRATCH_USAGE)?);

    let reference = ctx.device().acceleration_structure_reference(blas)?;
    let instance = Instance::new(Affine3A::IDENTITY, 0, 0xff, 0, InstanceFlags::empty(), reference);
    let instances = buffers.upload(ctx, "instances", GEOMETRY_INPUT_USAGE, &[instance])?;
    let mut tlas_info = BuildGeometryInfo::new(
        AccelerationStructureType::TopLevel,
        BuildFlags::PREFER_FAST_TRACE,
        vec![Geometry::instances(instances)],
    );
    let sizes = builder.get_build_sizes(&tlas_info, &[1])?;
    let storage = buffers.create("tlas", sizes.structure_size, STRUCTURE_USAGE)?;
    let tlas = builder.create_structure(AccelerationStructureType::TopLevel, BuildFlags::empty(), storage, &sizes)?;
    tlas_info.dst = Some(tlas);
    tlas_info.scratch = Some(buffers.create("tlas scratch", sizes.build_scratch_size.max(4), BUILD_SCRATCH_USAGE)?);

    let mut list = CommandList::new("both levels");
    builder.record(&mut list, vec![AccelerationStructureBuild { info: blas_info, ranges: vec![BuildRangeInfo::count(1)] }])?;
    if barrier {
        list.pipeline_barrier(build_barrier());
    }
    builder.record(&mut list, vec![AccelerationStructureBuild { info: tlas_info, ranges: vec![BuildRangeInfo::count(1)] }])?;
    if let Err(e) = ctx.submit_and_wait(ctx.queues().compute, list) {
        ctx.device().destroy_acceleration_structure(tlas)?;
        ctx.device().destroy_acceleration_structure(blas)?;
        return Err(e);
    }
    Ok(vec![tlas, blas])
}

#[test]
fn test_top_level_in_same_list_needs_build_barrier() {
    let ctx = host_ctx();
    let mut buffers = OwnedBuffers::new(ctx.device_arc());
    let err = record_both_levels(&ctx, &mut buffers, false).unwrap_err();
    assert!(matches!(err, Error::MissingBarrier { .. }), "{err}");

    let handles = record_both_levels(&ctx, &mut buffers, true).unwrap();
    for h in handles {
        ctx.device().destroy_acceleration_structure(h).unwrap();
    }
}

#[test]
fn test_build_input_usage_is_checked() {
    let ctx = host_ctx();
    let builder = AccelerationStructureBuilder::new(&ctx);
    let mut buffers = OwnedBuffers::new(ctx.device_arc());
    // storage only, no build-input usage
    let aabbs = buffers
        .upload(&ctx, "aabbs", BufferUsage::STORAGE, &[PaddedAabb::new(demo_spheres()[1].aabb())])
        .unwrap();
    let mut info = BuildGeometryInfo::new(
        AccelerationStructureType::BottomLevel,
        BuildFlags::empty(),
        vec![Geometry::aabbs(aabbs, PaddedAabb::STRIDE, GeometryFlags::OPAQUE)],
    );
    let sizes = builder.get_build_sizes(&info, &[1]).unwrap();
    let storage = buffers.create("blas", sizes.structure_size, STRUCTURE_USAGE).unwrap();
    let blas = builder
        .create_structure(AccelerationStructureType::BottomLevel, BuildFlags::empty(), storage, &sizes)
        .unwrap();
    info.dst = Some(blas);
    info.scratch = Some(buffers.create("scratch", sizes.build_scratch_size.max(4), BUILD_SCRATCH_USAGE).unwrap());
    let err = builder.build_blocking(vec![info], vec![vec![BuildRangeInfo::count(1)]]).unwrap_err();
    assert!(matches!(err, Error::MissingUsage { .. }), "{err}");
    assert!(!BUILD_INPUT_USAGE.is_empty());
    ctx.device().destroy_acceleration_structure(blas).unwrap();
}

#[test]
fn test_renderer_output_is_finite_and_lit() {
    let ctx = host_ctx();
    let scene = SphereScene::build(&ctx, &demo_spheres()).unwrap();
    let mut renderer = SphereRenderer::new(&ctx, &scene, 32, 24, None).unwrap();
    let image = renderer.render(&ctx, 4).unwrap();
    assert_eq!(image.extent(), Extent3::d2(32, 24));
    let texels = image.to_linear();
    assert!(texels.iter().all(|t| t.iter().all(|c| c.is_finite() && *c >= 0.0)));
    // the camera sees at least some sky and some surface
    let sky = texels.iter().filter(|t| (t[2] - 0.9).abs() < 1e-4).count();
    assert!(sky > 0 && sky < texels.len());
}

//! Progressive ray-query renderer over a [`SphereScene`].
//!
//! Binding layout of the compute pipeline:
//!
//! | binding | contents |
//! |---|---|
//! | 0 | environment map, linear `[f32; 4]` texels, equirectangular |
//! | 1 | sample sequence, sample-major fixed point |
//! | 2 | per-pixel scramble keys |
//! | 3 | top-level acceleration structure |
//! | 4 | sphere records |
//! | 5 | output texels |
//!
//! Every frame renders into the output buffer of its ring slot. When a slot
//! comes around again its previous frame has retired and is folded into the
//! running average.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use rayon::prelude::*;

use crate::accel::{Candidate, SceneView};
use crate::asset::GpuImage;
use crate::blit::{Image, TexelFormat};
use crate::util::sampling::{
    bits_to_unit, scramble_keys, SampleSequence, DEFAULT_SCRAMBLE_SEED, DEFAULT_SEQUENCE_SEED,
};
use crate::util::{dispatch_size, Error, Extent3, Ray, Result, Vec3};
use crate::video::{
    BindingDesc, BindingKind, BufferRange, BufferUsage, CommandList, ComputePipelineDesc, ComputeShader, Context,
    Device, FramesInFlight, HostDispatch, HostKernel, PipelineHandle,
};

use super::buffers::{OwnedBuffers, SHADER_DATA_USAGE};
use super::spheres::{Sphere, SphereScene, INVALID_ID_16BIT};

const RAY_QUERY_WGSL: &str = include_str!("shaders/ray_query.wgsl");

pub const BINDING_ENVIRONMENT: u32 = 0;
pub const BINDING_SAMPLE_SEQUENCE: u32 = 1;
pub const BINDING_SCRAMBLE: u32 = 2;
pub const BINDING_SCENE: u32 = 3;
pub const BINDING_SPHERES: u32 = 4;
pub const BINDING_OUTPUT: u32 = 5;

pub const WORKGROUP_SIZE: u32 = 16;
/// Pixel jitter takes two dimensions, light sampling the other two.
pub const SEQUENCE_DIMENSIONS: u32 = 4;
pub const MAX_SAMPLES_LOG2: u32 = 10;
pub const DEFAULT_LIGHT_RADIANCE: f32 = 16.0;

const SEQUENCE_DIMENSIONS_DEFINE: &str = "_NBL_GLSL_SEQUENCE_DIMENSIONS_";
const INVALID_ID_DEFINE: &str = "_NBL_GLSL_INVALID_ID_";
const OUTPUT_USAGE: BufferUsage = BufferUsage::STORAGE.union(BufferUsage::TRANSFER_SRC);
const SKY: [f32; 4] = [0.6, 0.7, 0.9, 1.0];
const T_MIN: f32 = 1e-4;

/// Push constants shared with `ray_query.wgsl`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct RenderParams {
    /// w: tan(fov_y / 2)
    pub camera_origin: [f32; 4],
    /// w: aspect
    pub camera_right: [f32; 4],
    pub camera_up: [f32; 4],
    pub camera_forward: [f32; 4],
    /// zw: first sample, samples this frame
    pub output_extent: [u32; 4],
    /// z: sphere count, w: sequence length
    pub environment_extent: [u32; 4],
    pub light_radiance: [f32; 4],
}

impl RenderParams {
    fn direction(&self, x: u32, y: u32, jitter: [f32; 2]) -> Vec3 {
        let [w, h] = [self.output_extent[0] as f32, self.output_extent[1] as f32];
        let tan_half = self.camera_origin[3];
        let aspect = self.camera_right[3];
        let sx = (2.0 * (x as f32 + jitter[0]) / w - 1.0) * tan_half * aspect;
        let sy = (1.0 - 2.0 * (y as f32 + jitter[1]) / h) * tan_half;
        let forward = Vec3::from_slice(&self.camera_forward[..3]);
        let right = Vec3::from_slice(&self.camera_right[..3]);
        let up = Vec3::from_slice(&self.camera_up[..3]);
        (forward + sx * right + sy * up).normalize()
    }
}

/// Pinhole camera, right handed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub fov_y_degrees: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self { position: Vec3::new(0.0, 5.0, -10.0), target: Vec3::ZERO, up: Vec3::Y, fov_y_degrees: 60.0 }
    }
}

impl Camera {
    /// Right, up and forward vectors.
    pub fn basis(&self) -> (Vec3, Vec3, Vec3) {
        let forward = (self.target - self.position).normalize_or(Vec3::NEG_Z);
        let right = forward.cross(self.up).normalize_or(Vec3::X);
        (right, right.cross(forward), forward)
    }
}

struct Environment<'a> {
    texels: &'a [[f32; 4]],
    width: u32,
    height: u32,
}

impl Environment<'_> {
    fn radiance(&self, dir: Vec3) -> Vec3 {
        if self.texels.is_empty() || self.width == 0 || self.height == 0 {
            return Vec3::from_slice(&SKY[..3]);
        }
        let u = 0.5 + dir.z.atan2(dir.x) / (2.0 * std::f32::consts::PI);
        let v = dir.y.clamp(-1.0, 1.0).acos() / std::f32::consts::PI;
        let x = ((u * self.width as f32) as u32).min(self.width - 1);
        let y = ((v * self.height as f32) as u32).min(self.height - 1);
        let t = self.texels.get((y * self.width + x) as usize).copied().unwrap_or(SKY);
        Vec3::new(t[0], t[1], t[2])
    }
}

fn albedo(bsdf: u32) -> Vec3 {
    let h = bsdf.wrapping_add(1).wrapping_mul(2_654_435_761);
    let c = |shift: u32| ((h >> shift) & 255) as f32 / 255.0 * 0.6 + 0.2;
    Vec3::new(c(0), c(8), c(16))
}

struct Tracer<'a> {
    scene: &'a SceneView,
    spheres: &'a [Sphere],
    sphere_count: usize,
    environment: Environment<'a>,
    sequence: &'a [u32],
    params: &'a RenderParams,
}

impl Tracer<'_> {
    fn sequence(&self, sample: u32, dim: u32, key: u32) -> f32 {
        let len = (self.params.environment_extent[3].max(1)) as usize;
        let s = sample as usize % len;
        let value = self.sequence.get(s * SEQUENCE_DIMENSIONS as usize + dim as usize).copied().unwrap_or(0);
        bits_to_unit(value ^ key)
    }

    fn trace(&self, ray: Ray, t_max: f32) -> Option<(f32, usize)> {
        let spheres = self.spheres;
        let mut intersector = |c: &Candidate, t_min: f32, t_max: f32| {
            spheres.get(c.primitive_index as usize)?.intersect(c.object_ray.origin, c.object_ray.direction, t_min, t_max)
        };
        self.scene.query().trace(ray, T_MIN, t_max, 0xff, &mut intersector).map(|h| (h.t, h.primitive_index as usize))
    }

    fn shade(&self, origin: Vec3, dir: Vec3, sample: u32, key: u32) -> Vec3 {
        let light_radiance = Vec3::from_slice(&self.params.light_radiance[..3]);
        let Some((t, index)) = self.trace(Ray::new(origin, dir), f32::MAX) else {
            return self.environment.radiance(dir);
        };
        let Some(sphere) = self.spheres.get(index) else {
            return Vec3::ZERO;
        };
        if sphere.light_id() != INVALID_ID_16BIT {
            return light_radiance;
        }
        let p = origin + dir * t;
        let n = (p - sphere.center()).normalize_or_zero();
        let base = albedo(sphere.bsdf_id());
        let mut color = base * self.environment.radiance(n) * 0.1;
        for (i, light) in self.spheres.iter().enumerate().take(self.sphere_count) {
            if light.light_id() == INVALID_ID_16BIT {
                continue;
            }
            let z = self.sequence(sample, 2, key) * 2.0 - 1.0;
            let phi = self.sequence(sample, 3, key) * 2.0 * std::f32::consts::PI;
            let r = (1.0 - z * z).max(0.0).sqrt();
            let point = light.center() + light.radius() * Vec3::new(r * phi.cos(), r * phi.sin(), z);
            let to_light = point - p;
            let dist = to_light.length();
            let ldir = to_light / dist;
            let cos_theta = n.dot(ldir);
            if cos_theta <= 0.0 {
                continue;
            }
            if let Some((_, occluder)) = self.trace(Ray::new(p + n * 1e-3, ldir), dist + 1e-3) {
                if occluder == i {
                    color += base * light_radiance * cos_theta * light.radius2 / (dist * dist);
                }
            }
        }
        color
    }

    fn pixel(&self, x: u32, y: u32, key: u32) -> [f32; 4] {
        let first = self.params.output_extent[2];
        let count = self.params.output_extent[3].max(1);
        let origin = Vec3::from_slice(&self.params.camera_origin[..3]);
        let mut acc = Vec3::ZERO;
        for i in 0..count {
            let sample = first + i;
            let jitter = [self.sequence(sample, 0, key), self.sequence(sample, 1, key)];
            acc += self.shade(origin, self.params.direction(x, y, jitter), sample, key);
        }
        let c = acc / count as f32;
        [c.x, c.y, c.z, 1.0]
    }
}

/// Host implementation of `ray_query.wgsl`.
#[derive(Debug, Default)]
pub struct RayQueryKernel;

impl HostKernel for RayQueryKernel {
    fn dispatch(&self, ctx: &mut HostDispatch<'_>) -> Result<()> {
        let params: RenderParams = ctx.push_constants()?;
        let scene = ctx.scene(BINDING_SCENE)?;
        let environment = ctx.read::<[f32; 4]>(BINDING_ENVIRONMENT)?;
        let sequence = ctx.read::<u32>(BINDING_SAMPLE_SEQUENCE)?;
        let scramble = ctx.read::<u32>(BINDING_SCRAMBLE)?;
        let spheres = ctx.read::<Sphere>(BINDING_SPHERES)?;
        let mut output = ctx.read::<[f32; 4]>(BINDING_OUTPUT)?;

        let [w, h] = [params.output_extent[0], params.output_extent[1]];
        let pixels = w as usize * h as usize;
        if output.len() < pixels || scramble.len() < pixels {
            return Err(Error::range(format!("output or scramble binding holds fewer than {pixels} pixels")));
        }
        let inv = ctx.invocations();
        let (cw, ch) = (w.min(inv[0]), h.min(inv[1]));
        let tracer = Tracer {
            scene: &scene,
            sphere_count: (params.environment_extent[2] as usize).min(spheres.len()),
            spheres: &spheres,
            environment: Environment {
                texels: &environment,
                width: params.environment_extent[0],
                height: params.environment_extent[1],
            },
            sequence: &sequence,
            params: &params,
        };
        let rows: Vec<Vec<[f32; 4]>> = (0..ch)
            .into_par_iter()
            .map(|y| (0..cw).map(|x| tracer.pixel(x, y, scramble[(y * w + x) as usize])).collect())
            .collect();
        for (y, row) in rows.into_iter().enumerate() {
            let start = y * w as usize;
            output[start..start + row.len()].copy_from_slice(&row);
        }
        ctx.write(BINDING_OUTPUT, &output)
    }
}

struct FrameSlot {
    output: BufferRange,
    frame: Option<u64>,
}

/// Pipeline, bindings and the in-flight ring for rendering one scene.
pub struct SphereRenderer<'s> {
    scene: &'s SphereScene,
    device: Arc<dyn Device>,
    pipeline: PipelineHandle,
    width: u32,
    height: u32,
    environment: BufferRange,
    environment_extent: [u32; 2],
    sequence: BufferRange,
    sequence_samples: u32,
    scramble: BufferRange,
    ring: FramesInFlight<FrameSlot>,
    accumulated: Vec<[f32; 4]>,
    frames_folded: u32,
    pub camera: Camera,
    pub samples_per_frame: u32,
    pub light_radiance: f32,
    _buffers: OwnedBuffers,
}

impl<'s> SphereRenderer<'s> {
    /// `environment` stays owned by the caller; without one a constant sky is used.
    #[tracing::instrument(skip_all, fields(width, height))]
    pub fn new(
        ctx: &Context,
        scene: &'s SphereScene,
        width: u32,
        height: u32,
        environment: Option<GpuImage>,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::range(format!("render target {width}x{height} is empty")));
        }
        let device = ctx.device_arc();
        if !device.features().ray_query {
            return Err(Error::Unsupported(format!("ray queries on '{}'", device.name())));
        }
        let mut buffers = OwnedBuffers::new(device.clone());
        let (environment, environment_extent) = match environment {
            Some(image) => (image.range(), [image.extent.width, image.extent.height]),
            None => (buffers.upload(ctx, "sky", SHADER_DATA_USAGE, &[SKY])?, [1, 1]),
        };
        let sequence_samples = 1u32 << MAX_SAMPLES_LOG2;
        let sequence = SampleSequence::generate(SEQUENCE_DIMENSIONS, sequence_samples, DEFAULT_SEQUENCE_SEED);
        let sequence = buffers.upload(ctx, "sample sequence", SHADER_DATA_USAGE, sequence.as_slice())?;
        let pixels = width as usize * height as usize;
        let scramble = buffers.upload(ctx, "scramble", SHADER_DATA_USAGE, &scramble_keys(pixels, DEFAULT_SCRAMBLE_SEED))?;

        let shader = ComputeShader::new(
            "ray_query.wgsl",
            RAY_QUERY_WGSL,
            [WORKGROUP_SIZE, WORKGROUP_SIZE, 1],
            &[
                (SEQUENCE_DIMENSIONS_DEFINE, SEQUENCE_DIMENSIONS.to_string()),
                (INVALID_ID_DEFINE, INVALID_ID_16BIT.to_string()),
            ],
        )?
        .with_host_kernel(Arc::new(RayQueryKernel));
        let pipeline = device.create_compute_pipeline(&ComputePipelineDesc {
            label: "ray query".into(),
            shader,
            bindings: vec![
                BindingDesc::new(BINDING_ENVIRONMENT, BindingKind::StorageRead),
                BindingDesc::new(BINDING_SAMPLE_SEQUENCE, BindingKind::StorageRead),
                BindingDesc::new(BINDING_SCRAMBLE, BindingKind::StorageRead),
                BindingDesc::new(BINDING_SCENE, BindingKind::AccelerationStructure),
                BindingDesc::new(BINDING_SPHERES, BindingKind::StorageRead),
                BindingDesc::new(BINDING_OUTPUT, BindingKind::StorageReadWrite),
            ],
            push_constant_size: std::mem::size_of::<RenderParams>() as u32,
        })?;

        let output_size = pixels as u64 * 16;
        let frames = ctx.config().device.frames_in_flight as usize;
        let ring = FramesInFlight::with(frames, |i| {
            Ok(FrameSlot { output: buffers.create(&format!("frame output {i}"), output_size, OUTPUT_USAGE)?, frame: None })
        });
        let ring = match ring {
            Ok(ring) => ring,
            Err(e) => {
                let _ = device.destroy_compute_pipeline(pipeline);
                return Err(e);
            }
        };
        tracing::debug!(frames = ring.len(), "ray query renderer ready");
        Ok(Self {
            scene,
            device,
            pipeline,
            width,
            height,
            environment,
            environment_extent,
            sequence,
            sequence_samples,
            scramble,
            ring,
            accumulated: vec![[0.0; 4]; pixels],
            frames_folded: 0,
            camera: Camera::default(),
            samples_per_frame: 1,
            light_radiance: DEFAULT_LIGHT_RADIANCE,
            _buffers: buffers,
        })
    }

    pub fn frames_in_flight(&self) -> usize {
        self.ring.len()
    }

    /// Blocking waits the ring performed so far.
    pub fn ring_waits(&self) -> u64 {
        self.ring.waits()
    }

    pub fn params(&self, frame: u64) -> RenderParams {
        let (right, up, forward) = self.camera.basis();
        let tan_half = (self.camera.fov_y_degrees.to_radians() * 0.5).tan();
        let aspect = self.width as f32 / self.height as f32;
        let spp = self.samples_per_frame.max(1);
        RenderParams {
            camera_origin: self.camera.position.extend(tan_half).to_array(),
            camera_right: right.extend(aspect).to_array(),
            camera_up: up.extend(0.0).to_array(),
            camera_forward: forward.extend(0.0).to_array(),
            output_extent: [self.width, self.height, (frame as u32).wrapping_mul(spp), spp],
            environment_extent: [
                self.environment_extent[0],
                self.environment_extent[1],
                self.scene.sphere_count,
                self.sequence_samples,
            ],
            light_radiance: [self.light_radiance, self.light_radiance, self.light_radiance, 1.0],
        }
    }

    fn record(&self, list: &mut CommandList, output: BufferRange, frame: u64) {
        list.bind_compute_pipeline(self.pipeline)
            .bind_buffer(BINDING_ENVIRONMENT, self.environment)
            .bind_buffer(BINDING_SAMPLE_SEQUENCE, self.sequence)
            .bind_buffer(BINDING_SCRAMBLE, self.scramble)
            .bind_acceleration_structure(BINDING_SCENE, self.scene.tlas)
            .bind_buffer(BINDING_SPHERES, self.scene.spheres)
            .bind_buffer(BINDING_OUTPUT, output)
            .push_constants(&self.params(frame))
            .dispatch(dispatch_size([self.width, self.height, 1], [WORKGROUP_SIZE, WORKGROUP_SIZE, 1]));
    }

    fn fold(&mut self, output: BufferRange) -> Result<()> {
        let bytes = self.device.read_buffer(output)?;
        let texels: Vec<[f32; 4]> = bytemuck::pod_collect_to_vec(&bytes);
        for (acc, t) in self.accumulated.iter_mut().zip(texels) {
            for c in 0..4 {
                acc[c] += t[c];
            }
        }
        self.frames_folded += 1;
        Ok(())
    }

    /// Submit one frame on the compute queue.
    pub fn render_frame(&mut self, ctx: &Context) -> Result<()> {
        let frame = self.ring.frame();
        let (index, slot) = self.ring.acquire(ctx)?;
        let output = slot.output;
        let retired = slot.frame.replace(frame);
        if retired.is_some() {
            self.fold(output)?;
        }
        let mut list = CommandList::new(format!("ray query frame {frame}"));
        self.record(&mut list, output, frame);
        let fence = self.device.submit(ctx.queues().compute, list)?;
        self.ring.submitted(index, fence);
        Ok(())
    }

    /// Wait for every in-flight frame and return the average of all frames.
    pub fn finish(&mut self, ctx: &Context) -> Result<Image> {
        self.ring.wait_idle(ctx)?;
        let pending: Vec<BufferRange> =
            self.ring.resources_mut().filter_map(|slot| slot.frame.take().map(|_| slot.output)).collect();
        for output in pending {
            self.fold(output)?;
        }
        let n = self.frames_folded.max(1) as f32;
        let texels: Vec<[f32; 4]> = self.accumulated.iter().map(|t| [t[0] / n, t[1] / n, t[2] / n, 1.0]).collect();
        tracing::debug!(frames = self.frames_folded, waits = self.ring.waits(), "frames accumulated");
        Image::from_linear(Extent3::d2(self.width, self.height), TexelFormat::Rgba32Float, &texels)
    }

    /// `frames` frames through the ring, then [`Self::finish`].
    #[tracing::instrument(skip(self, ctx))]
    pub fn render(&mut self, ctx: &Context, frames: u32) -> Result<Image> {
        for _ in 0..frames {
            self.render_frame(ctx)?;
        }
        self.finish(ctx)
    }
}

impl Drop for SphereRenderer<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.device.destroy_compute_pipeline(self.pipeline) {
            tracing::warn!("ray query pipeline release failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::scene::spheres::demo_spheres;
    use crate::video::HostDevice;

    fn host_ctx(frames: u32) -> Context {
        let mut config = Config::default();
        config.device.frames_in_flight = frames;
        Context::new(Arc::new(HostDevice::new()), config)
    }

    #[test]
    fn test_camera_basis_orthonormal() {
        let (right, up, forward) = Camera::default().basis();
        assert!((right.length() - 1.0).abs() < 1e-5);
        assert!(right.dot(up).abs() < 1e-5 && up.dot(forward).abs() < 1e-5);
        assert!(up.y > 0.0);
    }

    #[test]
    fn test_center_pixel_sees_middle_sphere() {
        let ctx = host_ctx(2);
        let scene = SphereScene::build(&ctx, &demo_spheres()).unwrap();
        let mut renderer = SphereRenderer::new(&ctx, &scene, 9, 9, None).unwrap();
        // look straight down the axis through sphere 2
        renderer.camera = Camera { position: Vec3::new(0.0, 0.0, 5.0), target: Vec3::new(0.0, 0.0, -1.0), ..Camera::default() };
        let image = renderer.render(&ctx, 3).unwrap();
        assert_eq!(image.extent(), Extent3::d2(9, 9));
        let texels = image.to_linear();
        let center = texels[4 * 9 + 4];
        let sky = Vec3::from_slice(&SKY[..3]);
        assert!(Vec3::new(center[0], center[1], center[2]).distance(sky) > 1e-3);
        assert!(texels.iter().all(|t| t.iter().all(|c| c.is_finite())));
    }

    #[test]
    fn test_ring_slots_fold_every_frame() {
        let ctx = host_ctx(2);
        let scene = SphereScene::build(&ctx, &demo_spheres()).unwrap();
        let mut renderer = SphereRenderer::new(&ctx, &scene, 4, 3, None).unwrap();
        assert_eq!(renderer.frames_in_flight(), 2);
        for _ in 0..5 {
            renderer.render_frame(&ctx).unwrap();
        }
        renderer.finish(&ctx).unwrap();
        assert_eq!(renderer.frames_folded, 5);
        // host frames retire at submit
        assert_eq!(renderer.ring_waits(), 0);
    }
}

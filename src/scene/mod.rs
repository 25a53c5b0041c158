//! Ray-query demo: the sphere scene, its acceleration structures and a
//! progressive renderer over them.

pub mod buffers;
pub mod render;
pub mod spheres;

pub use render::{Camera, RayQueryKernel, RenderParams, SphereRenderer};
pub use spheres::{demo_spheres, Sphere, SphereScene, INVALID_ID_16BIT, SPHERE_COUNT};

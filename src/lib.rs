//! # Nabla
//!
//! Compute-side pieces of the Nabla engine built on a small device layer.
//!
//! ## Modules
//!
//! - [`util`] - Errors, handles, math and sampling helpers
//! - [`config`] - JSON engine configuration
//! - [`video`] - Device abstraction with a host (CPU) and a wgpu backend
//! - [`accel`] - Two-level acceleration structures and ray queries
//! - [`blit`] - Coverage-preserving filtered blits, CPU and device paths
//! - [`material`] - BSDF graphs compiled into a hash-consed material IR
//! - [`asset`] - Asset loading, caching and device upload
//! - [`scene`] - Ray-query sphere renderer
//!
//! ## Example
//!
//! ```ignore
//! use nabla::blit::{blit_blocking, BlitPipelines, BlitState, TexelFormat};
//!
//! let ctx = nabla::video::Context::new(device, config);
//! let pipelines = BlitPipelines::new(&ctx)?;
//! let state = BlitState::new(input.extent(), Extent3::d2(256, 256)).with_coverage(0.5);
//! let out = blit_blocking(&ctx, &pipelines, &state, &input, TexelFormat::Rgba8Srgb)?;
//! ```

pub mod util;
pub mod config;
pub mod video;
pub mod accel;
pub mod blit;
pub mod material;
pub mod asset;
pub mod scene;
pub mod logging;

pub use util::{Error, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::util::{Error, Result, Extent3, Vec3, Affine3A, Ray};
    pub use crate::config::Config;
    pub use crate::video::{Context, Device, HostDevice};
    pub use crate::accel::AccelerationStructureBuilder;
    pub use crate::blit::{BlitState, Image, TexelFormat};
    pub use crate::material::{BsdfGraph, MaterialCompiler};
}

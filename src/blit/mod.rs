//! Filtered image resampling with alpha-coverage preservation.
//!
//! A blit runs as up to three passes: an alpha test counting input texels
//! above the reference alpha, the windowed resample itself, and a
//! normalization pass rescaling output alpha so the thresholded coverage
//! matches the input. [`cpu`] is the reference path, [`gpu`] records the
//! same passes for any [`Device`](crate::video::Device).

pub mod coverage;
pub mod cpu;
pub mod gpu;
pub mod host;
pub mod image;
pub mod kernel;
pub mod lut;
pub mod params;
pub mod sampler;
pub mod state;

pub use cpu::{blit, blit_linear, BlitOutput};
pub use gpu::{blit_blocking, blit_linear_blocking, BlitPipelines};
pub use image::{Image, TexelFormat};
pub use kernel::{BoxKernel, Kernel, LanczosKernel, TriangleKernel};
pub use lut::{AxisLut, PhaseSupportLut};
pub use state::{AlphaSemantic, BlitState, BorderColor, WrapMode};

//! Utility types shared across the crate.
//!
//! - [`Error`] / [`Result`] - Error handling
//! - [`SlotArena`] / [`Handle`] - Generation-checked object tables
//! - Math re-exports from glam plus [`Aabb`], [`Ray`], [`Extent3`]
//! - Low-discrepancy sequences and scrambles for sampling

mod arena;
mod error;
mod math;
pub mod sampling;

pub use arena::*;
pub use error::*;
pub use math::*;

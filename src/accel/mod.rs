//! Two-level acceleration structures.
//!
//! - [`AccelerationStructureBuilder`] - size queries, creation and builds
//! - [`bvh`] - binned SAH hierarchy shared by both levels
//! - [`layout`] - serialized structure format
//! - [`software`] - CPU build used by the host device
//! - [`RayQuery`] / [`SceneView`] - closest-hit traversal

mod builder;
pub mod bvh;
pub mod layout;
mod query;
pub mod software;
mod types;

pub use builder::*;
pub use query::*;
pub use types::*;
pub use crate::video::AccelerationStructureHandle;

//! Device abstraction.
//!
//! The [`Device`] trait covers exactly what the acceleration-structure
//! builder, the blit pipeline and the scene renderer need: buffers with
//! declared usage, compute pipelines, command lists with explicit barriers,
//! acceleration structures and fences. Two backends implement it:
//!
//! - [`HostDevice`] - software device, always available
//! - `WgpuDevice` - wgpu adapter (feature `wgpu`), no acceleration structures

mod command;
mod device;
mod frame;
pub mod hazard;
pub mod host;
mod shader;
mod types;
#[cfg(feature = "wgpu")]
mod wgpu_device;

use std::sync::Arc;

pub use command::*;
pub use device::*;
pub use frame::*;
pub use host::{HostDevice, HostDispatch, HostKernel};
pub use shader::*;
pub use types::*;
#[cfg(feature = "wgpu")]
pub use wgpu_device::WgpuDevice;

use crate::config::{BackendKind, Config};
use crate::util::Result;

/// Open the backend named by the configuration.
///
/// A wgpu request without an adapter (or without the `wgpu` feature) falls
/// back to the host device.
pub fn open_device(config: &Config) -> Result<Arc<dyn Device>> {
    let host = || -> Arc<dyn Device> { Arc::new(HostDevice::new().with_bvh_config(config.bvh.clone())) };
    match config.device.backend {
        BackendKind::Host => Ok(host()),
        #[cfg(feature = "wgpu")]
        BackendKind::Wgpu => match WgpuDevice::new_headless() {
            Ok(device) => Ok(Arc::new(device.with_staging_timeout(config.fence_timeout()))),
            Err(e) => {
                tracing::warn!("wgpu unavailable ({e}), using the host device");
                Ok(host())
            }
        },
        #[cfg(not(feature = "wgpu"))]
        BackendKind::Wgpu => {
            tracing::warn!("built without the wgpu feature, using the host device");
            Ok(host())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_host_device() {
        let device = open_device(&Config::default()).unwrap();
        assert!(device.features().acceleration_structure);
        assert!(device.name().contains("host"));
    }
}

//! Device buffers owned by a scene: build inputs, structure storage and
//! shader data, released together on drop.

use std::sync::Arc;

use bytemuck::Pod;

use crate::accel::{BUILD_INPUT_USAGE, SCRATCH_USAGE, STORAGE_USAGE};
use crate::util::Result;
use crate::video::{BufferDesc, BufferHandle, BufferRange, BufferUsage, Context, Device};

/// Raw AABB, vertex or instance data read by a build.
pub const GEOMETRY_INPUT_USAGE: BufferUsage =
    BUILD_INPUT_USAGE.union(BufferUsage::STORAGE).union(BufferUsage::TRANSFER_DST);
/// Backing memory of a structure.
pub const STRUCTURE_USAGE: BufferUsage = STORAGE_USAGE.union(BufferUsage::SHADER_DEVICE_ADDRESS);
/// Build scratch.
pub const BUILD_SCRATCH_USAGE: BufferUsage = SCRATCH_USAGE;
/// Read-only data bound to shaders.
pub const SHADER_DATA_USAGE: BufferUsage = BufferUsage::STORAGE.union(BufferUsage::TRANSFER_DST);

pub struct OwnedBuffers {
    device: Arc<dyn Device>,
    buffers: Vec<BufferHandle>,
}

impl OwnedBuffers {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self { device, buffers: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn create(&mut self, label: &str, size: u64, usage: BufferUsage) -> Result<BufferRange> {
        let buffer = self.device.create_buffer(&BufferDesc::new(label, size, usage))?;
        self.buffers.push(buffer);
        Ok(BufferRange::whole(buffer, size))
    }

    /// Create a buffer sized for `data` and fill it through a staging copy on
    /// the graphics queue.
    pub fn upload<T: Pod>(&mut self, ctx: &Context, label: &str, usage: BufferUsage, data: &[T]) -> Result<BufferRange> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let size = (bytes.len() as u64).max(4);
        let range = self.create(label, size, usage | BufferUsage::TRANSFER_DST)?;
        if !bytes.is_empty() {
            let target = range.slice(0, bytes.len() as u64)?;
            ctx.device().update_buffer_range_via_staging_buffer(ctx.queues().graphics, target, bytes)?;
        }
        Ok(range)
    }
}

impl Drop for OwnedBuffers {
    fn drop(&mut self) {
        for buffer in self.buffers.drain(..) {
            if let Err(e) = self.device.destroy_buffer(buffer) {
                tracing::warn!(?buffer, "buffer release failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::video::HostDevice;

    #[test]
    fn test_upload_declares_usage_and_contents() {
        let host = Arc::new(HostDevice::new());
        let ctx = Context::new(host.clone(), Config::default());
        let mut owned = OwnedBuffers::new(ctx.device_arc());
        let range = owned.upload(&ctx, "values", GEOMETRY_INPUT_USAGE | BufferUsage::TRANSFER_SRC, &[1u32, 2, 3]).unwrap();
        assert_eq!(range.size, 12);
        let info = host.buffer_info(range.buffer).unwrap();
        assert!(info.usage.contains(BUILD_INPUT_USAGE));
        let bytes = host.read_buffer(range).unwrap();
        assert_eq!(bytemuck::pod_collect_to_vec::<u8, u32>(&bytes), vec![1, 2, 3]);

        let empty = owned.upload::<u32>(&ctx, "empty", SHADER_DATA_USAGE, &[]).unwrap();
        assert_eq!(empty.size, 4);
        assert_eq!(owned.len(), 2);
        drop(owned);
        assert!(host.buffer_info(range.buffer).is_err());
    }
}

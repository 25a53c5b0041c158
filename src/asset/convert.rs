//! Upload of CPU images into device buffers.

use std::sync::Arc;

use crate::blit::Image;
use crate::util::{Extent3, Result};
use crate::video::{BufferDesc, BufferHandle, BufferRange, BufferUsage, CommandList, Context, FenceHandle};

/// Usage of uploaded image buffers.
pub const GPU_IMAGE_USAGE: BufferUsage =
    BufferUsage::STORAGE.union(BufferUsage::TRANSFER_DST).union(BufferUsage::TRANSFER_SRC);

/// A device-resident image: linear `[f32; 4]` texels in a storage buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuImage {
    pub buffer: BufferHandle,
    pub extent: Extent3,
    pub size: u64,
}

impl GpuImage {
    pub fn range(&self) -> BufferRange {
        BufferRange::whole(self.buffer, self.size)
    }
}

/// Converts CPU assets into device objects on the transfer queue.
pub struct GpuObjectConverter<'a> {
    ctx: &'a Context,
}

/// Uploads in flight. Staging buffers live until [`PendingConversion::wait`].
#[must_use = "the upload is only complete after wait()"]
pub struct PendingConversion<'a> {
    ctx: &'a Context,
    images: Vec<GpuImage>,
    staging: Vec<BufferHandle>,
    fence: Option<FenceHandle>,
}

impl<'a> GpuObjectConverter<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    /// Record and submit one copy per image. Nothing is waited on.
    #[tracing::instrument(skip_all, fields(images = images.len()))]
    pub fn begin(&self, images: &[Arc<Image>]) -> Result<PendingConversion<'a>> {
        let device = self.ctx.device();
        let mut pending = PendingConversion { ctx: self.ctx, images: Vec::new(), staging: Vec::new(), fence: None };
        let mut list = CommandList::new("asset upload");

        for (i, image) in images.iter().enumerate() {
            let texels = image.to_linear();
            let bytes: &[u8] = bytemuck::cast_slice(&texels);
            let size = bytes.len().max(16) as u64;
            let staging = device.create_buffer_with_data(
                &BufferDesc::new(format!("upload staging {i}"), size, BufferUsage::TRANSFER_SRC | BufferUsage::MAP_WRITE),
                bytes,
            )?;
            pending.staging.push(staging);
            let buffer = device.create_buffer(&BufferDesc::new(format!("image {i}"), size, GPU_IMAGE_USAGE))?;
            pending.images.push(GpuImage { buffer, extent: image.extent(), size });
            list.copy_buffer(BufferRange::whole(staging, size), buffer, 0);
        }

        if !list.is_empty() {
            pending.fence = Some(device.submit(self.ctx.queues().transfer, list)?);
        }
        Ok(pending)
    }
}

impl PendingConversion<'_> {
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Block until every copy landed, then hand out the device images.
    pub fn wait(mut self) -> Result<Vec<GpuImage>> {
        if let Some(fence) = self.fence.take() {
            self.ctx.wait(fence)?;
        }
        self.release_staging();
        Ok(std::mem::take(&mut self.images))
    }

    fn release_staging(&mut self) {
        for buffer in self.staging.drain(..) {
            if let Err(e) = self.ctx.device().destroy_buffer(buffer) {
                tracing::warn!("failed to release staging buffer: {e}");
            }
        }
    }
}

impl Drop for PendingConversion<'_> {
    /// An abandoned conversion still waits before freeing its buffers.
    fn drop(&mut self) {
        if let Some(fence) = self.fence.take() {
            if let Err(e) = self.ctx.wait(fence) {
                tracing::error!("abandoned upload did not finish: {e}");
                return;
            }
        }
        self.release_staging();
        for image in self.images.drain(..) {
            let _ = self.ctx.device().destroy_buffer(image.buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blit::TexelFormat;
    use crate::config::Config;
    use crate::video::HostDevice;

    #[test]
    fn test_upload_round_trips_texels() {
        let ctx = Context::new(Arc::new(HostDevice::new()), Config::default());
        let texels: Vec<[f32; 4]> = (0..6).map(|i| [i as f32, 0.5, 0.25, 1.0]).collect();
        let image = Arc::new(Image::from_linear(Extent3::d2(3, 2), TexelFormat::Rgba32Float, &texels).unwrap());

        let pending = GpuObjectConverter::new(&ctx).begin(&[image.clone(), image]).unwrap();
        assert_eq!(pending.len(), 2);
        let uploaded = pending.wait().unwrap();
        assert_eq!(uploaded[0].extent, Extent3::d2(3, 2));

        let bytes = ctx.device().read_buffer(uploaded[1].range()).unwrap();
        let back: Vec<[f32; 4]> = bytemuck::pod_collect_to_vec(&bytes);
        assert_eq!(back, texels);
    }

    #[test]
    fn test_empty_upload() {
        let ctx = Context::new(Arc::new(HostDevice::new()), Config::default());
        let pending = GpuObjectConverter::new(&ctx).begin(&[]).unwrap();
        assert!(pending.is_empty());
        assert!(pending.wait().unwrap().is_empty());
    }
}

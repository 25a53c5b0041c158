//! The device collaborator and the context bundle passed to every component.

use std::sync::Arc;
use std::time::Duration;

use crate::accel::{AccelerationStructureCreateParams, BuildGeometryInfo, BuildSizes};
use crate::config::Config;
use crate::util::{Error, Result};

use super::command::CommandList;
use super::shader::ComputePipelineDesc;
use super::types::{
    AccelerationStructureHandle, BufferDesc, BufferHandle, BufferRange, BufferUsage, DeviceFeatures,
    DeviceLimits, FenceHandle, FenceStatus, PipelineHandle, QueueKind,
};

/// Properties of a live buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferInfo {
    pub label: String,
    pub size: u64,
    pub usage: BufferUsage,
}

/// Rendering abstraction implemented by each backend.
///
/// Every method takes `&self`; backends keep their object tables behind
/// locks so one device can be shared as `Arc<dyn Device>`.
pub trait Device: Send + Sync {
    fn name(&self) -> &str;
    fn limits(&self) -> DeviceLimits;
    fn features(&self) -> DeviceFeatures;

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle>;
    /// Create a buffer whose initial contents are `data` (zero padded).
    fn create_buffer_with_data(&self, desc: &BufferDesc, data: &[u8]) -> Result<BufferHandle>;
    fn destroy_buffer(&self, buffer: BufferHandle) -> Result<()>;
    fn buffer_info(&self, buffer: BufferHandle) -> Result<BufferInfo>;
    /// Device address of a `SHADER_DEVICE_ADDRESS` buffer.
    fn buffer_device_address(&self, buffer: BufferHandle) -> Result<u64>;

    /// Copy `data` into `range` through a staging buffer on `queue` and
    /// block until the copy completed.
    fn update_buffer_range_via_staging_buffer(
        &self,
        queue: QueueKind,
        range: BufferRange,
        data: &[u8],
    ) -> Result<()>;

    /// Blocking readback. The buffer needs `TRANSFER_SRC`.
    fn read_buffer(&self, range: BufferRange) -> Result<Vec<u8>>;

    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc) -> Result<PipelineHandle>;
    fn destroy_compute_pipeline(&self, pipeline: PipelineHandle) -> Result<()>;

    fn acceleration_structure_build_sizes(
        &self,
        info: &BuildGeometryInfo,
        max_primitive_counts: &[u32],
    ) -> Result<BuildSizes>;
    fn create_acceleration_structure(
        &self,
        params: &AccelerationStructureCreateParams,
    ) -> Result<AccelerationStructureHandle>;
    fn destroy_acceleration_structure(&self, structure: AccelerationStructureHandle) -> Result<()>;
    /// 64-bit value placed in instance records to reference `structure`.
    fn acceleration_structure_reference(&self, structure: AccelerationStructureHandle) -> Result<u64>;

    /// Validate and submit `list`. The returned fence signals when it completed.
    fn submit(&self, queue: QueueKind, list: CommandList) -> Result<FenceHandle>;
    fn fence_status(&self, fence: FenceHandle) -> Result<FenceStatus>;
    fn wait_for_fence(&self, fence: FenceHandle, timeout: Duration) -> Result<FenceStatus>;
}

/// Wait on `fence`, retrying timeouts up to `attempts` times.
pub fn block_on_fence(device: &dyn Device, fence: FenceHandle, timeout: Duration, attempts: u32) -> Result<()> {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match device.wait_for_fence(fence, timeout)? {
            FenceStatus::Signaled => return Ok(()),
            FenceStatus::Timeout => {
                tracing::warn!(?fence, attempt, attempts, timeout_ms = timeout.as_millis() as u64, "fence wait timed out");
            }
        }
    }
    Err(Error::DeviceHang { attempts, timeout_ms: timeout.as_millis() as u64 })
}

/// Which queue each kind of work goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSelection {
    pub graphics: QueueKind,
    pub compute: QueueKind,
    pub transfer: QueueKind,
}

impl Default for QueueSelection {
    fn default() -> Self {
        Self { graphics: QueueKind::Graphics, compute: QueueKind::Compute, transfer: QueueKind::Transfer }
    }
}

/// Device, queue selection and config traveling together.
#[derive(Clone)]
pub struct Context {
    device: Arc<dyn Device>,
    queues: QueueSelection,
    config: Config,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("device", &self.device.name())
            .field("queues", &self.queues)
            .finish_non_exhaustive()
    }
}

impl Context {
    pub fn new(device: Arc<dyn Device>, config: Config) -> Self {
        Self { device, queues: QueueSelection::default(), config }
    }

    pub fn with_queues(mut self, queues: QueueSelection) -> Self {
        self.queues = queues;
        self
    }

    #[inline]
    pub fn device(&self) -> &dyn Device {
        self.device.as_ref()
    }

    #[inline]
    pub fn device_arc(&self) -> Arc<dyn Device> {
        Arc::clone(&self.device)
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn queues(&self) -> QueueSelection {
        self.queues
    }

    /// Blocking fence wait with the configured timeout and attempt count.
    pub fn wait(&self, fence: FenceHandle) -> Result<()> {
        block_on_fence(
            self.device(),
            fence,
            self.config.fence_timeout(),
            self.config.device.fence_wait_attempts,
        )
    }

    pub fn submit_and_wait(&self, queue: QueueKind, list: CommandList) -> Result<()> {
        let fence = self.device.submit(queue, list)?;
        self.wait(fence)
    }
}

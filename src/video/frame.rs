//! Fixed ring of per-frame resources.

use crate::util::Result;

use super::device::Context;
use super::types::{FenceHandle, FenceStatus};

/// Default ring length.
pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 5;

struct Slot<T> {
    resources: T,
    fence: Option<FenceHandle>,
}

/// `N` slots of per-frame resources, each guarded by the fence of the last
/// frame that used it.
pub struct FramesInFlight<T> {
    slots: Vec<Slot<T>>,
    frame: u64,
    waits: u64,
}

impl<T> FramesInFlight<T> {
    /// One slot per element of `resources`.
    pub fn new(resources: Vec<T>) -> Self {
        Self {
            slots: resources.into_iter().map(|resources| Slot { resources, fence: None }).collect(),
            frame: 0,
            waits: 0,
        }
    }

    /// `count` slots built by `make(slot_index)`.
    pub fn with(count: usize, mut make: impl FnMut(usize) -> Result<T>) -> Result<Self> {
        let resources = (0..count.max(1)).map(&mut make).collect::<Result<Vec<_>>>()?;
        Ok(Self::new(resources))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Frames begun so far.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Slot the next [`Self::acquire`] returns.
    pub fn current_index(&self) -> usize {
        (self.frame % self.slots.len().max(1) as u64) as usize
    }

    /// Fence waits that actually blocked on an unretired slot.
    pub fn waits(&self) -> u64 {
        self.waits
    }

    /// Advance to the next slot, waiting only if the frame that last used it
    /// has not retired.
    pub fn acquire(&mut self, ctx: &Context) -> Result<(usize, &mut T)> {
        let index = self.current_index();
        if let Some(fence) = self.slots[index].fence.take() {
            if ctx.device().fence_status(fence)? != FenceStatus::Signaled {
                self.waits += 1;
                tracing::trace!(index, frame = self.frame, "waiting on in-flight slot");
                ctx.wait(fence)?;
            }
        }
        self.frame += 1;
        Ok((index, &mut self.slots[index].resources))
    }

    /// Record the fence of the frame just submitted from slot `index`.
    pub fn submitted(&mut self, index: usize, fence: FenceHandle) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.fence = Some(fence);
        }
    }

    pub fn resources(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().map(|s| &s.resources)
    }

    pub fn resources_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().map(|s| &mut s.resources)
    }

    /// Block until the last frame of every slot retired.
    pub fn wait_idle(&mut self, ctx: &Context) -> Result<()> {
        for slot in &mut self.slots {
            if let Some(fence) = slot.fence.take() {
                ctx.wait(fence)?;
            }
        }
        Ok(())
    }
}

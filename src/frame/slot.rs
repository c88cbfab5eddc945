// Frame slots - one set of per-frame objects per frame in flight

use ash::vk;
use parking_lot::{Mutex, MutexGuard};

use crate::gpu::SlotObjects;

/// Command-pool access token for one slot. Holding the guard is the only
/// way to reset, allocate from, record into or submit from the slot's pool.
pub struct SlotPool {
    objects: SlotObjects,
    /// The fence has been observed signaled since the last submission
    fence_waited: bool,
}

impl SlotPool {
    pub fn objects(&self) -> &SlotObjects {
        &self.objects
    }

    pub fn fence(&self) -> vk::Fence {
        self.objects.in_flight
    }

    pub fn fence_waited(&self) -> bool {
        self.fence_waited
    }

    pub(crate) fn mark_fence_waited(&mut self) {
        self.fence_waited = true;
    }

    pub(crate) fn mark_submitted(&mut self) {
        self.fence_waited = false;
    }
}

pub struct FrameSlot {
    index: usize,
    pool: Mutex<SlotPool>,
}

impl FrameSlot {
    pub fn new(index: usize, objects: SlotObjects) -> Self {
        Self {
            index,
            pool: Mutex::new(SlotPool {
                objects,
                // Fences start signaled, nothing has been submitted yet
                fence_waited: true,
            }),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Take exclusive access to this slot's command pool
    pub fn lock(&self) -> MutexGuard<'_, SlotPool> {
        self.pool.lock()
    }

    pub(crate) fn objects(&self) -> SlotObjects {
        self.pool.lock().objects
    }
}

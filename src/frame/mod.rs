// =============================================================================
// FRAME CORE - command recording, submission and synchronization
// =============================================================================
//
// Owns N frame slots (command pool + buffer, two semaphores, one fence) and
// the per-swapchain-image ownership table. Every frame:
//
// ┌──────────────────────────────────────────────────────────────────────────┐
// │ advance slot ─> wait slot fence ─> acquire image ─> wait image owner     │
// │   ─> update uniforms ─> reset pool + record ─> reset fence + submit      │
// │   ─> present                                                             │
// └──────────────────────────────────────────────────────────────────────────┘
//
// The command buffer is re-recorded every frame from the current registry
// contents. A slot's pool is only touched while holding that slot's lock,
// and only after its fence was observed signaled.
//
// =============================================================================

mod slot;
mod update;

#[cfg(test)]
mod tests;

use anyhow::Result;
use ash::vk;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::EngineError;
use crate::gpu::{AcquireOutcome, CommandRecorder, GpuBackend, PresentOutcome};
use crate::model::{DrawItem, ModelRegistry};

pub use slot::{FrameSlot, SlotPool};
pub use update::FrameUpdate;

/// What happened to one call of `FrameCore::draw_frame`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Image presented; the swapchain may still want rebuilding
    Presented {
        image_index: u32,
        draws: usize,
        suboptimal: bool,
    },
    /// Swapchain out of date; nothing was presented
    Stale,
    /// Window has no drawable area; nothing was recorded
    Skipped,
}

impl FrameOutcome {
    pub fn needs_recreate(&self) -> bool {
        match self {
            Self::Presented { suboptimal, .. } => *suboptimal,
            Self::Stale => true,
            Self::Skipped => false,
        }
    }

    pub fn presented(&self) -> bool {
        matches!(self, Self::Presented { .. })
    }
}

pub struct FrameCore<B: GpuBackend> {
    backend: Arc<B>,
    slots: Vec<FrameSlot>,
    /// Slot handed out next. Also advanced by single-time submissions,
    /// which may run on the loader thread.
    next_slot: Mutex<usize>,
    /// Slot of the frame that last rendered into each swapchain image.
    /// The owner's fence is only waited with that slot locked.
    images_in_flight: Mutex<Vec<Option<usize>>>,
    frame_number: AtomicU64,
}

impl<B: GpuBackend> FrameCore<B> {
    /// Create all frame slots. `frames_in_flight` must be at least 1.
    pub fn new(backend: Arc<B>, frames_in_flight: usize) -> Result<Self> {
        if frames_in_flight == 0 {
            anyhow::bail!("frames_in_flight must be at least 1");
        }

        let mut slots = Vec::with_capacity(frames_in_flight);
        for index in 0..frames_in_flight {
            match backend.create_slot() {
                Ok(objects) => slots.push(FrameSlot::new(index, objects)),
                Err(e) => {
                    for slot in &slots {
                        backend.destroy_slot(&slot.objects());
                    }
                    return Err(e.context(format!("Failed to create frame slot {}", index)));
                }
            }
        }

        let image_count = backend.swapchain_info().image_count;
        log::info!(
            "Frame core: {} frames in flight, {} swapchain images",
            frames_in_flight,
            image_count
        );

        Ok(Self {
            backend,
            slots,
            next_slot: Mutex::new(0),
            images_in_flight: Mutex::new(vec![None; image_count]),
            frame_number: AtomicU64::new(0),
        })
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> &FrameSlot {
        &self.slots[index]
    }

    /// Lock a slot's command pool directly
    pub fn lock_slot(&self, index: usize) -> MutexGuard<'_, SlotPool> {
        self.slots[index].lock()
    }

    /// Hand out the next slot index, round robin
    pub fn advance_slot(&self) -> usize {
        let mut next = self.next_slot.lock();
        let slot = *next;
        *next = (slot + 1) % self.slots.len();
        slot
    }

    /// Owner slot recorded for each swapchain image
    pub fn image_owners(&self) -> Vec<Option<usize>> {
        self.images_in_flight.lock().clone()
    }

    /// Forget image ownership after the swapchain was rebuilt
    pub fn on_swapchain_recreated(&self, image_count: usize) {
        let mut images = self.images_in_flight.lock();
        images.clear();
        images.resize(image_count, None);
    }

    // =========================================================================
    // DRAW / PRESENT
    // =========================================================================

    /// Record, submit and present one frame.
    ///
    /// `update` runs once the target image is known and exclusively owned;
    /// the uniform data it stages is copied into that image's regions.
    pub fn draw_frame<F>(&self, registry: &ModelRegistry, mut update: F) -> Result<FrameOutcome>
    where
        F: FnMut(&mut FrameUpdate),
    {
        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Pick the slot and take its pool
        // ─────────────────────────────────────────────────────────────────────
        let slot_index = self.advance_slot();
        let mut pool = self.slots[slot_index].lock();
        let objects = *pool.objects();

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Wait for the previous submission from this slot
        // ─────────────────────────────────────────────────────────────────────
        self.backend.wait_for_fence(objects.in_flight)?;
        pool.mark_fence_waited();

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Acquire the next swapchain image
        // ─────────────────────────────────────────────────────────────────────
        // The fence is still signaled here, so bailing out is safe.
        let (image_index, acquire_suboptimal) =
            match self.backend.acquire_next_image(objects.image_available)? {
                AcquireOutcome::Acquired {
                    image_index,
                    suboptimal,
                } => (image_index, suboptimal),
                AcquireOutcome::OutOfDate => {
                    log::debug!("Acquire reported out-of-date swapchain, skipping frame");
                    return Ok(FrameOutcome::Stale);
                }
            };

        // ─────────────────────────────────────────────────────────────────────
        // STEP 4: Wait for whichever frame still renders into this image
        // ─────────────────────────────────────────────────────────────────────
        self.claim_image(image_index, slot_index)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 5: User update + uniform copies
        // ─────────────────────────────────────────────────────────────────────
        let frame_number = self.frame_number.fetch_add(1, Ordering::Relaxed);
        let extent = self.backend.swapchain_info().extent;
        let mut frame_update = FrameUpdate::new(frame_number, image_index, extent);
        update(&mut frame_update);
        self.apply_uniforms(registry, image_index, frame_update)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 6: Reset the pool and re-record from the registry
        // ─────────────────────────────────────────────────────────────────────
        if !pool.fence_waited() {
            anyhow::bail!("slot {} pool reused before its fence was waited", slot_index);
        }
        self.backend.reset_command_pool(objects.command_pool)?;

        // The registry stays locked through submission: a model extracted for
        // deletion after this point can't be referenced by this submission.
        let models = registry.lock();
        if registry.take_dirty() {
            log::debug!("Draw list changed, {} models registered", models.len());
        }
        let buckets = models.draw_buckets(registry.graph());

        let cmd = objects.command_buffer;
        self.backend.begin_commands(cmd, true)?;
        let draws = {
            let mut recorder = self.backend.recorder(cmd);
            record_draws(recorder.as_mut(), &buckets, image_index)
        };
        self.backend.end_commands(cmd)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 7: Submit
        // ─────────────────────────────────────────────────────────────────────
        self.backend.reset_fence(objects.in_flight)?;
        self.backend.submit(
            cmd,
            Some(objects.image_available),
            Some(objects.render_finished),
            objects.in_flight,
        )?;
        pool.mark_submitted();
        drop(buckets);
        drop(models);
        drop(pool);

        // ─────────────────────────────────────────────────────────────────────
        // STEP 8: Present
        // ─────────────────────────────────────────────────────────────────────
        match self.backend.present(image_index, objects.render_finished)? {
            PresentOutcome::Presented => Ok(FrameOutcome::Presented {
                image_index,
                draws,
                suboptimal: acquire_suboptimal,
            }),
            PresentOutcome::Suboptimal => Ok(FrameOutcome::Presented {
                image_index,
                draws,
                suboptimal: true,
            }),
            PresentOutcome::OutOfDate => {
                log::debug!("Present reported out-of-date swapchain");
                Ok(FrameOutcome::Stale)
            }
        }
    }

    /// Mark `image_index` as owned by `slot_index`, waiting out a previous
    /// owner. The caller holds its own slot; the previous owner's slot is
    /// locked for the wait since a single-time submission on another thread
    /// may be resetting that fence.
    fn claim_image(&self, image_index: u32, slot_index: usize) -> Result<()> {
        let mut images = self.images_in_flight.lock();
        let index = image_index as usize;
        if index >= images.len() {
            images.resize(index + 1, None);
        }
        if let Some(previous) = images[index] {
            if previous != slot_index {
                let mut owner = self.slots[previous].lock();
                self.backend.wait_for_fence(owner.fence())?;
                owner.mark_fence_waited();
            }
        }
        images[index] = Some(slot_index);
        Ok(())
    }

    fn apply_uniforms(
        &self,
        registry: &ModelRegistry,
        image_index: u32,
        update: FrameUpdate,
    ) -> Result<()> {
        if let Some(global) = update.global {
            if let Err(e) = self.backend.write_global_uniform(image_index as usize, &global) {
                match e.downcast_ref::<EngineError>() {
                    Some(contract) => log::warn!("Global uniform not written: {}", contract),
                    None => return Err(e),
                }
            }
        }

        if update.models.is_empty() {
            return Ok(());
        }

        let mut models = registry.lock();
        for (handle, data) in update.models {
            let Some(model) = models.get_mut(handle) else {
                log::warn!("Uniform update for unknown model {}", handle);
                continue;
            };
            let Some(uniforms) = model.resources_mut().and_then(|r| r.uniforms.as_mut()) else {
                continue;
            };
            if let Err(e) = uniforms.write(image_index as usize, &data) {
                log::warn!("Uniform update for model {} dropped: {}", handle, e);
            }
        }
        Ok(())
    }

    // =========================================================================
    // SINGLE-TIME COMMANDS
    // =========================================================================

    /// Record and run a one-off command buffer, blocking until the GPU has
    /// finished it. Borrows the next frame slot's pool and fence.
    pub fn submit_single_time<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer) -> Result<()>,
    {
        let slot_index = self.advance_slot();
        let mut pool = self.slots[slot_index].lock();
        let objects = *pool.objects();

        self.backend.wait_for_fence(objects.in_flight)?;
        pool.mark_fence_waited();

        let cmd = self.backend.allocate_command_buffer(objects.command_pool)?;
        let result = (|| {
            self.backend.begin_commands(cmd, true)?;
            record(cmd)?;
            self.backend.end_commands(cmd)?;

            self.backend.reset_fence(objects.in_flight)?;
            self.backend.submit(cmd, None, None, objects.in_flight)?;
            pool.mark_submitted();

            self.backend.wait_for_fence(objects.in_flight)?;
            pool.mark_fence_waited();
            Ok(())
        })();
        self.backend.free_command_buffer(objects.command_pool, cmd);
        result
    }
}

impl<B: GpuBackend> Drop for FrameCore<B> {
    fn drop(&mut self) {
        if let Err(e) = self.backend.wait_idle() {
            log::error!("wait_idle before destroying frame slots failed: {:#}", e);
        }
        for slot in &self.slots {
            self.backend.destroy_slot(&slot.objects());
        }
    }
}

/// Walk passes -> subpasses -> models and emit the draw commands.
/// Returns the number of draw calls.
pub fn record_draws(
    recorder: &mut dyn CommandRecorder,
    buckets: &[Vec<Vec<DrawItem<'_>>>],
    image_index: u32,
) -> usize {
    let mut draws = 0;
    for (pass, subpasses) in buckets.iter().enumerate() {
        recorder.begin_render_pass(pass, image_index);
        for (subpass, items) in subpasses.iter().enumerate() {
            if subpass > 0 {
                recorder.next_subpass();
            }
            for item in items {
                let res = item.resources;
                recorder.bind_pipeline(res.pipeline);
                if !res.vertex_buffers.is_empty() {
                    recorder.bind_vertex_buffers(&res.vertex_buffers);
                }
                if let Some(&set) = res.descriptor_sets.get(image_index as usize) {
                    recorder.bind_descriptor_set(res.pipeline_layout, set);
                }
                match res.index_buffer {
                    Some(index_buffer) => {
                        recorder.bind_index_buffer(index_buffer);
                        recorder.draw_indexed(res.element_count, item.instances);
                    }
                    None => recorder.draw(res.element_count, item.instances),
                }
                draws += 1;
            }
        }
        recorder.end_render_pass();
    }
    draws
}

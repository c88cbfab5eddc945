// =============================================================================
// RENDERER - frame driver and public model API
// =============================================================================
//
// Ties the frame core, model registry and background loader together:
//
// ┌─────────────────────────────────────────────────────────────────┐
// │  Renderer                                                       │
// │    ├── FrameCore     (slots, image ownership, record/submit)    │
// │    ├── ModelRegistry (handles -> models, draw buckets)          │
// │    └── Loader thread (construct / delete tasks)                 │
// └─────────────────────────────────────────────────────────────────┘
//
// All methods run on the main thread. Swapchain recreation holds the
// topology lock for writing, so no model is being built against a render
// pass that is about to disappear.
//
// =============================================================================

use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::EngineError;
use crate::frame::{FrameCore, FrameOutcome, FrameUpdate};
use crate::gpu::GpuBackend;
use crate::graph::RenderGraph;
use crate::loader::{BackgroundLoader, Task, TaskKind};
use crate::model::{ModelBuilder, ModelHandle, ModelInfo, ModelRegistry, ModelStatus};

/// Frames-per-second over the last full second
#[derive(Debug, Clone, Copy)]
pub struct FrameStats {
    pub fps: f32,
    pub frame_time_ms: f32,
}

struct FpsCounter {
    frames: u32,
    window_start: Instant,
    last_frame: Instant,
}

impl FpsCounter {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            frames: 0,
            window_start: now,
            last_frame: now,
        }
    }

    /// Count one presented frame. Yields stats once per second.
    fn tick(&mut self) -> Option<FrameStats> {
        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame).as_secs_f32();
        self.last_frame = now;
        self.frames += 1;

        let elapsed = now.duration_since(self.window_start).as_secs_f32();
        if elapsed < 1.0 {
            return None;
        }
        let stats = FrameStats {
            fps: self.frames as f32 / elapsed,
            frame_time_ms: frame_time * 1000.0,
        };
        self.frames = 0;
        self.window_start = now;
        Some(stats)
    }
}

pub struct Renderer<B: GpuBackend> {
    // Drop order: loader first (joins the worker), core last
    loader: BackgroundLoader,
    registry: Arc<ModelRegistry>,
    builder: Arc<dyn ModelBuilder>,
    core: Arc<FrameCore<B>>,
    backend: Arc<B>,
    topology: Arc<RwLock<()>>,

    needs_recreate: bool,
    minimized: bool,
    shut_down: bool,

    fps: FpsCounter,
    last_stats: Option<FrameStats>,
}

impl<B: GpuBackend> Renderer<B> {
    /// Build the frame core, hand it to `make_builder` (model uploads use
    /// single-time submissions) and start the loader thread.
    pub fn new<F>(
        backend: Arc<B>,
        graph: Arc<RenderGraph>,
        config: &Config,
        make_builder: F,
    ) -> Result<Self>
    where
        F: FnOnce(&Arc<FrameCore<B>>) -> Result<Arc<dyn ModelBuilder>>,
    {
        let core = Arc::new(FrameCore::new(backend.clone(), config.frames_in_flight())?);
        let builder = make_builder(&core).context("Failed to create model builder")?;
        let registry = Arc::new(ModelRegistry::new(graph));
        let topology = Arc::new(RwLock::new(()));

        let mut loader = BackgroundLoader::new(
            registry.clone(),
            builder.clone(),
            backend.clone(),
            topology.clone(),
            config.loader.clone(),
        );
        loader.start()?;

        log::info!(
            "Renderer ready: {} passes, {} frames in flight",
            registry.graph().pass_count(),
            core.frames_in_flight()
        );

        Ok(Self {
            loader,
            registry,
            builder,
            core,
            backend,
            topology,
            needs_recreate: false,
            minimized: false,
            shut_down: false,
            fps: FpsCounter::new(),
            last_stats: None,
        })
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn core(&self) -> &Arc<FrameCore<B>> {
        &self.core
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn loader(&self) -> &BackgroundLoader {
        &self.loader
    }

    pub fn is_minimized(&self) -> bool {
        self.minimized
    }

    /// Stats from the last completed one-second window
    pub fn stats(&self) -> Option<FrameStats> {
        self.last_stats
    }

    // =========================================================================
    // MODEL API
    // =========================================================================

    /// Register a model and queue its construction. It is drawn once the
    /// loader has built it.
    pub fn new_model(&self, info: ModelInfo) -> Result<ModelHandle, EngineError> {
        if !self.loader.is_running() {
            return Err(EngineError::LoaderStopped);
        }
        let handle = self.registry.insert(info)?;
        let task = Task {
            handle,
            kind: TaskKind::Construct,
        };
        if let Err(e) = self.loader.enqueue(task) {
            self.registry.lock().remove(handle);
            return Err(e);
        }
        Ok(handle)
    }

    /// Stop drawing a model and queue its teardown
    pub fn delete_model(&self, handle: ModelHandle) -> Result<(), EngineError> {
        self.registry.request_delete(handle)?;
        self.loader.enqueue(Task {
            handle,
            kind: TaskKind::Delete,
        })
    }

    pub fn get_model(&self, handle: ModelHandle) -> Option<ModelStatus> {
        self.registry.status(handle)
    }

    /// Change how many instances of a model are drawn. Zero hides it.
    pub fn set_instances(&self, handle: ModelHandle, instances: u32) -> Result<bool, EngineError> {
        self.registry.set_instances(handle, instances)
    }

    /// Block until every queued construct/delete has been processed
    pub fn wait_for_loader(&self, timeout: Duration) -> bool {
        self.loader.wait_until_drained(timeout)
    }

    // =========================================================================
    // FRAME
    // =========================================================================

    /// The window was resized; rebuild the swapchain before the next frame
    pub fn request_recreate(&mut self) {
        self.needs_recreate = true;
    }

    /// Draw one frame at the given framebuffer size.
    ///
    /// A zero-sized framebuffer (minimised window) skips the frame without
    /// touching the GPU. A loader failure is returned as an error.
    pub fn draw_frame<F>(&mut self, width: u32, height: u32, update: F) -> Result<FrameOutcome>
    where
        F: FnMut(&mut FrameUpdate),
    {
        if let Some(e) = self.loader.take_fatal() {
            return Err(e.context("Background loader stopped"));
        }

        // ─────────────────────────────────────────────────────────────────────
        // Minimised: nothing to draw into
        // ─────────────────────────────────────────────────────────────────────
        if width == 0 || height == 0 {
            if !self.minimized {
                log::debug!("Framebuffer is zero-sized, pausing rendering");
            }
            self.minimized = true;
            return Ok(FrameOutcome::Skipped);
        }
        if self.minimized {
            self.minimized = false;
            self.needs_recreate = true;
        }

        let extent = self.backend.swapchain_info().extent;
        if self.needs_recreate || extent.width != width || extent.height != height {
            self.recreate_swapchain(width, height)?;
        }

        let outcome = self.core.draw_frame(&self.registry, update)?;
        if outcome.needs_recreate() {
            self.needs_recreate = true;
        }
        if outcome.presented() {
            if let Some(stats) = self.fps.tick() {
                self.last_stats = Some(stats);
            }
        }
        Ok(outcome)
    }

    /// Rebuild the swapchain and everything sized or formatted after it
    pub fn recreate_swapchain(&mut self, width: u32, height: u32) -> Result<()> {
        // Wait for any model construction to finish before touching passes
        let _topology = self.topology.write();
        self.backend
            .wait_idle()
            .context("Failed to drain GPU before swapchain recreation")?;

        let info = self.backend.recreate_swapchain(width, height)?;
        self.core.on_swapchain_recreated(info.image_count);

        let mut rebuilt = 0;
        {
            let mut models = self.registry.lock();
            for model in models.models_mut() {
                let info = model.info().clone();
                if let Some(resources) = model.resources_mut() {
                    self.builder
                        .recreate(&info, resources)
                        .with_context(|| format!("Failed to recreate model '{}'", info.name))?;
                    rebuilt += 1;
                }
            }
        }
        self.registry.mark_dirty();
        self.needs_recreate = false;

        log::info!(
            "Swapchain recreated: {}x{}, {} images, {} models rebuilt",
            info.extent.width,
            info.extent.height,
            info.image_count,
            rebuilt
        );
        Ok(())
    }

    // =========================================================================
    // SHUTDOWN
    // =========================================================================

    /// Stop the loader and destroy every remaining model
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        self.loader.shutdown();
        self.backend
            .wait_idle()
            .context("Failed to drain GPU before shutdown")?;

        let models = self.registry.drain();
        let count = models.len();
        for mut model in models {
            if let Some(resources) = model.take_resources() {
                self.builder.destroy(resources);
            }
        }
        log::info!("Renderer shut down, {} models destroyed", count);
        Ok(())
    }
}

impl<B: GpuBackend> Drop for Renderer<B> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Renderer shutdown failed: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PipelineVariant;
    use crate::model::ModelState;
    use crate::testing::{triangle_info, CountingBuilder, Event, HeadlessBackend};
    use std::collections::HashSet;

    const WAIT: Duration = Duration::from_secs(5);

    struct Fixture {
        backend: Arc<HeadlessBackend>,
        builder: Arc<CountingBuilder>,
        renderer: Renderer<HeadlessBackend>,
    }

    fn fixture(variant: PipelineVariant) -> Fixture {
        let backend = Arc::new(HeadlessBackend::new(3));
        let builder = Arc::new(CountingBuilder::default());
        let graph = Arc::new(RenderGraph::for_variant(variant));
        let shared = builder.clone();
        let renderer = Renderer::new(backend.clone(), graph, &Config::default(), move |_| {
            Ok(shared as Arc<dyn ModelBuilder>)
        })
        .unwrap();
        Fixture {
            backend,
            builder,
            renderer,
        }
    }

    fn draws(outcome: FrameOutcome) -> usize {
        match outcome {
            FrameOutcome::Presented { draws, .. } => draws,
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_new_model_then_draw() {
        let mut f = fixture(PipelineVariant::Forward);
        let handle = f.renderer.new_model(triangle_info(0, 0)).unwrap();
        assert!(f.renderer.wait_for_loader(WAIT));

        assert_eq!(f.renderer.get_model(handle).unwrap().state, ModelState::Ready);
        assert_eq!(draws(f.renderer.draw_frame(800, 600, |_| {}).unwrap()), 1);
    }

    #[test]
    fn test_invalid_placement_rejected() {
        let f = fixture(PipelineVariant::Forward);
        let err = f.renderer.new_model(triangle_info(9, 0)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidPlacement { .. }));
        assert!(f.renderer.registry().is_empty());
    }

    #[test]
    fn test_deleted_model_not_drawn_after_delete_returns() {
        let mut f = fixture(PipelineVariant::Deferred);
        let a = f.renderer.new_model(triangle_info(0, 0)).unwrap();
        let b = f.renderer.new_model(triangle_info(0, 2)).unwrap();
        assert!(f.renderer.wait_for_loader(WAIT));

        let mut drawn = 0;
        for i in 0..20 {
            if i == 5 {
                f.renderer.delete_model(b).unwrap();
            }
            let count = draws(f.renderer.draw_frame(800, 600, |_| {}).unwrap());
            if i >= 5 {
                assert_eq!(count, 1);
            }
            drawn += count;
        }
        assert_eq!(drawn, 5 * 2 + 15);

        assert!(f.renderer.wait_for_loader(WAIT));
        assert!(f.renderer.get_model(b).is_none());
        assert!(f.renderer.get_model(a).is_some());
        assert_eq!(f.builder.destroyed(), 1);
        assert!(f.backend.violations().is_empty());
    }

    #[test]
    fn test_double_delete_reported() {
        let f = fixture(PipelineVariant::Forward);
        let handle = f.renderer.new_model(triangle_info(0, 0)).unwrap();
        f.renderer.delete_model(handle).unwrap();
        assert_eq!(
            f.renderer.delete_model(handle),
            Err(EngineError::DeletePending(handle))
        );
        assert!(f.renderer.wait_for_loader(WAIT));
        assert_eq!(
            f.renderer.delete_model(handle),
            Err(EngineError::UnknownModel(handle))
        );
    }

    #[test]
    fn test_stale_frame_recovers() {
        let mut f = fixture(PipelineVariant::Forward);
        f.renderer.new_model(triangle_info(0, 0)).unwrap();
        assert!(f.renderer.wait_for_loader(WAIT));
        f.backend.fail_acquire(5);

        let mut presented = 0;
        for _ in 0..10 {
            if f.renderer.draw_frame(800, 600, |_| {}).unwrap().presented() {
                presented += 1;
            }
        }
        assert_eq!(presented, 9);

        let recreations = f
            .backend
            .events()
            .iter()
            .filter(|e| matches!(e, Event::Recreate { .. }))
            .count();
        assert_eq!(recreations, 1);
        assert_eq!(f.builder.recreated(), 1);
        assert!(f.backend.violations().is_empty());
    }

    #[test]
    fn test_resize_recreates_swapchain() {
        let mut f = fixture(PipelineVariant::Forward);
        f.renderer.draw_frame(800, 600, |_| {}).unwrap();
        f.renderer.draw_frame(1024, 768, |_| {}).unwrap();
        assert!(f.backend.events().contains(&Event::Recreate {
            width: 1024,
            height: 768
        }));
        assert_eq!(f.backend.swapchain_info().extent.width, 1024);
    }

    #[test]
    fn test_minimized_skips_frames() {
        let mut f = fixture(PipelineVariant::Forward);
        assert_eq!(
            f.renderer.draw_frame(0, 600, |_| {}).unwrap(),
            FrameOutcome::Skipped
        );
        assert!(f.renderer.is_minimized());
        assert_eq!(f.backend.presented(), 0);

        assert!(f.renderer.draw_frame(800, 600, |_| {}).unwrap().presented());
        assert!(!f.renderer.is_minimized());
        assert!(f
            .backend
            .events()
            .iter()
            .any(|e| matches!(e, Event::Recreate { .. })));
    }

    #[test]
    fn test_loader_failure_surfaces_on_draw() {
        let mut f = fixture(PipelineVariant::Forward);
        f.builder.fail_next();
        f.renderer.new_model(triangle_info(0, 0)).unwrap();
        assert!(f.renderer.wait_for_loader(WAIT));

        // The worker may still be publishing the error
        let mut failed = false;
        for _ in 0..100 {
            if f.renderer.draw_frame(800, 600, |_| {}).is_err() {
                failed = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(failed);
        assert_eq!(
            f.renderer.new_model(triangle_info(0, 0)),
            Err(EngineError::LoaderStopped)
        );
    }

    #[test]
    fn test_handles_unique_while_live() {
        let f = fixture(PipelineVariant::Deferred);
        let mut live = HashSet::new();
        for round in 0..5 {
            for _ in 0..20 {
                let handle = f.renderer.new_model(triangle_info(0, 0)).unwrap();
                assert!(handle.is_valid());
                assert!(live.insert(handle));
            }
            let victims: Vec<_> = live.iter().copied().take(10 + round).collect();
            for handle in victims {
                f.renderer.delete_model(handle).unwrap();
                live.remove(&handle);
            }
        }
        assert!(f.renderer.wait_for_loader(WAIT));
        assert_eq!(f.renderer.registry().len(), live.len());
    }

    #[test]
    fn test_shutdown_destroys_remaining_models() {
        let mut f = fixture(PipelineVariant::Forward);
        for _ in 0..3 {
            f.renderer.new_model(triangle_info(0, 0)).unwrap();
        }
        assert!(f.renderer.wait_for_loader(WAIT));
        f.renderer.shutdown().unwrap();

        assert_eq!(f.builder.destroyed(), 3);
        assert!(f.renderer.registry().is_empty());
        assert!(!f.renderer.loader().is_running());
    }
}

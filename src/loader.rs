// =============================================================================
// BACKGROUND LOADER - model construction and teardown off the main thread
// =============================================================================
//
// One worker thread drains a FIFO of (handle, construct|delete) tasks.
//
// Construct: the model stays in the registry the whole time. It is claimed
// (Pending -> Constructing) under the registry lock, built without the lock,
// then its resources are attached and it flips to Ready under the lock.
//
// Delete: the model is moved out of the registry into the private staging
// map while both locks are held, so it is never reachable from both. The
// GPU is drained, then the model is destroyed with only the staging lock.
//
// Lock order: topology -> registry -> staging -> queue.
//
// =============================================================================

use anyhow::{Context, Result};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::{LoaderConfig, LoaderWakeup};
use crate::error::EngineError;
use crate::gpu::GpuBackend;
use crate::model::{Model, ModelBuilder, ModelHandle, ModelRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Construct,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Task {
    pub handle: ModelHandle,
    pub kind: TaskKind,
}

struct QueueState {
    tasks: VecDeque<Task>,
    /// A task has been popped and is being processed
    busy: bool,
}

struct LoaderShared {
    registry: Arc<ModelRegistry>,
    builder: Arc<dyn ModelBuilder>,
    gpu: Arc<dyn GpuBackend>,
    /// Read while building, written by swapchain recreation
    topology: Arc<RwLock<()>>,
    queue: Mutex<QueueState>,
    /// Signaled on enqueue and shutdown
    wake: Condvar,
    /// Signaled after every processed task
    drained: Condvar,
    staging: Mutex<HashMap<ModelHandle, Model>>,
    running: AtomicBool,
    fatal: Mutex<Option<anyhow::Error>>,
    constructed: AtomicUsize,
    deleted: AtomicUsize,
    config: LoaderConfig,
}

pub struct BackgroundLoader {
    shared: Arc<LoaderShared>,
    worker: Option<JoinHandle<()>>,
}

impl BackgroundLoader {
    /// Create a loader. No thread runs until `start`.
    pub fn new(
        registry: Arc<ModelRegistry>,
        builder: Arc<dyn ModelBuilder>,
        gpu: Arc<dyn GpuBackend>,
        topology: Arc<RwLock<()>>,
        config: LoaderConfig,
    ) -> Self {
        Self {
            shared: Arc::new(LoaderShared {
                registry,
                builder,
                gpu,
                topology,
                queue: Mutex::new(QueueState {
                    tasks: VecDeque::new(),
                    busy: false,
                }),
                wake: Condvar::new(),
                drained: Condvar::new(),
                staging: Mutex::new(HashMap::new()),
                running: AtomicBool::new(true),
                fatal: Mutex::new(None),
                constructed: AtomicUsize::new(0),
                deleted: AtomicUsize::new(0),
                config,
            }),
            worker: None,
        }
    }

    /// Spawn the worker thread
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let shared = self.shared.clone();
        let worker = std::thread::Builder::new()
            .name("model-loader".to_string())
            .spawn(move || shared.run())
            .context("Failed to spawn loader thread")?;
        log::info!(
            "Background loader started ({:?} wakeup)",
            self.shared.config.wakeup
        );
        self.worker = Some(worker);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Queue a task. Never blocks on the worker.
    pub fn enqueue(&self, task: Task) -> Result<(), EngineError> {
        if !self.is_running() {
            return Err(EngineError::LoaderStopped);
        }
        let mut queue = self.shared.queue.lock();
        queue.tasks.push_back(task);
        log::debug!("Queued {:?} for {} ({} pending)", task.kind, task.handle, queue.tasks.len());
        drop(queue);
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Tasks queued but not yet picked up
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().tasks.len()
    }

    pub fn constructed_count(&self) -> usize {
        self.shared.constructed.load(Ordering::Acquire)
    }

    pub fn deleted_count(&self) -> usize {
        self.shared.deleted.load(Ordering::Acquire)
    }

    /// Block until the queue is empty and no task is in progress
    pub fn wait_until_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut queue = self.shared.queue.lock();
        while !queue.tasks.is_empty() || queue.busy {
            if self.shared.drained.wait_until(&mut queue, deadline).timed_out() {
                return queue.tasks.is_empty() && !queue.busy;
            }
        }
        true
    }

    /// Process queued tasks on the calling thread until the queue is empty.
    /// For callers that run without a worker thread.
    pub fn run_pending(&self) -> Result<usize> {
        let mut processed = 0;
        while let Some(task) = self.shared.pop() {
            let result = self.shared.process(task);
            self.shared.finish_task();
            result?;
            processed += 1;
        }
        Ok(processed)
    }

    /// Error that stopped the worker, if any
    pub fn take_fatal(&self) -> Option<anyhow::Error> {
        self.shared.fatal.lock().take()
    }

    /// Handles currently held in the staging map
    pub fn staged_handles(&self) -> Vec<ModelHandle> {
        self.shared.staging.lock().keys().copied().collect()
    }

    /// No handle is reachable from both the registry and the staging map
    pub fn check_exclusive(&self) -> bool {
        let models = self.shared.registry.lock();
        let staging = self.shared.staging.lock();
        staging.keys().all(|&h| !models.contains(h))
    }

    /// Stop the worker and wait for it. Queued tasks are dropped.
    pub fn shutdown(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Loader thread panicked");
            }
        }
        let dropped = {
            let mut queue = self.shared.queue.lock();
            let dropped = queue.tasks.len();
            queue.tasks.clear();
            dropped
        };
        if dropped > 0 {
            log::warn!("Loader shut down with {} unprocessed tasks", dropped);
        }
    }
}

impl Drop for BackgroundLoader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl LoaderShared {
    fn run(&self) {
        while self.running.load(Ordering::Acquire) {
            let Some(task) = self.next_task() else {
                continue;
            };
            let result = self.process(task);
            self.finish_task();
            if let Err(e) = result {
                log::error!("Loader task {:?} for {} failed: {:#}", task.kind, task.handle, e);
                self.running.store(false, Ordering::Release);
                *self.fatal.lock() = Some(e);
            }
        }
        log::info!("Background loader stopped");
    }

    /// Pop a task, or wait (condvar or fixed sleep) and return None
    fn next_task(&self) -> Option<Task> {
        if let Some(task) = self.pop() {
            return Some(task);
        }
        let interval = self.config.poll_interval();
        match self.config.wakeup {
            LoaderWakeup::Condvar => {
                let mut queue = self.queue.lock();
                if queue.tasks.is_empty() && self.running.load(Ordering::Acquire) {
                    // Bounded so a missed shutdown notification can't hang us
                    self.wake.wait_for(&mut queue, interval);
                }
            }
            LoaderWakeup::Poll => std::thread::sleep(interval),
        }
        None
    }

    fn pop(&self) -> Option<Task> {
        let mut queue = self.queue.lock();
        let task = queue.tasks.pop_front()?;
        queue.busy = true;
        Some(task)
    }

    fn finish_task(&self) {
        let mut queue = self.queue.lock();
        queue.busy = false;
        drop(queue);
        self.drained.notify_all();
    }

    fn process(&self, task: Task) -> Result<()> {
        match task.kind {
            TaskKind::Construct => self.construct(task.handle),
            TaskKind::Delete => self.delete(task.handle),
        }
    }

    fn construct(&self, handle: ModelHandle) -> Result<()> {
        let Some(info) = self.registry.begin_construct(handle) else {
            log::debug!("Skipping construction of {}: deleted before it started", handle);
            return Ok(());
        };

        let started = Instant::now();
        let resources = {
            let _topology = self.topology.read();
            self.builder
                .construct(&info)
                .with_context(|| format!("Failed to construct model '{}' ({})", info.name, handle))?
        };

        match self.registry.finish_construct(handle, resources) {
            Ok(true) => {
                self.constructed.fetch_add(1, Ordering::AcqRel);
                log::info!(
                    "Model '{}' ({}) ready in {:.1}ms",
                    info.name,
                    handle,
                    started.elapsed().as_secs_f32() * 1000.0
                );
            }
            Ok(false) => {
                self.constructed.fetch_add(1, Ordering::AcqRel);
                log::debug!("Model {} constructed with a delete pending", handle);
            }
            Err(orphaned) => {
                log::warn!("Model {} vanished during construction", handle);
                self.builder.destroy(orphaned);
            }
        }
        Ok(())
    }

    fn delete(&self, handle: ModelHandle) -> Result<()> {
        {
            let mut models = self.registry.lock();
            let mut staging = self.staging.lock();
            let Some(model) = models.remove(handle) else {
                log::warn!("Delete for unknown model {}", handle);
                return Ok(());
            };
            staging.insert(handle, model);
        }

        // Submissions recorded before the extraction may still use the model
        self.gpu
            .wait_idle()
            .context("Failed to drain GPU before model teardown")?;

        let mut staging = self.staging.lock();
        if let Some(mut model) = staging.remove(&handle) {
            if let Some(resources) = model.take_resources() {
                self.builder.destroy(resources);
            }
            self.deleted.fetch_add(1, Ordering::AcqRel);
            log::info!("Model '{}' ({}) destroyed", model.info().name, handle);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{PipelineVariant, RenderGraph};
    use crate::model::ModelState;
    use crate::testing::{triangle_info, CountingBuilder, HeadlessBackend};

    struct Fixture {
        registry: Arc<ModelRegistry>,
        builder: Arc<CountingBuilder>,
        loader: BackgroundLoader,
    }

    fn fixture(config: LoaderConfig) -> Fixture {
        let graph = Arc::new(RenderGraph::for_variant(PipelineVariant::Deferred));
        let registry = Arc::new(ModelRegistry::new(graph));
        let builder = Arc::new(CountingBuilder::default());
        let backend = Arc::new(HeadlessBackend::new(3));
        let loader = BackgroundLoader::new(
            registry.clone(),
            builder.clone(),
            backend,
            Arc::new(RwLock::new(())),
            config,
        );
        Fixture {
            registry,
            builder,
            loader,
        }
    }

    fn construct(handle: ModelHandle) -> Task {
        Task {
            handle,
            kind: TaskKind::Construct,
        }
    }

    fn delete(handle: ModelHandle) -> Task {
        Task {
            handle,
            kind: TaskKind::Delete,
        }
    }

    #[test]
    fn test_construct_marks_ready() {
        let f = fixture(LoaderConfig::default());
        let handle = f.registry.insert(triangle_info(0, 0)).unwrap();
        f.loader.enqueue(construct(handle)).unwrap();

        assert_eq!(f.loader.run_pending().unwrap(), 1);
        let status = f.registry.status(handle).unwrap();
        assert!(status.ready);
        assert_eq!(status.state, ModelState::Ready);
        assert_eq!(f.builder.constructed(), 1);
        assert!(f.registry.is_dirty());
    }

    #[test]
    fn test_delete_moves_through_staging() {
        let f = fixture(LoaderConfig::default());
        let handle = f.registry.insert(triangle_info(0, 0)).unwrap();
        f.loader.enqueue(construct(handle)).unwrap();
        f.loader.run_pending().unwrap();

        f.registry.request_delete(handle).unwrap();
        f.loader.enqueue(delete(handle)).unwrap();
        f.loader.run_pending().unwrap();

        assert!(f.registry.status(handle).is_none());
        assert!(f.loader.staged_handles().is_empty());
        assert_eq!(f.builder.destroyed(), 1);
        assert_eq!(f.loader.deleted_count(), 1);
        assert!(f.loader.check_exclusive());
    }

    #[test]
    fn test_delete_while_construct_pending_never_goes_live() {
        let f = fixture(LoaderConfig::default());
        let handle = f.registry.insert(triangle_info(0, 0)).unwrap();
        f.loader.enqueue(construct(handle)).unwrap();
        f.registry.request_delete(handle).unwrap();
        f.loader.enqueue(delete(handle)).unwrap();

        f.loader.run_pending().unwrap();

        assert_eq!(f.builder.constructed(), 0);
        assert_eq!(f.builder.destroyed(), 0);
        assert!(f.registry.status(handle).is_none());
        assert_eq!(f.loader.deleted_count(), 1);
    }

    #[test]
    fn test_failed_construct_is_reported() {
        let f = fixture(LoaderConfig::default());
        f.builder.fail_next();
        let handle = f.registry.insert(triangle_info(0, 0)).unwrap();
        f.loader.enqueue(construct(handle)).unwrap();
        assert!(f.loader.run_pending().is_err());
    }

    #[test]
    fn test_worker_thread_drains_queue_condvar() {
        let mut f = fixture(LoaderConfig::default());
        f.loader.start().unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let h = f.registry.insert(triangle_info(0, 0)).unwrap();
                f.loader.enqueue(construct(h)).unwrap();
                h
            })
            .collect();

        assert!(f.loader.wait_until_drained(Duration::from_secs(5)));
        for h in handles {
            assert!(f.registry.status(h).unwrap().ready);
        }
        assert_eq!(f.loader.constructed_count(), 8);
        f.loader.shutdown();
        assert!(!f.loader.is_running());
    }

    #[test]
    fn test_worker_thread_drains_queue_polling() {
        let mut f = fixture(LoaderConfig {
            wakeup: LoaderWakeup::Poll,
            poll_interval_ms: 5,
        });
        f.loader.start().unwrap();
        let handle = f.registry.insert(triangle_info(0, 1)).unwrap();
        f.loader.enqueue(construct(handle)).unwrap();

        assert!(f.loader.wait_until_drained(Duration::from_secs(5)));
        assert!(f.registry.status(handle).unwrap().ready);
    }

    #[test]
    fn test_worker_parks_fatal_error_and_stops() {
        let mut f = fixture(LoaderConfig::default());
        f.builder.fail_next();
        f.loader.start().unwrap();
        let handle = f.registry.insert(triangle_info(0, 0)).unwrap();
        f.loader.enqueue(construct(handle)).unwrap();

        assert!(f.loader.wait_until_drained(Duration::from_secs(5)));
        let deadline = Instant::now() + Duration::from_secs(5);
        while f.loader.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(f.loader.take_fatal().is_some());
        assert_eq!(
            f.loader.enqueue(construct(handle)),
            Err(EngineError::LoaderStopped)
        );
    }

    #[test]
    fn test_registry_and_staging_stay_exclusive_under_churn() {
        let mut f = fixture(LoaderConfig::default());
        f.builder.set_delay(Duration::from_micros(200));
        f.loader.start().unwrap();

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let h = f.registry.insert(triangle_info(0, 0)).unwrap();
                f.loader.enqueue(construct(h)).unwrap();
                h
            })
            .collect();
        for &h in &handles {
            f.registry.request_delete(h).unwrap();
            f.loader.enqueue(delete(h)).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            assert!(f.loader.check_exclusive());
            if f.loader.pending() == 0 && f.loader.wait_until_drained(Duration::from_millis(1)) {
                break;
            }
        }
        assert!(f.loader.check_exclusive());
        assert!(f.registry.is_empty());
        assert_eq!(f.loader.deleted_count(), 32);
    }
}

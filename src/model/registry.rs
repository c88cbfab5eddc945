// Model registry
//
// Handle -> Model map behind one mutex. The frame core reads it once per
// frame to bucket draws; the loader mutates it when construction finishes or
// a model is extracted for deletion; the frame driver inserts new models and
// changes instance counts.
//
// Models live in a BTreeMap so draws within a (pass, subpass) bucket are
// always in ascending handle order.

use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{Model, ModelHandle, ModelInfo, ModelResources, ModelState};
use crate::error::EngineError;
use crate::graph::RenderGraph;

/// One recorded draw
pub struct DrawItem<'a> {
    pub handle: ModelHandle,
    pub resources: &'a ModelResources,
    pub instances: u32,
}

/// Copyable view of a model for callers outside the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelStatus {
    pub handle: ModelHandle,
    pub state: ModelState,
    pub ready: bool,
    pub fully_constructed: bool,
    pub instances: u32,
    pub pass: usize,
    pub subpass: usize,
}

impl From<&Model> for ModelStatus {
    fn from(model: &Model) -> Self {
        let (pass, subpass) = model.placement();
        Self {
            handle: model.handle(),
            state: model.state(),
            ready: model.is_ready(),
            fully_constructed: model.is_fully_constructed(),
            instances: model.instances(),
            pass,
            subpass,
        }
    }
}

/// Registry contents, only reachable through the registry lock
pub struct RegistryState {
    models: BTreeMap<ModelHandle, Model>,
    next_handle: u64,
}

impl RegistryState {
    pub fn get(&self, handle: ModelHandle) -> Option<&Model> {
        self.models.get(&handle)
    }

    pub fn get_mut(&mut self, handle: ModelHandle) -> Option<&mut Model> {
        self.models.get_mut(&handle)
    }

    pub fn contains(&self, handle: ModelHandle) -> bool {
        self.models.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn handles(&self) -> impl Iterator<Item = ModelHandle> + '_ {
        self.models.keys().copied()
    }

    /// Move a model out of the registry
    pub(crate) fn remove(&mut self, handle: ModelHandle) -> Option<Model> {
        self.models.remove(&handle)
    }

    pub(crate) fn models_mut(&mut self) -> impl Iterator<Item = &mut Model> + '_ {
        self.models.values_mut()
    }

    /// Ready, non-zero-instance models bucketed as [pass][subpass][model]
    pub fn draw_buckets<'a>(&'a self, graph: &RenderGraph) -> Vec<Vec<Vec<DrawItem<'a>>>> {
        let mut buckets: Vec<Vec<Vec<DrawItem<'a>>>> = graph
            .passes()
            .iter()
            .map(|p| p.subpasses.iter().map(|_| Vec::new()).collect())
            .collect();

        for model in self.models.values() {
            if !model.is_ready() || model.instances() == 0 {
                continue;
            }
            let Some(resources) = model.resources() else {
                continue;
            };
            let (pass, subpass) = model.placement();
            // Placement was validated on insert; the graph never changes
            if let Some(bucket) = buckets.get_mut(pass).and_then(|p| p.get_mut(subpass)) {
                bucket.push(DrawItem {
                    handle: model.handle(),
                    resources,
                    instances: model.instances(),
                });
            }
        }

        buckets
    }

    /// Next free non-zero handle. Monotonic, skipping anything still live
    /// once the counter wraps.
    fn allocate_handle(&mut self) -> Result<ModelHandle, EngineError> {
        if self.models.len() as u64 >= u64::MAX - 1 {
            return Err(EngineError::HandlesExhausted);
        }
        loop {
            let candidate = ModelHandle(self.next_handle);
            self.next_handle = self.next_handle.wrapping_add(1);
            if self.next_handle == 0 {
                self.next_handle = 1;
            }
            if candidate.is_valid() && !self.models.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
    }
}

pub struct ModelRegistry {
    graph: Arc<RenderGraph>,
    state: Mutex<RegistryState>,
    /// Set whenever the set of drawable models or their instance counts change
    dirty: AtomicBool,
}

impl ModelRegistry {
    pub fn new(graph: Arc<RenderGraph>) -> Self {
        Self {
            graph,
            state: Mutex::new(RegistryState {
                models: BTreeMap::new(),
                next_handle: 1,
            }),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn graph(&self) -> &Arc<RenderGraph> {
        &self.graph
    }

    /// Take the registry lock
    pub fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock()
    }

    /// Insert a not-yet-constructed model and return its handle
    pub fn insert(&self, info: ModelInfo) -> Result<ModelHandle, EngineError> {
        if let Err(e) = self.graph.validate(info.pass, info.subpass) {
            log::error!("Model '{}' rejected: {}", info.name, e);
            return Err(e);
        }

        let mut state = self.state.lock();
        let handle = state.allocate_handle()?;
        log::debug!("Model '{}' registered as {}", info.name, handle);
        state.models.insert(handle, Model::new(handle, info));
        Ok(handle)
    }

    /// Mark a model for deletion. It stops being drawn immediately.
    pub fn request_delete(&self, handle: ModelHandle) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let model = state
            .get_mut(handle)
            .ok_or(EngineError::UnknownModel(handle))?;
        match model.state() {
            ModelState::Deleting => Err(EngineError::DeletePending(handle)),
            previous => {
                model.set_state(ModelState::Deleting);
                if previous == ModelState::Ready {
                    self.mark_dirty();
                }
                Ok(())
            }
        }
    }

    /// Claim a pending model for construction. `None` if it was deleted
    /// (or is otherwise not pending) in the meantime.
    pub fn begin_construct(&self, handle: ModelHandle) -> Option<Arc<ModelInfo>> {
        let mut state = self.state.lock();
        let model = state.get_mut(handle)?;
        if model.state() != ModelState::Pending {
            return None;
        }
        model.set_state(ModelState::Constructing);
        Some(model.info().clone())
    }

    /// Hand freshly built resources to a model. Flips it to ready unless a
    /// delete arrived during construction. Returns the resources if the
    /// model is gone so the caller can destroy them.
    pub fn finish_construct(
        &self,
        handle: ModelHandle,
        resources: ModelResources,
    ) -> Result<bool, ModelResources> {
        let mut state = self.state.lock();
        let Some(model) = state.get_mut(handle) else {
            return Err(resources);
        };
        model.attach(resources);
        if model.state() == ModelState::Constructing {
            model.set_state(ModelState::Ready);
            self.mark_dirty();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Set the active instance count. Returns whether it changed.
    pub fn set_instances(&self, handle: ModelHandle, instances: u32) -> Result<bool, EngineError> {
        let mut state = self.state.lock();
        let model = state
            .get_mut(handle)
            .ok_or(EngineError::UnknownModel(handle))?;
        if model.instances() == instances {
            return Ok(false);
        }
        model.set_instances(instances);
        self.mark_dirty();
        Ok(true)
    }

    pub fn status(&self, handle: ModelHandle) -> Option<ModelStatus> {
        self.state.lock().get(handle).map(ModelStatus::from)
    }

    /// Run `f` on a model under the registry lock
    pub fn with_model<R>(&self, handle: ModelHandle, f: impl FnOnce(&Model) -> R) -> Option<R> {
        self.state.lock().get(handle).map(f)
    }

    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Read and clear the dirty flag
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    /// Remove every model, for shutdown
    pub(crate) fn drain(&self) -> Vec<Model> {
        let mut state = self.state.lock();
        let models = std::mem::take(&mut state.models);
        self.mark_dirty();
        models.into_values().collect()
    }
}

// Models - drawable units owned by the registry
//
// A model is created empty (`Pending`), filled with GPU objects by the
// background loader (`Constructing` -> `Ready`), and torn down after a
// delete request (`Deleting`). Only `Ready` models with a non-zero instance
// count are ever recorded into a command buffer.

pub mod registry;

use anyhow::Result;
use ash::vk;
use std::fmt;
use std::sync::Arc;

use crate::assets::LoadSource;
use crate::backend::objects::ModelObjects;
use crate::uniform::UniformBuffer;

pub use registry::{DrawItem, ModelRegistry, ModelStatus};

/// Opaque model handle. Zero is never handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelHandle(u64);

impl ModelHandle {
    pub const INVALID: Self = Self(0);

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Vertex attribute formats, tightly packed in declaration order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexLayout {
    pub attributes: Vec<vk::Format>,
}

impl VertexLayout {
    pub fn new(attributes: Vec<vk::Format>) -> Self {
        Self { attributes }
    }

    /// Byte offset of each attribute
    pub fn offsets(&self) -> Vec<u32> {
        let mut offset = 0;
        self.attributes
            .iter()
            .map(|&format| {
                let this = offset;
                offset += format_size(format);
                this
            })
            .collect()
    }

    pub fn stride(&self) -> u32 {
        self.attributes.iter().map(|&f| format_size(f)).sum()
    }
}

/// Size in bytes of the vertex formats models may use
pub fn format_size(format: vk::Format) -> u32 {
    match format {
        vk::Format::R32_SFLOAT | vk::Format::R32_UINT | vk::Format::R8G8B8A8_UNORM => 4,
        vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32_SFLOAT => 12,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        other => {
            log::warn!("unsized vertex format {:?}, assuming 16 bytes", other);
            16
        }
    }
}

/// Geometry: raw vertex bytes in `layout`, optional little-endian u32 indices.
/// An empty layout means no vertex input: three vertices are drawn and the
/// vertex shader derives positions from the vertex index.
#[derive(Debug, Clone)]
pub struct MeshSource {
    pub vertices: LoadSource,
    pub indices: Option<LoadSource>,
    pub layout: VertexLayout,
}

impl MeshSource {
    /// Buffer-less full-screen triangle for post-process style subpasses
    pub fn fullscreen_triangle() -> Self {
        Self {
            vertices: LoadSource::buffer(Vec::<u8>::new()),
            indices: None,
            layout: VertexLayout::new(Vec::new()),
        }
    }
}

/// Raw RGBA8 pixels
#[derive(Debug, Clone)]
pub struct TextureSource {
    pub source: LoadSource,
    pub width: u32,
    pub height: u32,
}

/// Everything needed to construct a model
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub name: String,
    pub pass: usize,
    pub subpass: usize,
    pub mesh: MeshSource,
    pub vertex_shader: LoadSource,
    pub fragment_shader: LoadSource,
    pub textures: Vec<TextureSource>,
    /// Bytes of the per-model uniform block, 0 for none
    pub uniform_size: usize,
    pub instances: u32,
}

/// GPU objects a model needs at draw time plus the ones it merely owns
#[derive(Default)]
pub struct ModelResources {
    pub pipeline: vk::Pipeline,
    pub pipeline_layout: vk::PipelineLayout,
    pub vertex_buffers: Vec<vk::Buffer>,
    pub index_buffer: Option<vk::Buffer>,
    /// Index count when indexed, vertex count otherwise
    pub element_count: u32,
    /// One per swapchain image
    pub descriptor_sets: Vec<vk::DescriptorSet>,
    pub uniforms: Option<UniformBuffer>,
    pub objects: ModelObjects,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    /// Inserted, construct task queued
    Pending,
    /// Loader is building GPU objects
    Constructing,
    /// Fully constructed and live in the registry
    Ready,
    /// Delete requested; never drawn again
    Deleting,
}

pub struct Model {
    handle: ModelHandle,
    info: Arc<ModelInfo>,
    state: ModelState,
    instances: u32,
    resources: Option<ModelResources>,
}

impl Model {
    pub(crate) fn new(handle: ModelHandle, info: ModelInfo) -> Self {
        let instances = info.instances;
        Self {
            handle,
            info: Arc::new(info),
            state: ModelState::Pending,
            instances,
            resources: None,
        }
    }

    pub fn handle(&self) -> ModelHandle {
        self.handle
    }

    pub fn info(&self) -> &Arc<ModelInfo> {
        &self.info
    }

    pub fn state(&self) -> ModelState {
        self.state
    }

    pub fn instances(&self) -> u32 {
        self.instances
    }

    pub fn placement(&self) -> (usize, usize) {
        (self.info.pass, self.info.subpass)
    }

    /// GPU objects exist
    pub fn is_fully_constructed(&self) -> bool {
        self.resources.is_some()
    }

    /// Constructed and live: safe to draw
    pub fn is_ready(&self) -> bool {
        self.state == ModelState::Ready && self.is_fully_constructed()
    }

    pub fn resources(&self) -> Option<&ModelResources> {
        self.resources.as_ref()
    }

    pub(crate) fn resources_mut(&mut self) -> Option<&mut ModelResources> {
        self.resources.as_mut()
    }

    pub(crate) fn set_state(&mut self, state: ModelState) {
        self.state = state;
    }

    pub(crate) fn set_instances(&mut self, instances: u32) {
        self.instances = instances;
    }

    pub(crate) fn attach(&mut self, resources: ModelResources) {
        self.resources = Some(resources);
    }

    pub(crate) fn take_resources(&mut self) -> Option<ModelResources> {
        self.resources.take()
    }
}

/// Builds and tears down a model's GPU objects. Only ever called on the
/// loader thread, except `recreate` which runs on the main thread during
/// swapchain recreation with the device idle.
pub trait ModelBuilder: Send + Sync + 'static {
    fn construct(&self, info: &ModelInfo) -> Result<ModelResources>;

    /// Rebuild everything that depends on the swapchain (pipeline,
    /// per-image uniforms and descriptor sets)
    fn recreate(&self, info: &ModelInfo, resources: &mut ModelResources) -> Result<()>;

    fn destroy(&self, resources: ModelResources);
}

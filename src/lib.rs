// =============================================================================
// VK FRAME CORE - frame synchronization and command submission for Vulkan
// =============================================================================
//
// ┌─────────────────────────────────────────────────────────────────┐
// │  Renderer (main thread)                                         │
// │    ├── FrameCore      slots, image ownership, record/submit     │
// │    ├── ModelRegistry  handles -> models, draw buckets           │
// │    └── Loader thread  construct / delete off the main thread    │
// │                                                                 │
// │  gpu::GpuBackend / model::ModelBuilder                          │
// │    └── backend::VulkanBackend / VulkanModelBuilder (ash)        │
// └─────────────────────────────────────────────────────────────────┘
//
// =============================================================================

pub mod assets;
pub mod backend;
pub mod config;
pub mod error;
pub mod frame;
pub mod gpu;
pub mod graph;
pub mod loader;
pub mod model;
pub mod renderer;
pub mod uniform;
pub mod window;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::EngineError;
pub use frame::{FrameCore, FrameOutcome, FrameUpdate};
pub use graph::{PipelineVariant, RenderGraph};
pub use model::{MeshSource, ModelHandle, ModelInfo, ModelState, TextureSource, VertexLayout};
pub use renderer::{FrameStats, Renderer};

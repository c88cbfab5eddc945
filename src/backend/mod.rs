// Backend module - Vulkan implementation of the GPU seam
//
// device + swapchain + render targets behind `VulkanBackend`, model GPU
// objects behind `VulkanModelBuilder`. Nothing outside this module touches
// ash directly except through `gpu::GpuBackend` and `model::ModelBuilder`.

pub mod buffer;
pub mod context;
pub mod device;
pub mod image;
pub mod model;
pub mod objects;
pub mod pipeline;
pub mod recorder;
pub mod render_pass;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use context::VulkanBackend;
pub use device::VulkanDevice;
pub use model::{ResourceLoader, SourceLoader, VulkanModelBuilder};
pub use swapchain::Swapchain;

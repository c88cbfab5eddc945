// GPU seam
//
// The frame core, registry and loader only talk to the GPU through these
// traits. `backend::VulkanBackend` is the real implementation; the test
// suite drives the same code with a headless backend.
//
// Handles are plain `ash::vk` handles so both sides share one vocabulary.

use anyhow::Result;
use ash::vk;

/// Per-slot GPU objects, created once at startup and reused round-robin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotObjects {
    pub command_pool: vk::CommandPool,
    /// Primary buffer for the frame, reset together with its pool
    pub command_buffer: vk::CommandBuffer,
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    /// Created signaled so the first wait returns immediately
    pub in_flight: vk::Fence,
}

/// Result of asking the swapchain for an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { image_index: u32, suboptimal: bool },
    /// Swapchain no longer matches the surface; nothing was signaled
    OutOfDate,
}

/// Result of presenting an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Presented but the swapchain should be rebuilt
    Suboptimal,
    OutOfDate,
}

/// What the swapchain currently looks like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainInfo {
    pub image_count: usize,
    pub extent: vk::Extent2D,
}

/// Draw-time command vocabulary used when walking the registry
pub trait CommandRecorder {
    fn begin_render_pass(&mut self, pass: usize, image_index: u32);
    fn next_subpass(&mut self);
    fn end_render_pass(&mut self);
    fn bind_pipeline(&mut self, pipeline: vk::Pipeline);
    fn bind_vertex_buffers(&mut self, buffers: &[vk::Buffer]);
    fn bind_index_buffer(&mut self, buffer: vk::Buffer);
    fn bind_descriptor_set(&mut self, layout: vk::PipelineLayout, set: vk::DescriptorSet);
    fn draw(&mut self, vertex_count: u32, instance_count: u32);
    fn draw_indexed(&mut self, index_count: u32, instance_count: u32);
}

/// Everything the frame core needs from a device + swapchain.
///
/// Implementations serialize `submit`, `present` and `wait_idle` on the one
/// hardware queue internally; callers may invoke them from any thread.
pub trait GpuBackend: Send + Sync + 'static {
    fn create_slot(&self) -> Result<SlotObjects>;
    fn destroy_slot(&self, slot: &SlotObjects);

    /// Block until the fence is signaled (no timeout)
    fn wait_for_fence(&self, fence: vk::Fence) -> Result<()>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()>;
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer>;
    fn free_command_buffer(&self, pool: vk::CommandPool, cmd: vk::CommandBuffer);
    fn begin_commands(&self, cmd: vk::CommandBuffer, one_time: bool) -> Result<()>;
    fn end_commands(&self, cmd: vk::CommandBuffer) -> Result<()>;

    /// Recorder writing into `cmd`. Must only be used between
    /// `begin_commands` and `end_commands`.
    fn recorder(&self, cmd: vk::CommandBuffer) -> Box<dyn CommandRecorder + '_>;

    /// Submit one command buffer to the graphics queue
    fn submit(
        &self,
        cmd: vk::CommandBuffer,
        wait: Option<vk::Semaphore>,
        signal: Option<vk::Semaphore>,
        fence: vk::Fence,
    ) -> Result<()>;

    fn acquire_next_image(&self, signal: vk::Semaphore) -> Result<AcquireOutcome>;
    fn present(&self, image_index: u32, wait: vk::Semaphore) -> Result<PresentOutcome>;

    fn swapchain_info(&self) -> SwapchainInfo;

    /// Rebuild swapchain and everything sized by it. Caller guarantees the
    /// device is idle.
    fn recreate_swapchain(&self, width: u32, height: u32) -> Result<SwapchainInfo>;

    /// Copy the frame-global uniform block into the region of one image
    fn write_global_uniform(&self, image_index: usize, data: &[u8]) -> Result<()>;

    fn wait_idle(&self) -> Result<()>;
}

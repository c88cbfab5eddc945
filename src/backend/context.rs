// =============================================================================
// VULKAN BACKEND - the GPU seam implemented on a real device + swapchain
// =============================================================================
//
// ┌──────────────────────────────────────────────────────────────────────┐
// │  VulkanBackend                                                       │
// │    ├── VulkanDevice   (instance, device, queue lock, allocator)       │
// │    └── PresentState   (RwLock)                                       │
// │          ├── Swapchain                                               │
// │          ├── RenderTargets (render passes, framebuffers, inputs)     │
// │          └── global uniform buffer, one region per image             │
// └──────────────────────────────────────────────────────────────────────┘
//
// Presentation state is read by every frame and by model construction; it
// is only written by swapchain recreation, which the caller runs with the
// device idle and model construction locked out.
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

use super::buffer::{create_uniform_buffer, destroy_uniform_buffer};
use super::recorder::VkRecorder;
use super::render_pass::{RenderTargets, SubpassTarget};
use super::swapchain::Swapchain;
use super::sync::{create_slot_objects, destroy_slot_objects};
use super::VulkanDevice;
use crate::gpu::{AcquireOutcome, CommandRecorder, GpuBackend, PresentOutcome, SlotObjects, SwapchainInfo};
use crate::graph::RenderGraph;
use crate::uniform::UniformBuffer;

pub struct PresentState {
    pub swapchain: Swapchain,
    pub targets: RenderTargets,
    pub globals: Mutex<UniformBuffer>,
}

/// Where models find the frame-global uniform block
#[derive(Debug, Clone, Copy)]
pub struct GlobalUniform {
    pub buffer: vk::Buffer,
    pub stride: u64,
    pub size: u64,
}

pub struct VulkanBackend {
    device: Arc<VulkanDevice>,
    graph: Arc<RenderGraph>,
    present_mode: vk::PresentModeKHR,
    clear_color: [f32; 4],
    global_uniform_size: usize,
    state: RwLock<PresentState>,
}

impl VulkanBackend {
    pub fn new(
        device: Arc<VulkanDevice>,
        graph: Arc<RenderGraph>,
        present_mode: vk::PresentModeKHR,
        clear_color: [f32; 4],
        global_uniform_size: usize,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let state = Self::build_state(
            &device,
            &graph,
            present_mode,
            clear_color,
            global_uniform_size,
            width,
            height,
            vk::SwapchainKHR::null(),
        )?;

        Ok(Self {
            device,
            graph,
            present_mode,
            clear_color,
            global_uniform_size,
            state: RwLock::new(state),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn build_state(
        device: &Arc<VulkanDevice>,
        graph: &RenderGraph,
        present_mode: vk::PresentModeKHR,
        clear_color: [f32; 4],
        global_uniform_size: usize,
        width: u32,
        height: u32,
        old: vk::SwapchainKHR,
    ) -> Result<PresentState> {
        let swapchain = Swapchain::new(device.clone(), present_mode, width, height, old)?;
        let mut targets = RenderTargets::new(device, graph, &swapchain, clear_color)?;
        let globals = match create_uniform_buffer(
            device,
            "global uniforms",
            global_uniform_size,
            swapchain.image_count(),
        ) {
            Ok(globals) => globals,
            Err(e) => {
                targets.destroy(device);
                return Err(e);
            }
        };

        Ok(PresentState {
            swapchain,
            targets,
            globals: Mutex::new(globals),
        })
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    pub fn graph(&self) -> &Arc<RenderGraph> {
        &self.graph
    }

    pub fn image_count(&self) -> usize {
        self.state.read().swapchain.image_count()
    }

    /// Render pass, subpass and input layout a model at (pass, subpass)
    /// must build its pipeline against
    pub fn subpass_target(&self, pass: usize, subpass: usize) -> Option<SubpassTarget> {
        self.state.read().targets.subpass_target(pass, subpass, &self.graph)
    }

    pub fn global_uniform(&self) -> GlobalUniform {
        let state = self.state.read();
        let globals = state.globals.lock();
        GlobalUniform {
            buffer: globals.buffer(),
            stride: globals.stride(),
            size: globals.block_size() as u64,
        }
    }
}

impl GpuBackend for VulkanBackend {
    fn create_slot(&self) -> Result<SlotObjects> {
        create_slot_objects(&self.device)
    }

    fn destroy_slot(&self, slot: &SlotObjects) {
        destroy_slot_objects(&self.device, slot);
    }

    fn wait_for_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.device.wait_for_fences(&[fence], true, u64::MAX) }
            .context("Failed to wait for fence")
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.device.reset_fences(&[fence]) }.context("Failed to reset fence")
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()> {
        unsafe {
            self.device
                .device
                .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())
        }
        .context("Failed to reset command pool")
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffer")?;
        buffers
            .into_iter()
            .next()
            .context("Driver returned no command buffer")
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, cmd: vk::CommandBuffer) {
        unsafe { self.device.device.free_command_buffers(pool, &[cmd]) };
    }

    fn begin_commands(&self, cmd: vk::CommandBuffer, one_time: bool) -> Result<()> {
        let flags = if one_time {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        } else {
            vk::CommandBufferUsageFlags::empty()
        };
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(flags);
        unsafe { self.device.device.begin_command_buffer(cmd, &begin_info) }
            .context("Failed to begin command buffer")
    }

    fn end_commands(&self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device.device.end_command_buffer(cmd) }.context("Failed to end command buffer")
    }

    fn recorder(&self, cmd: vk::CommandBuffer) -> Box<dyn CommandRecorder + '_> {
        Box::new(VkRecorder::new(&self.device, self.state.read(), cmd))
    }

    fn submit(
        &self,
        cmd: vk::CommandBuffer,
        wait: Option<vk::Semaphore>,
        signal: Option<vk::Semaphore>,
        fence: vk::Fence,
    ) -> Result<()> {
        let wait_semaphores: Vec<vk::Semaphore> = wait.into_iter().collect();
        let wait_stages = vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT; wait_semaphores.len()];
        let signal_semaphores: Vec<vk::Semaphore> = signal.into_iter().collect();
        let command_buffers = [cmd];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        self.device
            .with_queue(|queue| unsafe { self.device.device.queue_submit(queue, &[submit_info], fence) })
            .context("Failed to submit command buffer")
    }

    fn acquire_next_image(&self, signal: vk::Semaphore) -> Result<AcquireOutcome> {
        self.state.read().swapchain.acquire_next_image(signal)
    }

    fn present(&self, image_index: u32, wait: vk::Semaphore) -> Result<PresentOutcome> {
        let state = self.state.read();
        self.device
            .with_queue(|queue| state.swapchain.present(queue, image_index, wait))
    }

    fn swapchain_info(&self) -> SwapchainInfo {
        let state = self.state.read();
        SwapchainInfo {
            image_count: state.swapchain.image_count(),
            extent: state.swapchain.extent,
        }
    }

    fn recreate_swapchain(&self, width: u32, height: u32) -> Result<SwapchainInfo> {
        let mut state = self.state.write();

        // The new chain is built while the old one still exists (it is
        // retired through `old_swapchain`), then the old objects go.
        let fresh = Self::build_state(
            &self.device,
            &self.graph,
            self.present_mode,
            self.clear_color,
            self.global_uniform_size,
            width,
            height,
            state.swapchain.swapchain,
        )?;
        let mut old = std::mem::replace(&mut *state, fresh);
        old.targets.destroy(&self.device);
        destroy_uniform_buffer(&self.device, old.globals.into_inner());
        drop(old.swapchain);

        Ok(SwapchainInfo {
            image_count: state.swapchain.image_count(),
            extent: state.swapchain.extent,
        })
    }

    fn write_global_uniform(&self, image_index: usize, data: &[u8]) -> Result<()> {
        let state = self.state.read();
        let mut globals = state.globals.lock();
        globals.write(image_index, data)?;
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            log::error!("wait_idle before destroying the swapchain failed: {:#}", e);
        }
        let state = self.state.get_mut();
        state.targets.destroy(&self.device);
        let globals = std::mem::replace(state.globals.get_mut(), UniformBuffer::host(0, 1, 0));
        destroy_uniform_buffer(&self.device, globals);
        // Swapchain goes with the state
    }
}

// Command recorder writing straight into a Vulkan command buffer
//
// Holds a read guard on the presentation state for as long as it lives, so
// the render passes and framebuffers it references can't be rebuilt under it.

use ash::vk;
use parking_lot::RwLockReadGuard;

use super::context::PresentState;
use super::VulkanDevice;
use crate::gpu::CommandRecorder;

pub struct VkRecorder<'a> {
    device: &'a VulkanDevice,
    state: RwLockReadGuard<'a, PresentState>,
    cmd: vk::CommandBuffer,
    pass: usize,
    subpass: usize,
}

impl<'a> VkRecorder<'a> {
    pub(super) fn new(
        device: &'a VulkanDevice,
        state: RwLockReadGuard<'a, PresentState>,
        cmd: vk::CommandBuffer,
    ) -> Self {
        Self {
            device,
            state,
            cmd,
            pass: 0,
            subpass: 0,
        }
    }

    /// Input set of the subpass being recorded, if it reads attachments
    fn input_set(&self) -> Option<vk::DescriptorSet> {
        self.state
            .targets
            .passes
            .get(self.pass)?
            .inputs
            .get(self.subpass)?
            .as_ref()
            .map(|inputs| inputs.set)
    }
}

impl CommandRecorder for VkRecorder<'_> {
    fn begin_render_pass(&mut self, pass: usize, image_index: u32) {
        self.pass = pass;
        self.subpass = 0;

        let extent = self.state.targets.extent;
        let Some(targets) = self.state.targets.passes.get(pass) else {
            log::error!("render pass {} does not exist", pass);
            return;
        };
        let Some(&framebuffer) = targets.framebuffers.get(image_index as usize) else {
            log::error!("no framebuffer for image {} in pass {}", image_index, pass);
            return;
        };

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(targets.render_pass)
            .framebuffer(framebuffer)
            .render_area(render_area)
            .clear_values(&targets.clear_values);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        unsafe {
            self.device
                .device
                .cmd_begin_render_pass(self.cmd, &begin_info, vk::SubpassContents::INLINE);
            self.device.device.cmd_set_viewport(self.cmd, 0, &[viewport]);
            self.device.device.cmd_set_scissor(self.cmd, 0, &[render_area]);
        }
    }

    fn next_subpass(&mut self) {
        self.subpass += 1;
        unsafe {
            self.device
                .device
                .cmd_next_subpass(self.cmd, vk::SubpassContents::INLINE)
        };
    }

    fn end_render_pass(&mut self) {
        unsafe { self.device.device.cmd_end_render_pass(self.cmd) };
    }

    fn bind_pipeline(&mut self, pipeline: vk::Pipeline) {
        unsafe {
            self.device
                .device
                .cmd_bind_pipeline(self.cmd, vk::PipelineBindPoint::GRAPHICS, pipeline)
        };
    }

    fn bind_vertex_buffers(&mut self, buffers: &[vk::Buffer]) {
        let offsets = vec![0; buffers.len()];
        unsafe {
            self.device
                .device
                .cmd_bind_vertex_buffers(self.cmd, 0, buffers, &offsets)
        };
    }

    fn bind_index_buffer(&mut self, buffer: vk::Buffer) {
        unsafe {
            self.device
                .device
                .cmd_bind_index_buffer(self.cmd, buffer, 0, vk::IndexType::UINT32)
        };
    }

    fn bind_descriptor_set(&mut self, layout: vk::PipelineLayout, set: vk::DescriptorSet) {
        let mut sets = vec![set];
        if let Some(inputs) = self.input_set() {
            sets.push(inputs);
        }
        unsafe {
            self.device.device.cmd_bind_descriptor_sets(
                self.cmd,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                0,
                &sets,
                &[],
            )
        };
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32) {
        unsafe {
            self.device
                .device
                .cmd_draw(self.cmd, vertex_count, instance_count, 0, 0)
        };
    }

    fn draw_indexed(&mut self, index_count: u32, instance_count: u32) {
        unsafe {
            self.device
                .device
                .cmd_draw_indexed(self.cmd, index_count, instance_count, 0, 0, 0)
        };
    }
}

// Render targets - Vulkan objects derived from the render graph
//
// For every pass in the graph:
// - one VkRenderPass whose attachments are the pass' written attachments in
//   first-use order
// - one framebuffer per swapchain image
// - per subpass with inputs, a descriptor set (set 1 of model pipelines)
//   binding input attachments from this pass and sampled images from
//   earlier passes
//
// Intermediate attachments are created once, sized to the swapchain. The
// whole thing is rebuilt when the swapchain is.

use anyhow::{Context, Result};
use ash::vk;
use std::collections::HashMap;

use super::image::{create_sampler, GpuImage};
use super::swapchain::Swapchain;
use super::VulkanDevice;
use crate::graph::{AttachmentId, AttachmentKind, InputBinding, RenderGraph};

/// Descriptor set binding one subpass' inputs
pub struct SubpassInputs {
    pub layout: vk::DescriptorSetLayout,
    pub set: vk::DescriptorSet,
}

pub struct PassTargets {
    pub render_pass: vk::RenderPass,
    /// Indexed by swapchain image
    pub framebuffers: Vec<vk::Framebuffer>,
    pub clear_values: Vec<vk::ClearValue>,
    /// Indexed by subpass
    pub inputs: Vec<Option<SubpassInputs>>,
    pub color_counts: Vec<usize>,
}

/// What a pipeline for (pass, subpass) must be compatible with
#[derive(Debug, Clone, Copy)]
pub struct SubpassTarget {
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
    pub color_count: usize,
    pub has_depth: bool,
    pub input_layout: Option<vk::DescriptorSetLayout>,
}

pub struct RenderTargets {
    pub passes: Vec<PassTargets>,
    pub extent: vk::Extent2D,
    attachments: HashMap<AttachmentId, GpuImage>,
    input_pool: vk::DescriptorPool,
    input_sampler: vk::Sampler,
}

impl RenderTargets {
    pub fn new(
        device: &VulkanDevice,
        graph: &RenderGraph,
        swapchain: &Swapchain,
        clear_color: [f32; 4],
    ) -> Result<Self> {
        let mut targets = Self {
            passes: Vec::with_capacity(graph.pass_count()),
            extent: swapchain.extent,
            attachments: HashMap::new(),
            input_pool: vk::DescriptorPool::null(),
            input_sampler: vk::Sampler::null(),
        };
        if let Err(e) = targets.build(device, graph, swapchain, clear_color) {
            targets.destroy(device);
            return Err(e);
        }
        Ok(targets)
    }

    fn build(
        &mut self,
        device: &VulkanDevice,
        graph: &RenderGraph,
        swapchain: &Swapchain,
        clear_color: [f32; 4],
    ) -> Result<()> {
        // ─────────────────────────────────────────────────────────────────────
        // Intermediate attachments
        // ─────────────────────────────────────────────────────────────────────
        for (index, desc) in graph.attachments().iter().enumerate() {
            let id = AttachmentId(index);
            let image = match desc.kind {
                AttachmentKind::Swapchain => continue,
                AttachmentKind::Color(format) => GpuImage::new(
                    device,
                    desc.name,
                    swapchain.extent,
                    format,
                    vk::ImageUsageFlags::COLOR_ATTACHMENT
                        | vk::ImageUsageFlags::INPUT_ATTACHMENT
                        | vk::ImageUsageFlags::SAMPLED,
                    vk::ImageAspectFlags::COLOR,
                )?,
                AttachmentKind::Depth(format) => GpuImage::new(
                    device,
                    desc.name,
                    swapchain.extent,
                    format,
                    vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                    vk::ImageAspectFlags::DEPTH,
                )?,
            };
            self.attachments.insert(id, image);
        }

        self.input_sampler = create_sampler(device, false)?;
        self.input_pool = create_input_pool(device, graph)?;

        // ─────────────────────────────────────────────────────────────────────
        // Render passes, framebuffers, input sets
        // ─────────────────────────────────────────────────────────────────────
        for pass in 0..graph.pass_count() {
            let render_pass = create_render_pass(device, graph, pass, swapchain.format)?;
            // Pushed right away so `destroy` sees it if anything below fails
            self.passes.push(PassTargets {
                render_pass,
                framebuffers: Vec::new(),
                clear_values: Vec::new(),
                inputs: Vec::new(),
                color_counts: (0..graph.subpass_count(pass))
                    .map(|s| graph.color_count(pass, s))
                    .collect(),
            });

            let locals = graph.pass_attachments(pass);
            let clear_values = locals
                .iter()
                .map(|&id| match graph.attachment(id).kind {
                    AttachmentKind::Depth(_) => vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue {
                            depth: 1.0,
                            stencil: 0,
                        },
                    },
                    _ => vk::ClearValue {
                        color: vk::ClearColorValue {
                            float32: clear_color,
                        },
                    },
                })
                .collect();
            self.passes[pass].clear_values = clear_values;

            for (image_index, &swapchain_view) in swapchain.image_views.iter().enumerate() {
                let views: Vec<vk::ImageView> = locals
                    .iter()
                    .map(|id| match self.attachments.get(id) {
                        Some(image) => image.view,
                        None => swapchain_view,
                    })
                    .collect();
                let framebuffer_info = vk::FramebufferCreateInfo::builder()
                    .render_pass(render_pass)
                    .attachments(&views)
                    .width(swapchain.extent.width)
                    .height(swapchain.extent.height)
                    .layers(1);
                let framebuffer = unsafe { device.device.create_framebuffer(&framebuffer_info, None) }
                    .with_context(|| format!("Failed to create framebuffer {} of pass {}", image_index, pass))?;
                self.passes[pass].framebuffers.push(framebuffer);
            }

            for subpass in 0..graph.subpass_count(pass) {
                let inputs = self.create_subpass_inputs(device, graph, pass, subpass)?;
                self.passes[pass].inputs.push(inputs);
            }
        }

        log::info!(
            "Render targets: {} passes, {} intermediate attachments, {}x{}",
            self.passes.len(),
            self.attachments.len(),
            self.extent.width,
            self.extent.height
        );
        Ok(())
    }

    fn create_subpass_inputs(
        &self,
        device: &VulkanDevice,
        graph: &RenderGraph,
        pass: usize,
        subpass: usize,
    ) -> Result<Option<SubpassInputs>> {
        let bindings = graph.input_bindings(pass, subpass);
        if bindings.is_empty() {
            return Ok(None);
        }

        let layout_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .enumerate()
            .map(|(i, binding)| {
                let ty = match binding {
                    InputBinding::Attachment(_) => vk::DescriptorType::INPUT_ATTACHMENT,
                    InputBinding::Sampled(_) => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                };
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(i as u32)
                    .descriptor_type(ty)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                    .build()
            })
            .collect();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&layout_bindings);
        let layout = unsafe { device.device.create_descriptor_set_layout(&layout_info, None) }
            .context("Failed to create subpass input layout")?;

        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.input_pool)
            .set_layouts(&layouts);
        let set = unsafe { device.device.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate subpass input set")
            .and_then(|sets| {
                sets.into_iter()
                    .next()
                    .context("Driver returned no subpass input set")
            });
        let set = match set {
            Ok(set) => set,
            Err(e) => {
                unsafe { device.device.destroy_descriptor_set_layout(layout, None) };
                return Err(e);
            }
        };

        let image_infos: Vec<vk::DescriptorImageInfo> = bindings
            .iter()
            .map(|binding| match *binding {
                InputBinding::Attachment(id) => vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: self.attachment_view(id),
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                },
                InputBinding::Sampled(id) => vk::DescriptorImageInfo {
                    sampler: self.input_sampler,
                    image_view: self.attachment_view(id),
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                },
            })
            .collect();
        let writes: Vec<vk::WriteDescriptorSet> = bindings
            .iter()
            .enumerate()
            .map(|(i, binding)| {
                let ty = match binding {
                    InputBinding::Attachment(_) => vk::DescriptorType::INPUT_ATTACHMENT,
                    InputBinding::Sampled(_) => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                };
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(i as u32)
                    .descriptor_type(ty)
                    .image_info(std::slice::from_ref(&image_infos[i]))
                    .build()
            })
            .collect();
        unsafe { device.device.update_descriptor_sets(&writes, &[]) };

        Ok(Some(SubpassInputs { layout, set }))
    }

    fn attachment_view(&self, id: AttachmentId) -> vk::ImageView {
        self.attachments
            .get(&id)
            .map_or(vk::ImageView::null(), |image| image.view)
    }

    pub fn subpass_target(&self, pass: usize, subpass: usize, graph: &RenderGraph) -> Option<SubpassTarget> {
        let targets = self.passes.get(pass)?;
        let inputs = targets.inputs.get(subpass)?;
        Some(SubpassTarget {
            render_pass: targets.render_pass,
            subpass: subpass as u32,
            color_count: targets.color_counts[subpass],
            has_depth: graph.has_depth(pass, subpass),
            input_layout: inputs.as_ref().map(|i| i.layout),
        })
    }

    pub fn destroy(&mut self, device: &VulkanDevice) {
        unsafe {
            for pass in self.passes.drain(..) {
                for framebuffer in pass.framebuffers {
                    device.device.destroy_framebuffer(framebuffer, None);
                }
                for inputs in pass.inputs.into_iter().flatten() {
                    device.device.destroy_descriptor_set_layout(inputs.layout, None);
                }
                device.device.destroy_render_pass(pass.render_pass, None);
            }
            // Frees every input set
            device.device.destroy_descriptor_pool(self.input_pool, None);
            device.device.destroy_sampler(self.input_sampler, None);
        }
        self.input_pool = vk::DescriptorPool::null();
        self.input_sampler = vk::Sampler::null();
        for (_, mut image) in self.attachments.drain() {
            image.destroy(device);
        }
    }
}

/// Pool big enough for every subpass input set in the graph
fn create_input_pool(device: &VulkanDevice, graph: &RenderGraph) -> Result<vk::DescriptorPool> {
    let mut sets = 0;
    let mut attachments = 0;
    let mut sampled = 0;
    for pass in 0..graph.pass_count() {
        for subpass in 0..graph.subpass_count(pass) {
            let bindings = graph.input_bindings(pass, subpass);
            if bindings.is_empty() {
                continue;
            }
            sets += 1;
            for binding in bindings {
                match binding {
                    InputBinding::Attachment(_) => attachments += 1,
                    InputBinding::Sampled(_) => sampled += 1,
                }
            }
        }
    }

    let mut sizes = Vec::new();
    if attachments > 0 {
        sizes.push(vk::DescriptorPoolSize {
            ty: vk::DescriptorType::INPUT_ATTACHMENT,
            descriptor_count: attachments,
        });
    }
    if sampled > 0 {
        sizes.push(vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: sampled,
        });
    }
    if sizes.is_empty() {
        sizes.push(vk::DescriptorPoolSize {
            ty: vk::DescriptorType::INPUT_ATTACHMENT,
            descriptor_count: 1,
        });
    }

    let info = vk::DescriptorPoolCreateInfo::builder()
        .max_sets(sets.max(1))
        .pool_sizes(&sizes);
    unsafe { device.device.create_descriptor_pool(&info, None) }
        .context("Failed to create subpass input pool")
}

/// Build the VkRenderPass for one pass of the graph
fn create_render_pass(
    device: &VulkanDevice,
    graph: &RenderGraph,
    pass: usize,
    swapchain_format: vk::Format,
) -> Result<vk::RenderPass> {
    let locals = graph.pass_attachments(pass);
    let subpasses = &graph.passes()[pass].subpasses;

    // ─────────────────────────────────────────────────────────────────────────
    // Attachment descriptions
    // ─────────────────────────────────────────────────────────────────────────
    let attachments: Vec<vk::AttachmentDescription> = locals
        .iter()
        .map(|&id| {
            let (format, store, final_layout) = match graph.attachment(id).kind {
                AttachmentKind::Swapchain => (
                    swapchain_format,
                    vk::AttachmentStoreOp::STORE,
                    vk::ImageLayout::PRESENT_SRC_KHR,
                ),
                AttachmentKind::Color(format) if graph.sampled_after(id, pass) => (
                    format,
                    vk::AttachmentStoreOp::STORE,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                ),
                AttachmentKind::Color(format) => (
                    format,
                    vk::AttachmentStoreOp::DONT_CARE,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                ),
                AttachmentKind::Depth(format) => (
                    format,
                    vk::AttachmentStoreOp::DONT_CARE,
                    vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                ),
            };
            vk::AttachmentDescription::builder()
                .format(format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(store)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(final_layout)
                .build()
        })
        .collect();

    // ─────────────────────────────────────────────────────────────────────────
    // Per-subpass references. Kept alive until the create call.
    // ─────────────────────────────────────────────────────────────────────────
    let local = |id: AttachmentId| locals.iter().position(|&a| a == id).map(|i| i as u32);

    let mut color_refs: Vec<Vec<vk::AttachmentReference>> = Vec::new();
    let mut input_refs: Vec<Vec<vk::AttachmentReference>> = Vec::new();
    let mut depth_refs: Vec<Option<vk::AttachmentReference>> = Vec::new();
    let mut preserve: Vec<Vec<u32>> = Vec::new();

    for (s, sub) in subpasses.iter().enumerate() {
        color_refs.push(
            sub.colors
                .iter()
                .filter_map(|&id| local(id))
                .map(|attachment| vk::AttachmentReference {
                    attachment,
                    layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                })
                .collect(),
        );
        input_refs.push(
            sub.inputs
                .iter()
                .filter_map(|&id| local(id))
                .map(|attachment| vk::AttachmentReference {
                    attachment,
                    layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                })
                .collect(),
        );
        depth_refs.push(sub.depth.and_then(local).map(|attachment| vk::AttachmentReference {
            attachment,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        }));

        // Attachments used before and after this subpass but not by it
        let uses = |sub: &crate::graph::SubpassDesc, id: AttachmentId| {
            sub.inputs.contains(&id) || sub.colors.contains(&id) || sub.depth == Some(id)
        };
        preserve.push(
            locals
                .iter()
                .filter(|&&id| {
                    !uses(sub, id)
                        && subpasses[..s].iter().any(|e| uses(e, id))
                        && subpasses[s + 1..].iter().any(|l| uses(l, id))
                })
                .filter_map(|&id| local(id))
                .collect(),
        );
    }

    let subpass_descs: Vec<vk::SubpassDescription> = (0..subpasses.len())
        .map(|s| {
            let mut desc = vk::SubpassDescription::builder()
                .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                .color_attachments(&color_refs[s])
                .input_attachments(&input_refs[s])
                .preserve_attachments(&preserve[s]);
            if let Some(depth) = depth_refs[s].as_ref() {
                desc = desc.depth_stencil_attachment(depth);
            }
            desc.build()
        })
        .collect();

    // ─────────────────────────────────────────────────────────────────────────
    // Dependencies: external -> first, each subpass -> next, last -> external
    // ─────────────────────────────────────────────────────────────────────────
    let attachment_stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
    let attachment_writes =
        vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;

    let mut dependencies = vec![vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(attachment_stages | vk::PipelineStageFlags::FRAGMENT_SHADER)
        .src_access_mask(vk::AccessFlags::SHADER_READ | attachment_writes)
        .dst_stage_mask(attachment_stages | vk::PipelineStageFlags::FRAGMENT_SHADER)
        .dst_access_mask(vk::AccessFlags::SHADER_READ | attachment_writes)
        .build()];
    for s in 1..subpasses.len() as u32 {
        dependencies.push(
            vk::SubpassDependency::builder()
                .src_subpass(s - 1)
                .dst_subpass(s)
                .src_stage_mask(attachment_stages)
                .src_access_mask(attachment_writes)
                .dst_stage_mask(attachment_stages | vk::PipelineStageFlags::FRAGMENT_SHADER)
                .dst_access_mask(
                    vk::AccessFlags::INPUT_ATTACHMENT_READ
                        | vk::AccessFlags::COLOR_ATTACHMENT_READ
                        | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                        | attachment_writes,
                )
                .dependency_flags(vk::DependencyFlags::BY_REGION)
                .build(),
        );
    }
    dependencies.push(
        vk::SubpassDependency::builder()
            .src_subpass(subpasses.len() as u32 - 1)
            .dst_subpass(vk::SUBPASS_EXTERNAL)
            .src_stage_mask(attachment_stages)
            .src_access_mask(attachment_writes)
            .dst_stage_mask(vk::PipelineStageFlags::FRAGMENT_SHADER)
            .dst_access_mask(vk::AccessFlags::SHADER_READ)
            .build(),
    );

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpass_descs)
        .dependencies(&dependencies);

    unsafe { device.device.create_render_pass(&render_pass_info, None) }
        .with_context(|| format!("Failed to create render pass '{}'", graph.passes()[pass].name))
}

// Graphics pipeline creation
//
// One pipeline per model, built against the render pass and subpass the
// model is placed in. Viewport and scissor are dynamic, so only a change of
// render pass (swapchain recreation) forces a rebuild.
//
// Descriptor sets:
//   set 0 - model: global uniform, model uniform, textures
//   set 1 - subpass inputs, when the subpass reads attachments

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::CStr;

use super::render_pass::SubpassTarget;
use super::VulkanDevice;
use crate::model::VertexLayout;

const ENTRY_POINT: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };

/// Vertex input for a tightly packed, single-binding layout.
/// An empty layout means the vertex shader generates its own positions.
pub fn vertex_input(
    layout: &VertexLayout,
) -> (
    Vec<vk::VertexInputBindingDescription>,
    Vec<vk::VertexInputAttributeDescription>,
) {
    if layout.attributes.is_empty() {
        return (Vec::new(), Vec::new());
    }

    let binding = vk::VertexInputBindingDescription::builder()
        .binding(0)
        .stride(layout.stride())
        .input_rate(vk::VertexInputRate::VERTEX)
        .build();

    let attributes = layout
        .attributes
        .iter()
        .zip(layout.offsets())
        .enumerate()
        .map(|(location, (&format, offset))| {
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(location as u32)
                .format(format)
                .offset(offset)
                .build()
        })
        .collect();

    (vec![binding], attributes)
}

/// Create the pipeline layout and pipeline for one model
pub fn create_graphics_pipeline(
    device: &VulkanDevice,
    target: &SubpassTarget,
    layout: &VertexLayout,
    model_set_layout: vk::DescriptorSetLayout,
    vert_shader: vk::ShaderModule,
    frag_shader: vk::ShaderModule,
) -> Result<(vk::Pipeline, vk::PipelineLayout)> {
    // Shader stages
    let vert_stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::VERTEX)
        .module(vert_shader)
        .name(ENTRY_POINT)
        .build();

    let frag_stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::FRAGMENT)
        .module(frag_shader)
        .name(ENTRY_POINT)
        .build();

    let shader_stages = &[vert_stage, frag_stage];

    // Vertex input
    let (bindings, attributes) = vertex_input(layout);
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    // Counts only; the values are set per render pass
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    // Full-screen passes draw a single clockwise triangle, so no culling
    let cull_mode = if layout.attributes.is_empty() {
        vk::CullModeFlags::NONE
    } else {
        vk::CullModeFlags::BACK
    };
    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(cull_mode)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(target.has_depth)
        .depth_write_enable(target.has_depth)
        .depth_compare_op(vk::CompareOp::LESS)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    // One opaque blend state per color attachment of the subpass
    let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)
        .build();
    let color_blend_attachments = vec![color_blend_attachment; target.color_count];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    // Pipeline layout
    let mut set_layouts = vec![model_set_layout];
    if let Some(inputs) = target.input_layout {
        set_layouts.push(inputs);
    }
    let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
    let pipeline_layout = unsafe { device.device.create_pipeline_layout(&layout_info, None) }
        .context("Failed to create pipeline layout")?;

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(pipeline_layout)
        .render_pass(target.render_pass)
        .subpass(target.subpass)
        .build();

    let pipelines = unsafe {
        device
            .device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    };
    let pipeline = pipelines
        .map_err(|(_, e)| e)
        .context("Failed to create graphics pipeline")
        .and_then(|pipelines| {
            pipelines
                .into_iter()
                .next()
                .context("Driver returned no graphics pipeline")
        });
    match pipeline {
        Ok(pipeline) => Ok((pipeline, pipeline_layout)),
        Err(e) => {
            unsafe { device.device.destroy_pipeline_layout(pipeline_layout, None) };
            Err(e)
        }
    }
}

pub fn destroy_pipeline(device: &VulkanDevice, pipeline: vk::Pipeline, layout: vk::PipelineLayout) {
    unsafe {
        device.device.destroy_pipeline(pipeline, None);
        device.device.destroy_pipeline_layout(layout, None);
    }
}

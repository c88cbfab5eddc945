// GPU objects a model owns beyond what the draw loop reads

use ash::vk;
use std::sync::Arc;

use super::buffer::GpuBuffer;
use super::image::Texture;
use crate::assets::Shared;

#[derive(Default)]
pub struct ModelObjects {
    pub vertex_buffer: Option<GpuBuffer>,
    pub index_buffer: Option<GpuBuffer>,
    pub vertex_shader: Option<Arc<Shared<vk::ShaderModule>>>,
    pub fragment_shader: Option<Arc<Shared<vk::ShaderModule>>>,
    pub textures: Vec<Arc<Shared<Texture>>>,
    pub set_layout: vk::DescriptorSetLayout,
    pub descriptor_pool: vk::DescriptorPool,
}

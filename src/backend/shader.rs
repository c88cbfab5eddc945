// Shader modules
//
// Models name their shaders by `LoadSource`; the words are loaded with
// `assets::load_spirv` and turned into modules here. Modules are shared
// through the builder's cache, so the same file is only compiled once.

use anyhow::{Context, Result};
use ash::vk;

use super::VulkanDevice;
use crate::assets::{load_spirv, LoadSource};

pub fn create_shader_module(device: &VulkanDevice, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);
    unsafe { device.device.create_shader_module(&create_info, None) }
        .context("Failed to create shader module")
}

/// Load SPIR-V from `source` and build a module from it
pub fn load_shader_module(device: &VulkanDevice, source: &LoadSource) -> Result<vk::ShaderModule> {
    let words = load_spirv(source)?;
    create_shader_module(device, &words)
        .with_context(|| format!("Shader {}", source.cache_key()))
}

pub fn destroy_shader_module(device: &VulkanDevice, module: vk::ShaderModule) {
    unsafe { device.device.destroy_shader_module(module, None) };
}

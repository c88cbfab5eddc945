// =============================================================================
// VULKAN MODEL BUILDER - GPU objects for one model
// =============================================================================
//
// Runs on the loader thread (construct, destroy) and on the main thread
// during swapchain recreation (recreate). Per model:
//
//   mesh       -> device-local vertex/index buffers (staging + single-time copy)
//   shaders    -> shared modules from the shader cache
//   textures   -> shared sampled images from the texture cache
//   set 0      -> binding 0: global uniform (per image region)
//                 binding 1: model uniform, when `uniform_size > 0`
//                 binding 2..: textures
//   pipeline   -> built against the model's (pass, subpass)
//
// Everything sized by the swapchain (descriptor sets, model uniforms,
// pipeline) is rebuilt by `recreate`.
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::buffer::{create_uniform_buffer, destroy_uniform_buffer, GpuBuffer};
use super::image::Texture;
use super::pipeline::{create_graphics_pipeline, destroy_pipeline};
use super::shader::{destroy_shader_module, load_shader_module};
use super::{VulkanBackend, VulkanDevice};
use crate::assets::{LoadSource, ReleaseHook, SharedCache};
use crate::error::EngineError;
use crate::frame::FrameCore;
use crate::model::{ModelBuilder, ModelInfo, ModelResources};

/// Vertices drawn for a model without vertex data (full-screen triangle)
const GENERATED_VERTEX_COUNT: u32 = 3;

/// CPU-side bytes for one model
#[derive(Debug, Default)]
pub struct LoadedResources {
    pub vertices: Vec<u8>,
    pub indices: Option<Vec<u32>>,
    /// RGBA8 pixels, in `ModelInfo::textures` order
    pub textures: Vec<Vec<u8>>,
}

/// Turns a model's sources into bytes
pub trait ResourceLoader: Send + Sync {
    fn load_resources(&self, info: &ModelInfo) -> Result<LoadedResources>;
}

/// Reads every `LoadSource` as-is: raw vertex bytes, little-endian u32
/// indices, raw RGBA8 pixels
#[derive(Debug, Default)]
pub struct SourceLoader;

impl ResourceLoader for SourceLoader {
    fn load_resources(&self, info: &ModelInfo) -> Result<LoadedResources> {
        let vertices = info.mesh.vertices.read()?.into_owned();
        let stride = info.mesh.layout.stride() as usize;
        if stride > 0 && vertices.is_empty() {
            anyhow::bail!("model '{}': vertex layout given but no vertex data", info.name);
        }
        if stride > 0 && vertices.len() % stride != 0 {
            anyhow::bail!(
                "model '{}': {} vertex bytes is not a multiple of stride {}",
                info.name,
                vertices.len(),
                stride
            );
        }

        let indices = match &info.mesh.indices {
            Some(source) => Some(read_indices(source)?),
            None => None,
        };

        let textures = info
            .textures
            .iter()
            .map(|texture| texture.source.read().map(|bytes| bytes.into_owned()))
            .collect::<Result<Vec<_>>>()?;

        Ok(LoadedResources {
            vertices,
            indices,
            textures,
        })
    }
}

fn read_indices(source: &LoadSource) -> Result<Vec<u32>> {
    let bytes = source.read()?;
    if bytes.is_empty() {
        anyhow::bail!("index source is empty");
    }
    if bytes.len() % 4 != 0 {
        anyhow::bail!("index data of {} bytes is not a whole number of u32s", bytes.len());
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

pub struct VulkanModelBuilder {
    backend: Arc<VulkanBackend>,
    core: Arc<FrameCore<VulkanBackend>>,
    loader: Box<dyn ResourceLoader>,
    shaders: SharedCache<vk::ShaderModule>,
    textures: SharedCache<Texture>,
}

impl VulkanModelBuilder {
    pub fn new(core: &Arc<FrameCore<VulkanBackend>>) -> Self {
        Self::with_loader(core, Box::new(SourceLoader))
    }

    pub fn with_loader(core: &Arc<FrameCore<VulkanBackend>>, loader: Box<dyn ResourceLoader>) -> Self {
        Self {
            backend: core.backend().clone(),
            core: core.clone(),
            loader,
            shaders: SharedCache::new("shader"),
            textures: SharedCache::new("texture"),
        }
    }

    fn device(&self) -> &Arc<VulkanDevice> {
        self.backend.device()
    }

    /// Live shader modules and textures
    pub fn cached_assets(&self) -> (usize, usize) {
        (self.shaders.len(), self.textures.len())
    }

    // =========================================================================
    // CONSTRUCTION
    // =========================================================================

    fn build(&self, info: &ModelInfo, res: &mut ModelResources) -> Result<()> {
        let device = self.device();
        let loaded = self
            .loader
            .load_resources(info)
            .with_context(|| format!("Failed to load resources of '{}'", info.name))?;

        // ─────────────────────────────────────────────────────────────────────
        // Geometry
        // ─────────────────────────────────────────────────────────────────────
        let stride = info.mesh.layout.stride();
        if stride > 0 {
            let vertex_buffer = GpuBuffer::device_local(
                device,
                &self.core,
                &format!("{} vertices", info.name),
                vk::BufferUsageFlags::VERTEX_BUFFER,
                &loaded.vertices,
            )?;
            res.vertex_buffers = vec![vertex_buffer.buffer];
            res.objects.vertex_buffer = Some(vertex_buffer);
        }

        res.element_count = match &loaded.indices {
            Some(indices) => {
                let index_buffer = GpuBuffer::device_local(
                    device,
                    &self.core,
                    &format!("{} indices", info.name),
                    vk::BufferUsageFlags::INDEX_BUFFER,
                    bytemuck::cast_slice(indices),
                )?;
                res.index_buffer = Some(index_buffer.buffer);
                res.objects.index_buffer = Some(index_buffer);
                indices.len() as u32
            }
            None if stride > 0 => (loaded.vertices.len() / stride as usize) as u32,
            None => GENERATED_VERTEX_COUNT,
        };

        // ─────────────────────────────────────────────────────────────────────
        // Shared assets
        // ─────────────────────────────────────────────────────────────────────
        res.objects.vertex_shader = Some(self.shader(&info.vertex_shader)?);
        res.objects.fragment_shader = Some(self.shader(&info.fragment_shader)?);

        for (texture, pixels) in info.textures.iter().zip(&loaded.textures) {
            let key = format!(
                "{}:{}x{}",
                texture.source.cache_key(),
                texture.width,
                texture.height
            );
            let shared = self.textures.get_or_create(&key, || {
                let uploaded = Texture::upload(
                    device,
                    &self.core,
                    &key,
                    texture.width,
                    texture.height,
                    pixels,
                )?;
                let device = device.clone();
                let release: ReleaseHook<Texture> = Box::new(move |t: &Texture| t.destroy(&device));
                Ok((uploaded, release))
            })?;
            res.objects.textures.push(shared);
        }

        res.objects.set_layout = self.create_set_layout(info)?;

        // ─────────────────────────────────────────────────────────────────────
        // Swapchain-dependent part
        // ─────────────────────────────────────────────────────────────────────
        self.build_per_image(info, res)
    }

    fn shader(&self, source: &LoadSource) -> Result<Arc<crate::assets::Shared<vk::ShaderModule>>> {
        let device = self.device();
        self.shaders.get_or_create(&source.cache_key(), || {
            let module = load_shader_module(device, source)?;
            let device = device.clone();
            let release: ReleaseHook<vk::ShaderModule> =
                Box::new(move |m: &vk::ShaderModule| destroy_shader_module(&device, *m));
            Ok((module, release))
        })
    }

    fn create_set_layout(&self, info: &ModelInfo) -> Result<vk::DescriptorSetLayout> {
        let mut bindings = vec![vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .build()];
        if info.uniform_size > 0 {
            bindings.push(
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(1)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
                    .build(),
            );
        }
        for i in 0..info.textures.len() {
            bindings.push(
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(2 + i as u32)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                    .build(),
            );
        }

        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        unsafe { self.device().device.create_descriptor_set_layout(&layout_info, None) }
            .context("Failed to create model descriptor set layout")
    }

    /// Descriptor pool + one set per swapchain image, model uniforms and the
    /// pipeline
    fn build_per_image(&self, info: &ModelInfo, res: &mut ModelResources) -> Result<()> {
        let device = self.device();
        let target = self
            .backend
            .subpass_target(info.pass, info.subpass)
            .ok_or(EngineError::InvalidPlacement {
                pass: info.pass,
                subpass: info.subpass,
            })?;
        let image_count = self.backend.image_count();
        let globals = self.backend.global_uniform();

        // ─────────────────────────────────────────────────────────────────────
        // Pool and sets
        // ─────────────────────────────────────────────────────────────────────
        let uniforms_per_set = if info.uniform_size > 0 { 2 } else { 1 };
        let mut pool_sizes = vec![vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: (uniforms_per_set * image_count) as u32,
        }];
        if !info.textures.is_empty() {
            pool_sizes.push(vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: (info.textures.len() * image_count) as u32,
            });
        }
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(image_count as u32)
            .pool_sizes(&pool_sizes);
        res.objects.descriptor_pool = unsafe { device.device.create_descriptor_pool(&pool_info, None) }
            .context("Failed to create model descriptor pool")?;

        let layouts = vec![res.objects.set_layout; image_count];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(res.objects.descriptor_pool)
            .set_layouts(&layouts);
        res.descriptor_sets = unsafe { device.device.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate model descriptor sets")?;

        if info.uniform_size > 0 {
            res.uniforms = Some(create_uniform_buffer(
                device,
                &format!("{} uniforms", info.name),
                info.uniform_size,
                image_count,
            )?);
        }

        // ─────────────────────────────────────────────────────────────────────
        // Write sets
        // ─────────────────────────────────────────────────────────────────────
        let texture_infos: Vec<vk::DescriptorImageInfo> = res
            .objects
            .textures
            .iter()
            .map(|texture| vk::DescriptorImageInfo {
                sampler: texture.sampler,
                image_view: texture.view,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            })
            .collect();

        for (image, &set) in res.descriptor_sets.iter().enumerate() {
            let global_info = [vk::DescriptorBufferInfo {
                buffer: globals.buffer,
                offset: globals.stride * image as u64,
                range: globals.size,
            }];
            let model_info = res.uniforms.as_ref().map(|u| {
                [vk::DescriptorBufferInfo {
                    buffer: u.buffer(),
                    offset: u.offset(image),
                    range: u.block_size() as u64,
                }]
            });

            let mut writes = vec![vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&global_info)
                .build()];
            if let Some(model_info) = model_info.as_ref() {
                writes.push(
                    vk::WriteDescriptorSet::builder()
                        .dst_set(set)
                        .dst_binding(1)
                        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                        .buffer_info(model_info)
                        .build(),
                );
            }
            for (i, texture_info) in texture_infos.iter().enumerate() {
                writes.push(
                    vk::WriteDescriptorSet::builder()
                        .dst_set(set)
                        .dst_binding(2 + i as u32)
                        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                        .image_info(std::slice::from_ref(texture_info))
                        .build(),
                );
            }
            unsafe { device.device.update_descriptor_sets(&writes, &[]) };
        }

        // ─────────────────────────────────────────────────────────────────────
        // Pipeline
        // ─────────────────────────────────────────────────────────────────────
        let (Some(vert), Some(frag)) = (&res.objects.vertex_shader, &res.objects.fragment_shader) else {
            anyhow::bail!("model '{}' has no shaders", info.name);
        };
        let (pipeline, layout) = create_graphics_pipeline(
            device,
            &target,
            &info.mesh.layout,
            res.objects.set_layout,
            ***vert,
            ***frag,
        )
        .with_context(|| format!("Failed to create pipeline for '{}'", info.name))?;
        res.pipeline = pipeline;
        res.pipeline_layout = layout;

        Ok(())
    }

    /// Tear down what `build_per_image` made
    fn destroy_per_image(&self, res: &mut ModelResources) {
        let device = self.device();
        destroy_pipeline(device, res.pipeline, res.pipeline_layout);
        res.pipeline = vk::Pipeline::null();
        res.pipeline_layout = vk::PipelineLayout::null();

        // Frees the sets
        unsafe { device.device.destroy_descriptor_pool(res.objects.descriptor_pool, None) };
        res.objects.descriptor_pool = vk::DescriptorPool::null();
        res.descriptor_sets.clear();

        if let Some(uniforms) = res.uniforms.take() {
            destroy_uniform_buffer(device, uniforms);
        }
    }
}

impl ModelBuilder for VulkanModelBuilder {
    fn construct(&self, info: &ModelInfo) -> Result<ModelResources> {
        let mut resources = ModelResources::default();
        match self.build(info, &mut resources) {
            Ok(()) => {
                log::debug!(
                    "Built model '{}': {} elements, {} textures, {} sets",
                    info.name,
                    resources.element_count,
                    resources.objects.textures.len(),
                    resources.descriptor_sets.len()
                );
                Ok(resources)
            }
            Err(e) => {
                self.destroy(resources);
                Err(e)
            }
        }
    }

    fn recreate(&self, info: &ModelInfo, resources: &mut ModelResources) -> Result<()> {
        self.destroy_per_image(resources);
        self.build_per_image(info, resources)
    }

    fn destroy(&self, mut resources: ModelResources) {
        let device = self.device();
        self.destroy_per_image(&mut resources);
        unsafe {
            device
                .device
                .destroy_descriptor_set_layout(resources.objects.set_layout, None)
        };
        if let Some(mut buffer) = resources.objects.vertex_buffer.take() {
            buffer.destroy(device);
        }
        if let Some(mut buffer) = resources.objects.index_buffer.take() {
            buffer.destroy(device);
        }
        // Shared shaders and textures release themselves with the last Arc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MeshSource, TextureSource, VertexLayout};

    fn info_with(mesh: MeshSource, textures: Vec<TextureSource>) -> ModelInfo {
        ModelInfo {
            name: "test".into(),
            pass: 0,
            subpass: 0,
            mesh,
            vertex_shader: LoadSource::buffer(vec![0u8; 4]),
            fragment_shader: LoadSource::buffer(vec![0u8; 4]),
            textures,
            uniform_size: 0,
            instances: 1,
        }
    }

    #[test]
    fn test_source_loader_reads_indices_little_endian() {
        let indices: Vec<u8> = [0u32, 1, 258].iter().flat_map(|i| i.to_le_bytes()).collect();
        let mesh = MeshSource {
            vertices: LoadSource::buffer(vec![0u8; 24]),
            indices: Some(LoadSource::buffer(indices)),
            layout: VertexLayout::new(vec![vk::Format::R32G32B32_SFLOAT]),
        };
        let loaded = SourceLoader.load_resources(&info_with(mesh, Vec::new())).unwrap();
        assert_eq!(loaded.vertices.len(), 24);
        assert_eq!(loaded.indices, Some(vec![0, 1, 258]));
    }

    #[test]
    fn test_source_loader_rejects_partial_vertex() {
        let mesh = MeshSource {
            vertices: LoadSource::buffer(vec![0u8; 20]),
            indices: None,
            layout: VertexLayout::new(vec![vk::Format::R32G32B32_SFLOAT]),
        };
        assert!(SourceLoader.load_resources(&info_with(mesh, Vec::new())).is_err());
    }

    #[test]
    fn test_source_loader_rejects_empty_vertices_with_layout() {
        let mesh = MeshSource {
            vertices: LoadSource::buffer(Vec::<u8>::new()),
            indices: None,
            layout: VertexLayout::new(vec![vk::Format::R32G32B32_SFLOAT]),
        };
        let err = SourceLoader
            .load_resources(&info_with(mesh, Vec::new()))
            .unwrap_err();
        assert!(err.to_string().contains("no vertex data"));
    }

    #[test]
    fn test_source_loader_rejects_empty_indices() {
        let mesh = MeshSource {
            vertices: LoadSource::buffer(vec![0u8; 12]),
            indices: Some(LoadSource::buffer(Vec::<u8>::new())),
            layout: VertexLayout::new(vec![vk::Format::R32G32B32_SFLOAT]),
        };
        assert!(SourceLoader.load_resources(&info_with(mesh, Vec::new())).is_err());
    }

    #[test]
    fn test_source_loader_rejects_ragged_indices() {
        let mesh = MeshSource {
            vertices: LoadSource::buffer(vec![0u8; 12]),
            indices: Some(LoadSource::buffer(vec![0u8; 6])),
            layout: VertexLayout::new(vec![vk::Format::R32G32B32_SFLOAT]),
        };
        assert!(SourceLoader.load_resources(&info_with(mesh, Vec::new())).is_err());
    }

    #[test]
    fn test_source_loader_reads_textures_in_order() {
        let textures = vec![
            TextureSource {
                source: LoadSource::buffer(vec![1u8; 4]),
                width: 1,
                height: 1,
            },
            TextureSource {
                source: LoadSource::buffer(vec![2u8; 16]),
                width: 2,
                height: 2,
            },
        ];
        let loaded = SourceLoader
            .load_resources(&info_with(MeshSource::fullscreen_triangle(), textures))
            .unwrap();
        assert!(loaded.vertices.is_empty());
        assert_eq!(loaded.textures.len(), 2);
        assert_eq!(loaded.textures[1], vec![2u8; 16]);
    }
}

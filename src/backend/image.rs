// Images: render-graph attachments and sampled textures

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

use super::buffer::GpuBuffer;
use super::{VulkanBackend, VulkanDevice};
use crate::frame::FrameCore;

/// Image + view + memory
pub struct GpuImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    allocation: Option<Allocation>,
}

impl GpuImage {
    pub fn new(
        device: &VulkanDevice,
        name: &str,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .with_context(|| format!("Failed to create image '{}'", name))?;
        let requirements = unsafe { device.device.get_image_memory_requirements(image) };

        let allocation = match device.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let (memory, offset) = (unsafe { allocation.memory() }, allocation.offset());
        let mut gpu_image = Self {
            image,
            view: vk::ImageView::null(),
            format,
            extent,
            allocation: Some(allocation),
        };

        let bound = unsafe { device.device.bind_image_memory(image, memory, offset) };
        if let Err(e) = bound {
            gpu_image.destroy(device);
            return Err(e).context("Failed to bind image memory");
        }

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(subresource_range(aspect));
        match unsafe { device.device.create_image_view(&view_info, None) } {
            Ok(view) => gpu_image.view = view,
            Err(e) => {
                gpu_image.destroy(device);
                return Err(e).context("Failed to create image view");
            }
        }

        Ok(gpu_image)
    }

    pub fn destroy(&mut self, device: &VulkanDevice) {
        unsafe {
            device.device.destroy_image_view(self.view, None);
            device.device.destroy_image(self.image, None);
        }
        self.view = vk::ImageView::null();
        self.image = vk::Image::null();
        if let Some(allocation) = self.allocation.take() {
            device.free(allocation);
        }
    }
}

pub fn subresource_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// A sampled RGBA8 texture shared between models
pub struct Texture {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
    // Taken by the cache's release hook, which only sees `&Texture`
    memory: Mutex<Option<GpuImage>>,
}

impl Texture {
    /// Upload RGBA8 pixels and transition the image for sampling.
    /// Blocks until the upload has finished.
    pub fn upload(
        device: &VulkanDevice,
        core: &FrameCore<VulkanBackend>,
        name: &str,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<Self> {
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected {
            anyhow::bail!(
                "texture '{}' has {} bytes, expected {} for {}x{} RGBA8",
                name,
                pixels.len(),
                expected,
                width,
                height
            );
        }

        let extent = vk::Extent2D { width, height };
        let mut image = GpuImage::new(
            device,
            name,
            extent,
            vk::Format::R8G8B8A8_SRGB,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::COLOR,
        )?;

        let mut staging = match GpuBuffer::with_data(
            device,
            &format!("{} staging", name),
            vk::BufferUsageFlags::TRANSFER_SRC,
            pixels,
        ) {
            Ok(staging) => staging,
            Err(e) => {
                image.destroy(device);
                return Err(e);
            }
        };

        let uploaded = core.submit_single_time(|cmd| {
            unsafe {
                // UNDEFINED -> TRANSFER_DST
                transition(
                    device,
                    cmd,
                    image.image,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                );

                let region = vk::BufferImageCopy::builder()
                    .image_subresource(vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    })
                    .image_extent(vk::Extent3D {
                        width,
                        height,
                        depth: 1,
                    })
                    .build();
                device.device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.buffer,
                    image.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );

                // TRANSFER_DST -> SHADER_READ_ONLY
                transition(
                    device,
                    cmd,
                    image.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                );
            }
            Ok(())
        });
        staging.destroy(device);
        if let Err(e) = uploaded {
            image.destroy(device);
            return Err(e);
        }

        let sampler = match create_sampler(device, true) {
            Ok(sampler) => sampler,
            Err(e) => {
                image.destroy(device);
                return Err(e);
            }
        };

        Ok(Self {
            image: image.image,
            view: image.view,
            sampler,
            memory: Mutex::new(Some(image)),
        })
    }

    pub fn destroy(&self, device: &VulkanDevice) {
        unsafe { device.device.destroy_sampler(self.sampler, None) };
        if let Some(mut image) = self.memory.lock().take() {
            image.destroy(device);
        }
    }
}

/// Linear, clamped sampler
pub fn create_sampler(device: &VulkanDevice, anisotropy: bool) -> Result<vk::Sampler> {
    let info = vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .anisotropy_enable(anisotropy)
        .max_anisotropy(if anisotropy { device.max_anisotropy() } else { 1.0 })
        .max_lod(0.0);
    unsafe { device.device.create_sampler(&info, None) }.context("Failed to create sampler")
}

/// Full-image layout transition for the two upload steps
unsafe fn transition(
    device: &VulkanDevice,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let (src_access, dst_access, src_stage, dst_stage) = match (old_layout, new_layout) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => (
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        _ => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
    };

    let barrier = vk::ImageMemoryBarrier::builder()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(subresource_range(vk::ImageAspectFlags::COLOR))
        .build();

    device.device.cmd_pipeline_barrier(
        cmd,
        src_stage,
        dst_stage,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        &[barrier],
    );
}

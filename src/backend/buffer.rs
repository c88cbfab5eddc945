// Buffer utilities for vertex, index, and uniform buffers
//
// All memory comes from the device's gpu-allocator. Host-visible buffers stay
// persistently mapped; device-local buffers are filled through a staging
// buffer and a single-time copy.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::{VulkanBackend, VulkanDevice};
use crate::frame::FrameCore;
use crate::uniform::{align_up, UniformBuffer, UniformMemory};

/// A buffer plus its allocation
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Option<Allocation>,
}

impl GpuBuffer {
    /// Create a buffer with memory in `location`
    pub fn new(
        device: &VulkanDevice,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size.max(1))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .with_context(|| format!("Failed to create buffer '{}'", name))?;
        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = match device.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            device.free(allocation);
            unsafe { device.device.destroy_buffer(buffer, None) };
            return Err(e).context("Failed to bind buffer memory");
        }

        Ok(Self {
            buffer,
            size,
            allocation: Some(allocation),
        })
    }

    /// Host-visible buffer filled with `data`
    pub fn with_data(
        device: &VulkanDevice,
        name: &str,
        usage: vk::BufferUsageFlags,
        data: &[u8],
    ) -> Result<Self> {
        let mut buffer = Self::new(
            device,
            name,
            data.len() as vk::DeviceSize,
            usage,
            MemoryLocation::CpuToGpu,
        )?;
        if let Err(e) = buffer.write(0, data) {
            buffer.destroy(device);
            return Err(e);
        }
        Ok(buffer)
    }

    /// Device-local buffer filled through a staging copy. Blocks until the
    /// copy has finished on the GPU.
    pub fn device_local(
        device: &VulkanDevice,
        core: &FrameCore<VulkanBackend>,
        name: &str,
        usage: vk::BufferUsageFlags,
        data: &[u8],
    ) -> Result<Self> {
        if data.is_empty() {
            anyhow::bail!("{}: device-local buffer needs at least one byte", name);
        }
        let mut staging = Self::with_data(
            device,
            &format!("{} staging", name),
            vk::BufferUsageFlags::TRANSFER_SRC,
            data,
        )?;

        let result = Self::new(
            device,
            name,
            data.len() as vk::DeviceSize,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        )
        .and_then(|mut target| {
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: data.len() as vk::DeviceSize,
            };
            let copied = core.submit_single_time(|cmd| {
                unsafe {
                    device
                        .device
                        .cmd_copy_buffer(cmd, staging.buffer, target.buffer, &[region]);
                }
                Ok(())
            });
            match copied {
                Ok(()) => Ok(target),
                Err(e) => {
                    target.destroy(device);
                    Err(e)
                }
            }
        });

        staging.destroy(device);
        result
    }

    /// Copy bytes into a mapped buffer
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let slice = self
            .allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .context("Buffer is not host mapped")?;
        let end = offset + data.len();
        if end > slice.len() {
            anyhow::bail!("write of {} bytes at {} overflows buffer of {}", data.len(), offset, slice.len());
        }
        slice[offset..end].copy_from_slice(data);
        Ok(())
    }

    pub fn destroy(&mut self, device: &VulkanDevice) {
        unsafe { device.device.destroy_buffer(self.buffer, None) };
        self.buffer = vk::Buffer::null();
        if let Some(allocation) = self.allocation.take() {
            device.free(allocation);
        }
    }
}

/// Persistently mapped uniform buffer with one aligned region per swapchain image
pub fn create_uniform_buffer(
    device: &VulkanDevice,
    name: &str,
    block_size: usize,
    copies: usize,
) -> Result<UniformBuffer> {
    let stride = align_up(block_size as u64, device.min_uniform_alignment());
    let mut buffer = GpuBuffer::new(
        device,
        name,
        stride * copies.max(1) as u64,
        vk::BufferUsageFlags::UNIFORM_BUFFER,
        MemoryLocation::CpuToGpu,
    )?;
    let Some(allocation) = buffer.allocation.take() else {
        anyhow::bail!("uniform buffer '{}' has no memory", name);
    };
    Ok(UniformBuffer::new(
        UniformMemory::Mapped {
            buffer: buffer.buffer,
            allocation,
        },
        block_size,
        stride,
        copies,
    ))
}

pub fn destroy_uniform_buffer(device: &VulkanDevice, uniforms: UniformBuffer) {
    match uniforms.into_memory() {
        UniformMemory::Mapped { buffer, allocation } => {
            unsafe { device.device.destroy_buffer(buffer, None) };
            device.free(allocation);
        }
        UniformMemory::Host(_) => {}
    }
}

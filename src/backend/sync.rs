// Frame slot objects
//
// One command pool + primary command buffer, two semaphores and a fence per
// frame in flight. The pool is reset as a whole every time the slot is
// reused, so buffers are never reset individually.

use anyhow::{Context, Result};
use ash::vk;

use super::VulkanDevice;
use crate::gpu::SlotObjects;

pub fn create_slot_objects(device: &VulkanDevice) -> Result<SlotObjects> {
    let pool_info = vk::CommandPoolCreateInfo::builder()
        .queue_family_index(device.graphics_queue_family)
        // Re-recorded every frame
        .flags(vk::CommandPoolCreateFlags::TRANSIENT);
    let semaphore_info = vk::SemaphoreCreateInfo::builder();
    // Start signaled so the first wait on a fresh slot returns at once
    let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

    let mut objects = SlotObjects {
        command_pool: vk::CommandPool::null(),
        command_buffer: vk::CommandBuffer::null(),
        image_available: vk::Semaphore::null(),
        render_finished: vk::Semaphore::null(),
        in_flight: vk::Fence::null(),
    };

    let result = (|| -> Result<()> {
        unsafe {
            objects.command_pool = device.device.create_command_pool(&pool_info, None)?;
            let alloc_info = vk::CommandBufferAllocateInfo::builder()
                .command_pool(objects.command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            objects.command_buffer = device
                .device
                .allocate_command_buffers(&alloc_info)?
                .into_iter()
                .next()
                .context("Driver returned no command buffer")?;
            objects.image_available = device.device.create_semaphore(&semaphore_info, None)?;
            objects.render_finished = device.device.create_semaphore(&semaphore_info, None)?;
            objects.in_flight = device.device.create_fence(&fence_info, None)?;
        }
        Ok(())
    })();

    match result {
        Ok(()) => Ok(objects),
        Err(e) => {
            destroy_slot_objects(device, &objects);
            Err(e).context("Failed to create frame slot objects")
        }
    }
}

/// Destroy slot objects. Null handles are skipped by the driver.
pub fn destroy_slot_objects(device: &VulkanDevice, objects: &SlotObjects) {
    unsafe {
        device.device.destroy_fence(objects.in_flight, None);
        device.device.destroy_semaphore(objects.render_finished, None);
        device.device.destroy_semaphore(objects.image_available, None);
        // Frees the command buffer with it
        device.device.destroy_command_pool(objects.command_pool, None);
    }
}

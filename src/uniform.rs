// Uniform buffers replicated once per swapchain image
//
// One contiguous region, `copies` slots of `stride` bytes each. `stride` is
// the block size rounded up to the device's minUniformBufferOffsetAlignment.
// The frame core writes slot N only after the fence guarding image N has
// been waited on, so host writes never race GPU reads.

use ash::vk;
use gpu_allocator::vulkan::Allocation;

use crate::error::EngineError;

/// Round `size` up to a multiple of `alignment` (alignment 0 means none)
pub fn align_up(size: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        size
    } else {
        size.div_ceil(alignment) * alignment
    }
}

/// Backing memory of a uniform buffer
pub enum UniformMemory {
    /// Persistently mapped host-visible allocation
    Mapped {
        buffer: vk::Buffer,
        allocation: Allocation,
    },
    /// CPU-only storage for headless backends
    Host(Vec<u8>),
}

pub struct UniformBuffer {
    memory: UniformMemory,
    block_size: usize,
    stride: u64,
    copies: usize,
}

impl UniformBuffer {
    pub fn new(memory: UniformMemory, block_size: usize, stride: u64, copies: usize) -> Self {
        Self {
            memory,
            block_size,
            stride,
            copies,
        }
    }

    /// Host-only buffer, mostly for tests and offscreen use
    pub fn host(block_size: usize, alignment: u64, copies: usize) -> Self {
        let stride = align_up(block_size as u64, alignment);
        Self::new(
            UniformMemory::Host(vec![0; stride as usize * copies]),
            block_size,
            stride,
            copies,
        )
    }

    pub fn buffer(&self) -> vk::Buffer {
        match &self.memory {
            UniformMemory::Mapped { buffer, .. } => *buffer,
            UniformMemory::Host(_) => vk::Buffer::null(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    pub fn copies(&self) -> usize {
        self.copies
    }

    /// Byte offset of the region used by one swapchain image
    pub fn offset(&self, image_index: usize) -> u64 {
        self.stride * image_index as u64
    }

    /// Copy `data` into the region of `image_index`
    pub fn write(&mut self, image_index: usize, data: &[u8]) -> Result<(), EngineError> {
        if data.len() > self.block_size {
            return Err(EngineError::UniformTooLarge {
                len: data.len(),
                capacity: self.block_size,
            });
        }
        if image_index >= self.copies {
            log::warn!(
                "uniform write for image {} but only {} copies exist",
                image_index,
                self.copies
            );
            return Ok(());
        }

        let start = self.offset(image_index) as usize;
        let region = match &mut self.memory {
            UniformMemory::Mapped { allocation, .. } => match allocation.mapped_slice_mut() {
                Some(slice) => slice,
                None => {
                    log::error!("uniform allocation is not host mapped");
                    return Ok(());
                }
            },
            UniformMemory::Host(bytes) => bytes.as_mut_slice(),
        };
        region[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Contents of one region (host-visible memory only)
    pub fn read(&self, image_index: usize) -> Option<&[u8]> {
        let start = self.offset(image_index) as usize;
        let bytes = match &self.memory {
            UniformMemory::Mapped { allocation, .. } => allocation.mapped_slice()?,
            UniformMemory::Host(bytes) => bytes.as_slice(),
        };
        bytes.get(start..start + self.block_size)
    }

    /// Give up the backing memory so the owner can free it
    pub fn into_memory(self) -> UniformMemory {
        self.memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(64, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(10, 0), 10);
    }

    #[test]
    fn test_regions_are_aligned_per_image() {
        let mut ubo = UniformBuffer::host(64, 256, 3);
        assert_eq!(ubo.stride(), 256);
        assert_eq!(ubo.offset(2), 512);

        ubo.write(1, &[7u8; 64]).unwrap();
        assert_eq!(ubo.read(1).unwrap(), &[7u8; 64][..]);
        assert_eq!(ubo.read(0).unwrap(), &[0u8; 64][..]);
        assert_eq!(ubo.read(2).unwrap(), &[0u8; 64][..]);
    }

    #[test]
    fn test_oversized_write_rejected() {
        let mut ubo = UniformBuffer::host(16, 64, 2);
        assert_eq!(
            ubo.write(0, &[0u8; 17]),
            Err(EngineError::UniformTooLarge { len: 17, capacity: 16 })
        );
    }

    #[test]
    fn test_out_of_range_image_ignored() {
        let mut ubo = UniformBuffer::host(16, 64, 2);
        assert!(ubo.write(5, &[1u8; 4]).is_ok());
        assert!(ubo.read(5).is_none());
    }
}

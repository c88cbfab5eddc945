// Per-frame update handed to the user callback

use ash::vk;

use crate::model::ModelHandle;

/// Uniform data staged by the update callback for the image about to be
/// recorded. Copied into that image's uniform regions after the callback
/// returns.
pub struct FrameUpdate {
    frame_number: u64,
    image_index: u32,
    extent: vk::Extent2D,
    pub(crate) global: Option<Vec<u8>>,
    pub(crate) models: Vec<(ModelHandle, Vec<u8>)>,
}

impl FrameUpdate {
    pub(crate) fn new(frame_number: u64, image_index: u32, extent: vk::Extent2D) -> Self {
        Self {
            frame_number,
            image_index,
            extent,
            global: None,
            models: Vec::new(),
        }
    }

    /// Monotonic count of frames that reached the update step
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.extent.width as f32 / self.extent.height.max(1) as f32
    }

    /// Frame-global uniform block (camera, time, lights...)
    pub fn set_global(&mut self, data: &[u8]) {
        self.global = Some(data.to_vec());
    }

    /// Per-model uniform block. Ignored for models without one.
    pub fn set_model(&mut self, handle: ModelHandle, data: &[u8]) {
        self.models.push((handle, data.to_vec()));
    }
}

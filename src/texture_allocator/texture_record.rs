use {
    crate::use_queue::{Residency, ResidentRecord},
    ash::vk,
    std::path::PathBuf,
};

/// Where a texture lives and how to rebuild it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TextureRecord {
    pub stage_offset: u64,
    pub upload_offset: u64,

    /// Bytes of tightly packed RGBA pixels in the stage buffer.
    pub size: u64,

    /// Bytes of upload memory the image needs, as reported by the device.
    pub upload_size: u64,

    pub width: u32,
    pub height: u32,

    /// Null while the texture has no image. Images are destroyed when the
    /// texture is evicted from upload memory and created again on demand.
    pub image: vk::Image,

    /// The file the pixels are decoded from.
    pub source_path: PathBuf,
}

impl ResidentRecord for TextureRecord {
    fn offset(&self, residency: Residency) -> u64 {
        match residency {
            Residency::Stage => self.stage_offset,
            Residency::Upload => self.upload_offset,
        }
    }

    fn set_offset(&mut self, residency: Residency, offset: u64) {
        match residency {
            Residency::Stage => self.stage_offset = offset,
            Residency::Upload => self.upload_offset = offset,
        }
    }

    fn size(&self, residency: Residency) -> u64 {
        match residency {
            Residency::Stage => self.size,
            Residency::Upload => self.upload_size,
        }
    }
}

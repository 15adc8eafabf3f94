use {
    super::{BufferCopy, ImageBind, ImageCopy, ImageInfo, TransferDevice},
    crate::{CacheConfig, CacheError},
    anyhow::anyhow,
    ash::{vk, vk::Handle},
    num::Integer,
    std::collections::HashMap,
};

/// The simulated state of an image created by the [FakeTransferDevice].
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct FakeImage {
    pub width: u32,
    pub height: u32,

    /// The upload memory offset the image is bound to, if any.
    pub memory_offset: Option<u64>,

    /// The most recently uploaded pixels.
    pub pixels: Vec<u8>,
}

/// A CPU-only transfer device which executes every recorded copy immediately
/// and keeps track of every image it creates.
pub struct FakeTransferDevice {
    /// The host side stage buffer.
    pub stage: Vec<u8>,

    /// A byte-for-byte mirror of the device-local upload target.
    pub upload: Vec<u8>,

    /// Every live image.
    pub images: HashMap<vk::Image, FakeImage>,

    /// Every buffer copy recorded so far, in order.
    pub buffer_copies: Vec<BufferCopy>,

    /// Every image copy recorded so far, in order.
    pub image_copies: Vec<ImageCopy>,

    /// The total number of images created with this device.
    pub images_created: u64,

    /// The total number of images destroyed with this device.
    pub images_destroyed: u64,

    /// The alignment reported for every created image.
    pub image_alignment: u64,

    /// When set, the next bind binds only the first image of the batch and
    /// then fails.
    pub fail_next_bind: bool,

    /// The frame currently being recorded.
    pub frame: Option<u64>,

    /// True once [TransferDevice::destroy] has been called.
    pub destroyed: bool,
}

impl FakeTransferDevice {
    /// Create a device with stage and upload memory sized by config.
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            stage: vec![0; config.stage_capacity as usize],
            upload: vec![0; config.upload_capacity as usize],
            images: HashMap::new(),
            buffer_copies: vec![],
            image_copies: vec![],
            images_created: 0,
            images_destroyed: 0,
            image_alignment: config.upload_granularity,
            fail_next_bind: false,
            frame: None,
            destroyed: false,
        }
    }

    /// The number of images which have been created but not destroyed.
    pub fn live_images(&self) -> usize {
        self.images.len()
    }

    fn require_frame(&self) -> Result<(), CacheError> {
        if self.frame.is_none() {
            return Err(CacheError::RuntimeError(anyhow!(
                "Commands recorded outside of a frame"
            )));
        }
        Ok(())
    }
}

impl TransferDevice for FakeTransferDevice {
    fn stage_memory(&mut self) -> &mut [u8] {
        &mut self.stage
    }

    unsafe fn begin_frame(
        &mut self,
        frame_index: u64,
    ) -> Result<(), CacheError> {
        if let Some(frame) = self.frame {
            return Err(CacheError::RuntimeError(anyhow!(
                "Frame {} is still being recorded",
                frame
            )));
        }
        self.frame = Some(frame_index);
        Ok(())
    }

    unsafe fn end_frame(&mut self) -> Result<vk::CommandBuffer, CacheError> {
        let frame = self
            .frame
            .take()
            .ok_or_else(|| anyhow!("No frame is being recorded"))?;
        Ok(vk::CommandBuffer::from_raw(frame % 2 + 1))
    }

    unsafe fn record_buffer_upload(
        &mut self,
        copies: &[BufferCopy],
    ) -> Result<(), CacheError> {
        self.require_frame()?;
        for copy in copies {
            let size = copy.size as usize;
            let src = copy.src_offset as usize..copy.src_offset as usize + size;
            let dst = copy.dst_offset as usize..copy.dst_offset as usize + size;
            if src.end > self.stage.len() || dst.end > self.upload.len() {
                return Err(CacheError::RuntimeError(anyhow!(
                    "Copy {:?} is out of bounds",
                    copy
                )));
            }
            self.upload[dst].copy_from_slice(&self.stage[src]);
            self.buffer_copies.push(*copy);
        }
        Ok(())
    }

    unsafe fn record_image_upload(
        &mut self,
        copies: &[ImageCopy],
    ) -> Result<(), CacheError> {
        self.require_frame()?;
        for copy in copies {
            let image = self.images.get_mut(&copy.image).ok_or_else(|| {
                anyhow!("Copy into unknown image {:?}", copy.image)
            })?;
            let memory_offset = image.memory_offset.ok_or_else(|| {
                anyhow!("Copy into unbound image {:?}", copy.image)
            })?;
            let size = copy.width as usize * copy.height as usize * 4;
            let src = copy.src_offset as usize..copy.src_offset as usize + size;
            let dst = memory_offset as usize..memory_offset as usize + size;
            if src.end > self.stage.len() || dst.end > self.upload.len() {
                return Err(CacheError::RuntimeError(anyhow!(
                    "Copy {:?} is out of bounds",
                    copy
                )));
            }
            image.pixels = self.stage[src.clone()].to_vec();
            self.upload[dst].copy_from_slice(&self.stage[src]);
            self.image_copies.push(*copy);
        }
        Ok(())
    }

    unsafe fn create_image(
        &mut self,
        width: u32,
        height: u32,
    ) -> Result<ImageInfo, CacheError> {
        self.images_created += 1;
        let image = vk::Image::from_raw(self.images_created);
        self.images.insert(
            image,
            FakeImage {
                width,
                height,
                ..FakeImage::default()
            },
        );
        let size_in_bytes = width as u64 * height as u64 * 4;
        Ok(ImageInfo {
            image,
            size_in_bytes: Integer::next_multiple_of(
                &size_in_bytes.max(1),
                &self.image_alignment,
            ),
            alignment: self.image_alignment,
        })
    }

    unsafe fn destroy_image(&mut self, image: vk::Image) {
        if self.images.remove(&image).is_some() {
            self.images_destroyed += 1;
        }
    }

    unsafe fn bind_image_memory(
        &mut self,
        binds: &[ImageBind],
    ) -> Result<(), CacheError> {
        for (index, bind) in binds.iter().enumerate() {
            if self.fail_next_bind && index > 0 {
                self.fail_next_bind = false;
                return Err(CacheError::RuntimeError(anyhow!(
                    "Simulated bind failure"
                )));
            }
            let image = self.images.get_mut(&bind.image).ok_or_else(|| {
                anyhow!("Bind of unknown image {:?}", bind.image)
            })?;
            if image.memory_offset.is_some() {
                return Err(CacheError::RuntimeError(anyhow!(
                    "Image {:?} is already bound",
                    bind.image
                )));
            }
            if bind.memory_offset % self.image_alignment != 0 {
                return Err(CacheError::RuntimeError(anyhow!(
                    "Bind offset {} is not aligned to {}",
                    bind.memory_offset,
                    self.image_alignment
                )));
            }
            image.memory_offset = Some(bind.memory_offset);
        }
        if self.fail_next_bind {
            self.fail_next_bind = false;
            return Err(CacheError::RuntimeError(anyhow!(
                "Simulated bind failure"
            )));
        }
        Ok(())
    }

    unsafe fn destroy(&mut self) {
        self.destroyed = true;
    }
}

#[cfg(test)]
mod test {
    use {super::*, pretty_assertions::assert_eq};

    fn config() -> CacheConfig {
        CacheConfig {
            stage_capacity: 1024,
            upload_capacity: 1024,
            stage_granularity: 256,
            upload_granularity: 256,
            ..CacheConfig::default()
        }
    }

    #[test]
    fn buffer_copies_require_a_frame() -> Result<(), CacheError> {
        let mut device = FakeTransferDevice::new(&config());
        let copy = BufferCopy {
            src_offset: 0,
            dst_offset: 256,
            size: 4,
        };
        unsafe {
            assert!(device.record_buffer_upload(&[copy]).is_err());

            device.stage[..4].copy_from_slice(&[1, 2, 3, 4]);
            device.begin_frame(3)?;
            device.record_buffer_upload(&[copy])?;
            let command_buffer = device.end_frame()?;
            assert_eq!(command_buffer, vk::CommandBuffer::from_raw(2));
        }
        assert_eq!(&device.upload[256..260], &[1, 2, 3, 4]);
        Ok(())
    }

    #[test]
    fn failed_bind_leaves_the_first_image_bound() -> Result<(), CacheError> {
        let mut device = FakeTransferDevice::new(&config());
        unsafe {
            let a = device.create_image(2, 2)?;
            let b = device.create_image(2, 2)?;
            assert_eq!(a.size_in_bytes, 256);

            device.fail_next_bind = true;
            let binds = [
                ImageBind {
                    image: a.image,
                    memory_offset: 0,
                },
                ImageBind {
                    image: b.image,
                    memory_offset: 256,
                },
            ];
            assert!(device.bind_image_memory(&binds).is_err());
            assert!(!device.fail_next_bind);

            // the first image can never be bound again
            assert!(device.bind_image_memory(&binds).is_err());
        }
        Ok(())
    }
}

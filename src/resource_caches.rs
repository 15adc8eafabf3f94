use {
    crate::{
        BufferAllocator, CacheError, ImageDecoder, ObjectCache, ObjectFactory,
        TextureAllocator, TransferDevice,
    },
    ash::vk,
};

/// Every cache a renderer needs, owned in one place and passed to whatever
/// prepares draws.
pub struct ResourceCaches<B, T, I, S, V>
where
    B: TransferDevice,
    T: TransferDevice,
    I: ImageDecoder,
    S: ObjectFactory,
    V: ObjectFactory,
{
    /// Vertex and index data.
    pub geometry: BufferAllocator<B>,
    pub textures: TextureAllocator<T, I>,
    pub samplers: ObjectCache<S>,
    pub image_views: ObjectCache<V>,
}

/// The transfer command buffers recorded during one frame.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FrameTransfers {
    pub geometry: vk::CommandBuffer,
    pub textures: vk::CommandBuffer,
}

impl<B, T, I, S, V> ResourceCaches<B, T, I, S, V>
where
    B: TransferDevice,
    T: TransferDevice,
    I: ImageDecoder,
    S: ObjectFactory,
    V: ObjectFactory,
{
    pub fn new(
        geometry: BufferAllocator<B>,
        textures: TextureAllocator<T, I>,
        samplers: ObjectCache<S>,
        image_views: ObjectCache<V>,
    ) -> Self {
        Self {
            geometry,
            textures,
            samplers,
            image_views,
        }
    }

    /// Start recording transfers for a frame.
    ///
    /// # Safety
    ///
    /// Unsafe because:
    ///   - the command buffers used two frames ago must be finished
    pub unsafe fn begin_frame(
        &mut self,
        frame_index: u64,
    ) -> Result<(), CacheError> {
        self.geometry.begin_frame(frame_index)?;
        self.textures.begin_frame(frame_index)
    }

    /// Finish recording transfers for the frame.
    ///
    /// # Safety
    ///
    /// Unsafe because:
    ///   - both command buffers must be executed before the frame's draws
    pub unsafe fn end_frame(&mut self) -> Result<FrameTransfers, CacheError> {
        Ok(FrameTransfers {
            geometry: self.geometry.end_frame()?,
            textures: self.textures.end_frame()?,
        })
    }

    /// Destroy every cache.
    ///
    /// # Safety
    ///
    /// Unsafe because:
    ///   - the device must be idle
    ///   - no method may be called afterwards
    pub unsafe fn destroy(&mut self) {
        self.image_views.destroy();
        self.samplers.destroy();
        self.textures.destroy();
        self.geometry.destroy();
    }
}

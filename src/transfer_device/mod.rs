mod ash_transfer_device;
mod fake_transfer_device;

use {crate::CacheError, ash::vk};

pub use self::{
    ash_transfer_device::{AshTransferDevice, QueueFamilies, UploadKind},
    fake_transfer_device::{FakeImage, FakeTransferDevice},
};

/// A copy from the stage buffer into the upload buffer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

/// A copy from the stage buffer into a tightly packed RGBA image.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ImageCopy {
    pub src_offset: u64,
    pub image: vk::Image,
    pub width: u32,
    pub height: u32,
}

/// Bind an image to the upload memory at the given offset.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ImageBind {
    pub image: vk::Image,
    pub memory_offset: u64,
}

/// A freshly created, unbound image and its memory requirements.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ImageInfo {
    pub image: vk::Image,
    pub size_in_bytes: u64,
    pub alignment: u64,
}

/// The graphics-API operations an allocator needs to move bytes from the
/// stage buffer to device memory.
///
/// Each allocator owns one transfer device which in turn owns one stage
/// buffer and one upload target.
pub trait TransferDevice {
    /// Host access to the whole persistently mapped stage buffer.
    fn stage_memory(&mut self) -> &mut [u8];

    /// Begin recording transfer commands for a frame. Frames alternate
    /// between two command buffers based on the parity of frame_index.
    ///
    /// # Safety
    ///
    /// Unsafe because the command buffer for this parity must no longer be
    /// in use by the device.
    unsafe fn begin_frame(&mut self, frame_index: u64)
        -> Result<(), CacheError>;

    /// Finish recording and return the command buffer for the caller to
    /// execute.
    ///
    /// # Safety
    ///
    /// Unsafe because the caller is responsible for submitting the command
    /// buffer and synchronizing with the draw commands which consume it.
    unsafe fn end_frame(&mut self) -> Result<vk::CommandBuffer, CacheError>;

    /// Record stage to upload buffer copies.
    ///
    /// # Safety
    ///
    /// Unsafe because the stage and upload regions must not be in use by
    /// commands which are still executing.
    unsafe fn record_buffer_upload(
        &mut self,
        copies: &[BufferCopy],
    ) -> Result<(), CacheError>;

    /// Record stage to image copies. The images must already be bound.
    ///
    /// # Safety
    ///
    /// Unsafe because the images must not be in use by commands which are
    /// still executing.
    unsafe fn record_image_upload(
        &mut self,
        copies: &[ImageCopy],
    ) -> Result<(), CacheError>;

    /// Create an RGBA image without binding it to memory.
    ///
    /// # Safety
    ///
    /// Unsafe because the image must be destroyed with
    /// [TransferDevice::destroy_image] before the device is destroyed.
    unsafe fn create_image(
        &mut self,
        width: u32,
        height: u32,
    ) -> Result<ImageInfo, CacheError>;

    /// # Safety
    ///
    /// Unsafe because the image must not be in use by the device.
    unsafe fn destroy_image(&mut self, image: vk::Image);

    /// Bind every image in one call. On failure the bound state of every
    /// image in the batch is undefined.
    ///
    /// # Safety
    ///
    /// Unsafe because none of the images may be bound already.
    unsafe fn bind_image_memory(
        &mut self,
        binds: &[ImageBind],
    ) -> Result<(), CacheError>;

    /// Destroy the stage buffer, upload target and command buffers.
    ///
    /// # Safety
    ///
    /// Unsafe because the device must be idle and no method may be called
    /// afterwards.
    unsafe fn destroy(&mut self);
}

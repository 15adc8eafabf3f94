use {
    super::{BufferCopy, ImageBind, ImageCopy, ImageInfo, TransferDevice},
    crate::{
        device_memory::MappedMemory, CacheConfig, CacheError, MemoryProperties,
    },
    anyhow::{anyhow, Context},
    ash::vk,
};

/// Every texture is uploaded as 8-bit sRGB RGBA.
const IMAGE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// What kind of device-local target receives the uploads.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum UploadKind {
    /// A device-local vertex/index buffer.
    Buffer,

    /// Raw device-local memory which images are bound into.
    Image,
}

/// The hardware queue families which execute transfers and draws.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct QueueFamilies {
    pub transfer: u32,
    pub graphics: u32,
}

impl QueueFamilies {
    /// Source and destination family indices for the barrier which follows
    /// an upload. Ownership only moves when the families differ.
    fn barrier_families(&self) -> (u32, u32) {
        if self.transfer == self.graphics {
            (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED)
        } else {
            (self.transfer, self.graphics)
        }
    }

    fn needs_ownership_transfer(&self) -> bool {
        self.transfer != self.graphics
    }
}

#[derive(Debug, Copy, Clone)]
enum UploadTarget {
    Buffer {
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
    },
    Memory {
        memory: vk::DeviceMemory,
    },
}

/// A Vulkan implementation of the transfer device.
pub struct AshTransferDevice {
    device: ash::Device,
    queue_families: QueueFamilies,
    stage_buffer: vk::Buffer,
    stage_memory: MappedMemory,
    upload: UploadTarget,
    command_pool: vk::CommandPool,
    command_buffers: [vk::CommandBuffer; 2],
    recording: Option<vk::CommandBuffer>,
}

// Public API
// ----------

impl AshTransferDevice {
    /// Create the stage buffer, upload target and per-frame command buffers.
    ///
    /// # Safety
    ///
    /// Unsafe because:
    ///   - the ash device must not be destroyed while the transfer device
    ///     still exists
    ///   - [TransferDevice::destroy] must be called before the device is
    ///     destroyed
    pub unsafe fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        config: &CacheConfig,
        upload_kind: UploadKind,
        queue_families: QueueFamilies,
    ) -> Result<Self, CacheError> {
        config.validate()?;
        let memory_properties =
            MemoryProperties::new(instance, physical_device);
        log::trace!(
            "Transfer device for device with memory properties\n{}",
            memory_properties
        );

        let (stage_buffer, raw_stage_memory) = create_buffer(
            &device,
            &memory_properties,
            config.stage_capacity,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        let stage_memory = match MappedMemory::map(
            &device,
            raw_stage_memory,
            config.stage_capacity,
        ) {
            Ok(stage_memory) => stage_memory,
            Err(error) => {
                device.destroy_buffer(stage_buffer, None);
                device.free_memory(raw_stage_memory, None);
                return Err(error);
            }
        };

        // Everything after the stage buffer starts out null so a failure
        // can be cleaned up with destroy.
        let mut transfer_device = Self {
            device,
            queue_families,
            stage_buffer,
            stage_memory,
            upload: UploadTarget::Memory {
                memory: vk::DeviceMemory::null(),
            },
            command_pool: vk::CommandPool::null(),
            command_buffers: [vk::CommandBuffer::null(); 2],
            recording: None,
        };
        let result = transfer_device
            .create_upload_target(&memory_properties, config, upload_kind)
            .and_then(|_| transfer_device.create_command_buffers());
        if let Err(error) = result {
            transfer_device.destroy();
            return Err(error);
        }
        Ok(transfer_device)
    }

    /// The device-local buffer which receives buffer uploads.
    pub fn upload_buffer(&self) -> Option<vk::Buffer> {
        match self.upload {
            UploadTarget::Buffer { buffer, .. } => Some(buffer),
            UploadTarget::Memory { .. } => None,
        }
    }
}

impl TransferDevice for AshTransferDevice {
    fn stage_memory(&mut self) -> &mut [u8] {
        self.stage_memory.as_mut_slice()
    }

    unsafe fn begin_frame(
        &mut self,
        frame_index: u64,
    ) -> Result<(), CacheError> {
        let command_buffer = self.command_buffers[(frame_index % 2) as usize];
        self.device
            .reset_command_buffer(
                command_buffer,
                vk::CommandBufferResetFlags::empty(),
            )
            .context("Error resetting the transfer command buffer")?;

        let inheritance_info = vk::CommandBufferInheritanceInfo::default();
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .inheritance_info(&inheritance_info);
        self.device
            .begin_command_buffer(command_buffer, &begin_info)
            .context("Error beginning the transfer command buffer")?;

        self.recording = Some(command_buffer);
        Ok(())
    }

    unsafe fn end_frame(&mut self) -> Result<vk::CommandBuffer, CacheError> {
        let command_buffer = self.recording()?;
        self.device
            .end_command_buffer(command_buffer)
            .context("Error ending the transfer command buffer")?;
        self.recording = None;
        Ok(command_buffer)
    }

    unsafe fn record_buffer_upload(
        &mut self,
        copies: &[BufferCopy],
    ) -> Result<(), CacheError> {
        let command_buffer = self.recording()?;
        let UploadTarget::Buffer { buffer, .. } = self.upload else {
            return Err(CacheError::RuntimeError(anyhow!(
                "Buffer uploads require an upload buffer"
            )));
        };

        let regions = copies
            .iter()
            .map(|copy| vk::BufferCopy {
                src_offset: copy.src_offset,
                dst_offset: copy.dst_offset,
                size: copy.size,
            })
            .collect::<Vec<_>>();
        self.device.cmd_copy_buffer(
            command_buffer,
            self.stage_buffer,
            buffer,
            &regions,
        );

        let (src_family, dst_family) = self.queue_families.barrier_families();
        let (dst_access, dst_stage) =
            if self.queue_families.needs_ownership_transfer() {
                (
                    vk::AccessFlags::empty(),
                    vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                )
            } else {
                (
                    vk::AccessFlags::VERTEX_ATTRIBUTE_READ
                        | vk::AccessFlags::INDEX_READ,
                    vk::PipelineStageFlags::VERTEX_INPUT,
                )
            };
        let barriers = copies
            .iter()
            .map(|copy| {
                vk::BufferMemoryBarrier::default()
                    .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .dst_access_mask(dst_access)
                    .src_queue_family_index(src_family)
                    .dst_queue_family_index(dst_family)
                    .buffer(buffer)
                    .offset(copy.dst_offset)
                    .size(copy.size)
            })
            .collect::<Vec<_>>();
        self.device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::TRANSFER,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &barriers,
            &[],
        );
        Ok(())
    }

    unsafe fn record_image_upload(
        &mut self,
        copies: &[ImageCopy],
    ) -> Result<(), CacheError> {
        let command_buffer = self.recording()?;
        let subresource_range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };

        let to_transfer = copies
            .iter()
            .map(|copy| {
                vk::ImageMemoryBarrier::default()
                    .old_layout(vk::ImageLayout::UNDEFINED)
                    .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(copy.image)
                    .subresource_range(subresource_range)
                    .src_access_mask(vk::AccessFlags::empty())
                    .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            })
            .collect::<Vec<_>>();
        self.device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &to_transfer,
        );

        for copy in copies {
            let region = vk::BufferImageCopy::default()
                .buffer_offset(copy.src_offset)
                .buffer_row_length(0)
                .buffer_image_height(0)
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
                .image_extent(vk::Extent3D {
                    width: copy.width,
                    height: copy.height,
                    depth: 1,
                });
            self.device.cmd_copy_buffer_to_image(
                command_buffer,
                self.stage_buffer,
                copy.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }

        let (src_family, dst_family) = self.queue_families.barrier_families();
        let (dst_access, dst_stage) =
            if self.queue_families.needs_ownership_transfer() {
                (
                    vk::AccessFlags::empty(),
                    vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                )
            } else {
                (
                    vk::AccessFlags::SHADER_READ,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                )
            };
        let to_shader_read = copies
            .iter()
            .map(|copy| {
                vk::ImageMemoryBarrier::default()
                    .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                    .src_queue_family_index(src_family)
                    .dst_queue_family_index(dst_family)
                    .image(copy.image)
                    .subresource_range(subresource_range)
                    .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .dst_access_mask(dst_access)
            })
            .collect::<Vec<_>>();
        self.device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::TRANSFER,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &to_shader_read,
        );
        Ok(())
    }

    unsafe fn create_image(
        &mut self,
        width: u32,
        height: u32,
    ) -> Result<ImageInfo, CacheError> {
        let create_info = image_create_info(width, height);
        let image = self
            .device
            .create_image(&create_info, None)
            .with_context(|| {
                format!("Error creating a {}x{} image", width, height)
            })?;
        let requirements = self.device.get_image_memory_requirements(image);
        Ok(ImageInfo {
            image,
            size_in_bytes: requirements.size,
            alignment: requirements.alignment,
        })
    }

    unsafe fn destroy_image(&mut self, image: vk::Image) {
        self.device.destroy_image(image, None);
    }

    unsafe fn bind_image_memory(
        &mut self,
        binds: &[ImageBind],
    ) -> Result<(), CacheError> {
        let UploadTarget::Memory { memory } = self.upload else {
            return Err(CacheError::RuntimeError(anyhow!(
                "Image binds require raw upload memory"
            )));
        };
        let bind_infos = binds
            .iter()
            .map(|bind| {
                vk::BindImageMemoryInfo::default()
                    .image(bind.image)
                    .memory(memory)
                    .memory_offset(bind.memory_offset)
            })
            .collect::<Vec<_>>();
        self.device
            .bind_image_memory2(&bind_infos)
            .with_context(|| format!("Error binding {} images", binds.len()))?;
        Ok(())
    }

    unsafe fn destroy(&mut self) {
        self.device.destroy_command_pool(self.command_pool, None);
        self.recording = None;
        self.device.destroy_buffer(self.stage_buffer, None);
        self.stage_memory.free(&self.device);
        match self.upload {
            UploadTarget::Buffer { buffer, memory } => {
                self.device.destroy_buffer(buffer, None);
                self.device.free_memory(memory, None);
            }
            UploadTarget::Memory { memory } => {
                self.device.free_memory(memory, None);
            }
        }
    }
}

// Private API
// -----------

impl AshTransferDevice {
    unsafe fn create_upload_target(
        &mut self,
        memory_properties: &MemoryProperties,
        config: &CacheConfig,
        upload_kind: UploadKind,
    ) -> Result<(), CacheError> {
        self.upload = match upload_kind {
            UploadKind::Buffer => {
                let (buffer, memory) = create_buffer(
                    &self.device,
                    memory_properties,
                    config.upload_capacity,
                    vk::BufferUsageFlags::TRANSFER_DST
                        | vk::BufferUsageFlags::VERTEX_BUFFER
                        | vk::BufferUsageFlags::INDEX_BUFFER,
                    vk::MemoryPropertyFlags::DEVICE_LOCAL,
                )?;
                UploadTarget::Buffer { buffer, memory }
            }
            UploadKind::Image => UploadTarget::Memory {
                memory: allocate_image_memory(
                    &self.device,
                    memory_properties,
                    config.upload_capacity,
                )?,
            },
        };
        Ok(())
    }

    unsafe fn create_command_buffers(&mut self) -> Result<(), CacheError> {
        let command_pool_create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.queue_families.transfer)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        self.command_pool = self
            .device
            .create_command_pool(&command_pool_create_info, None)
            .context("Error creating the transfer command pool")?;

        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::SECONDARY)
            .command_buffer_count(2);
        let command_buffers = self
            .device
            .allocate_command_buffers(&allocate_info)
            .context("Error allocating the transfer command buffers")?;
        self.command_buffers = [command_buffers[0], command_buffers[1]];
        Ok(())
    }

    fn recording(&self) -> Result<vk::CommandBuffer, CacheError> {
        self.recording.ok_or_else(|| {
            CacheError::RuntimeError(anyhow!(
                "Transfer commands can only be recorded between begin_frame \
                 and end_frame"
            ))
        })
    }
}

fn image_create_info(width: u32, height: u32) -> vk::ImageCreateInfo<'static> {
    vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(IMAGE_FORMAT)
        .extent(vk::Extent3D {
            width,
            height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        )
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
}

/// Create a buffer backed by its own memory allocation.
unsafe fn create_buffer(
    device: &ash::Device,
    memory_properties: &MemoryProperties,
    size_in_bytes: u64,
    usage: vk::BufferUsageFlags,
    memory_property_flags: vk::MemoryPropertyFlags,
) -> Result<(vk::Buffer, vk::DeviceMemory), CacheError> {
    let create_info = vk::BufferCreateInfo::default()
        .size(size_in_bytes)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    let buffer = device.create_buffer(&create_info, None).with_context(|| {
        format!("Error creating a buffer with {:#?}", create_info)
    })?;
    match allocate_buffer_memory(
        device,
        memory_properties,
        buffer,
        memory_property_flags,
    ) {
        Ok(memory) => Ok((buffer, memory)),
        Err(error) => {
            device.destroy_buffer(buffer, None);
            Err(error)
        }
    }
}

/// Allocate and bind dedicated memory for buffer.
unsafe fn allocate_buffer_memory(
    device: &ash::Device,
    memory_properties: &MemoryProperties,
    buffer: vk::Buffer,
    memory_property_flags: vk::MemoryPropertyFlags,
) -> Result<vk::DeviceMemory, CacheError> {
    let requirements = device.get_buffer_memory_requirements(buffer);
    let memory_type_index = memory_properties
        .find_type_index(requirements.memory_type_bits, memory_property_flags)?;
    let allocate_info = vk::MemoryAllocateInfo::default()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);
    let memory = device
        .allocate_memory(&allocate_info, None)
        .with_context(|| {
            format!(
                "Error allocating {} bytes of buffer memory",
                requirements.size
            )
        })?;

    if let Err(error) = device.bind_buffer_memory(buffer, memory, 0) {
        device.free_memory(memory, None);
        return Err(CacheError::RuntimeError(
            anyhow::Error::new(error).context("Error binding buffer memory"),
        ));
    }
    Ok(memory)
}

/// Allocate device-local memory that RGBA images can be bound into.
///
/// The memory type is chosen from the requirements of a sample image with
/// the same format and usage as every texture.
unsafe fn allocate_image_memory(
    device: &ash::Device,
    memory_properties: &MemoryProperties,
    size_in_bytes: u64,
) -> Result<vk::DeviceMemory, CacheError> {
    let sample = device
        .create_image(&image_create_info(1, 1), None)
        .context("Error creating a sample image")?;
    let requirements = device.get_image_memory_requirements(sample);
    device.destroy_image(sample, None);

    let memory_type_index = memory_properties.find_type_index(
        requirements.memory_type_bits,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;
    let allocate_info = vk::MemoryAllocateInfo::default()
        .allocation_size(size_in_bytes)
        .memory_type_index(memory_type_index);
    let memory = device
        .allocate_memory(&allocate_info, None)
        .with_context(|| {
            format!("Error allocating {} bytes of image memory", size_in_bytes)
        })?;
    Ok(memory)
}

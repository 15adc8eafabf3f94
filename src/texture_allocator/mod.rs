//! Textures which are decoded from image files, staged, and uploaded into
//! device images on demand.
//!
//! Textures are deduplicated by source path. Unlike buffers there is no disk
//! store, a texture evicted from the stage buffer is decoded again the next
//! time it is staged.

mod texture_record;

use {
    crate::{
        config::align_up,
        image_decoder::{DecodedImage, ImageDecoder},
        pretty_wrappers::PrettySize,
        transfer_device::{ImageBind, ImageCopy, ImageInfo, TransferDevice},
        use_queue::{
            Placement, Residency, UseQueue, HIT_WEIGHT_DECAY,
            HIT_WEIGHT_INCREMENT,
        },
        AllocationKey, CacheConfig, CacheError, FreeSpaceBitmap, SlotFlags,
        WeightedSlotRegistry,
    },
    anyhow::anyhow,
    ash::vk,
    indoc::indoc,
    num::Integer,
    rustc_hash::FxHashMap,
    std::path::{Path, PathBuf},
};

pub use self::texture_record::TextureRecord;

/// Stages and uploads decoded textures.
pub struct TextureAllocator<D: TransferDevice, I: ImageDecoder> {
    config: CacheConfig,
    device: D,
    decoder: I,
    registry: WeightedSlotRegistry<TextureRecord>,
    keys_by_path: FxHashMap<PathBuf, AllocationKey>,
    stage_queue: UseQueue,
    upload_queue: UseQueue,
}

// Public API
// ----------

impl<D: TransferDevice, I: ImageDecoder> TextureAllocator<D, I> {
    /// Create a texture allocator.
    ///
    /// # Params
    ///
    /// * `config` - capacities and granularities. Must pass
    ///   [CacheConfig::validate].
    /// * `device` - owns the stage buffer and the upload memory images are
    ///   bound into.
    /// * `decoder` - turns source paths into pixels.
    pub fn new(
        config: CacheConfig,
        device: D,
        decoder: I,
    ) -> Result<Self, CacheError> {
        config.validate()?;
        log::trace!("Creating a texture allocator with\n{}", config);
        Ok(Self {
            device,
            decoder,
            registry: WeightedSlotRegistry::new(config.allocation_cap),
            keys_by_path: FxHashMap::default(),
            stage_queue: UseQueue::new(
                Residency::Stage,
                config.stage_capacity,
                config.stage_granularity,
                config.stage_queue_cap,
            ),
            upload_queue: UseQueue::new(
                Residency::Upload,
                config.upload_capacity,
                config.upload_granularity,
                config.upload_queue_cap,
            ),
            config,
        })
    }

    /// Register the texture at path.
    ///
    /// Adding a path which is already registered only bumps its weight and
    /// returns the existing key.
    ///
    /// # Returns
    ///
    /// * Err(AllocatorFull): the allocation cap has been reached.
    /// * Err(MisalignedBitGranularity): the device requires a larger image
    ///   alignment than the upload granularity provides.
    /// * Err(AllocationTooLarge): the texture can never fit in one of the
    ///   queues.
    ///
    /// # Safety
    ///
    /// Unsafe because:
    ///   - a device image is created, it is only released by
    ///     [TextureAllocator::destroy]
    pub unsafe fn add_texture(
        &mut self,
        path: impl AsRef<Path>,
    ) -> Result<AllocationKey, CacheError> {
        let path = path.as_ref();
        if let Some(&key) = self.keys_by_path.get(path) {
            self.registry
                .bump(key, HIT_WEIGHT_INCREMENT, HIT_WEIGHT_DECAY);
            return Ok(key);
        }
        if self.registry.is_full() {
            return Err(CacheError::AllocatorFull);
        }

        let (width, height) = self.decoder.dimensions(path)?;
        let size = DecodedImage::size_in_bytes(width, height);
        let info = self.device.create_image(width, height)?;
        if let Err(error) = self.check_image(size, &info) {
            self.device.destroy_image(info.image);
            return Err(error);
        }

        let key = self.registry.push(TextureRecord {
            stage_offset: 0,
            upload_offset: 0,
            size,
            upload_size: info.size_in_bytes,
            width,
            height,
            image: info.image,
            source_path: path.to_path_buf(),
        })?;
        self.keys_by_path.insert(path.to_path_buf(), key);
        log::trace!(
            "Added {:?} as {:?} ({}x{}, {} in upload memory)",
            path,
            key,
            width,
            height,
            PrettySize(info.size_in_bytes)
        );
        Ok(key)
    }

    pub fn stage_queue_begin(&mut self) -> Result<(), CacheError> {
        self.stage_queue.begin()
    }

    /// Request stage residency for key.
    pub fn stage_queue_add(
        &mut self,
        key: AllocationKey,
    ) -> Result<(), CacheError> {
        self.stage_queue.add(&mut self.registry, key)
    }

    /// Clear the stage batch without submitting it.
    pub fn stage_queue_make_empty(&mut self) {
        self.stage_queue.make_empty(&mut self.registry);
    }

    /// Decode every queued texture into the stage buffer.
    ///
    /// # Returns
    ///
    /// * Err(StageFull): not enough room even after evicting. Nothing
    ///   changed, the queue keeps its contents.
    /// * Err(RuntimeError): a decode failed. Textures evicted for the batch
    ///   stay evicted and the queue is emptied.
    ///
    /// # Safety
    ///
    /// Unsafe because:
    ///   - the stage buffer is written, no submitted transfer may still be
    ///     reading the regions which are reused
    pub unsafe fn stage_queue_submit(&mut self) -> Result<(), CacheError> {
        let Some(reservation) = self.stage_queue.reserve(&self.registry)? else {
            return Ok(());
        };
        let placements = self.stage_queue.place(&self.registry, &reservation);

        for placement in &placements {
            let result = decode_into_stage(
                &mut self.decoder,
                self.device.stage_memory(),
                self.registry.record(placement.slot),
                placement.offset,
            );
            if let Err(error) = result {
                log::warn!(
                    "Unable to stage {:?}: {}",
                    self.registry.key(placement.slot),
                    error
                );
                self.stage_queue.abandon(&mut self.registry, reservation);
                self.stage_queue.make_empty(&mut self.registry);
                return Err(error);
            }
        }

        self.stage_queue
            .commit(&mut self.registry, reservation, &placements);
        Ok(())
    }

    pub fn upload_queue_begin(&mut self) -> Result<(), CacheError> {
        self.upload_queue.begin()
    }

    /// Request upload residency for key.
    ///
    /// # Returns
    ///
    /// * Err(NotStaged): the texture is neither staged nor queued for
    ///   staging.
    pub fn upload_queue_add(
        &mut self,
        key: AllocationKey,
    ) -> Result<(), CacheError> {
        if !self.upload_queue.is_accumulating() {
            return Err(CacheError::QueueNotStarted);
        }
        let slot = self.registry.slot(key).ok_or(CacheError::UnknownKey(key))?;
        let source = SlotFlags::UPLOADED
            | SlotFlags::TO_UPLOAD
            | SlotFlags::STAGED
            | SlotFlags::TO_STAGE;
        if !self.registry.flags(slot).intersects(source) {
            return Err(CacheError::NotStaged(key));
        }
        self.upload_queue.add(&mut self.registry, key)
    }

    /// Clear the upload batch without submitting it.
    pub fn upload_queue_make_empty(&mut self) {
        self.upload_queue.make_empty(&mut self.registry);
    }

    /// Bind every queued texture's image to upload memory and record the
    /// copies from the stage buffer.
    ///
    /// # Returns
    ///
    /// * Err(UploadFull): not enough room even after evicting. Nothing
    ///   changed, the queue keeps its contents.
    /// * Err(BindImageFail): the images could not be bound. They have been
    ///   recreated, nothing is marked uploaded and the queue keeps its
    ///   contents.
    /// * Err(NotStaged): a queued texture never made it into the stage
    ///   buffer.
    ///
    /// # Safety
    ///
    /// Unsafe because:
    ///   - a frame must have been started with
    ///     [TextureAllocator::begin_frame]
    ///   - images of evicted textures are destroyed, they must not be used by
    ///     commands which are still executing
    pub unsafe fn upload_queue_submit(&mut self) -> Result<(), CacheError> {
        if let Some(slot) = self
            .registry
            .slots_with(SlotFlags::TO_UPLOAD)
            .find(|&slot| {
                !self.registry.flags(slot).contains(SlotFlags::STAGED)
            })
        {
            return Err(CacheError::NotStaged(self.registry.key(slot)));
        }

        let Some(reservation) = self.upload_queue.reserve(&self.registry)?
        else {
            return Ok(());
        };
        let placements = self.upload_queue.place(&self.registry, &reservation);
        let queued_count = placements.len() - reservation.repacked().len();
        let queued = &placements[..queued_count];

        for placement in queued {
            if let Err(error) = self.ensure_image(placement.slot) {
                self.upload_queue.rollback(&self.registry, reservation);
                return Err(error);
            }
        }

        // Moved textures get fresh images. Their old images stay valid until
        // the batch is committed.
        let mut moved_images = vec![];
        let repacked = reservation.repacked().to_vec();
        for placement in &repacked {
            let record = self.registry.record(placement.slot);
            match self.device.create_image(record.width, record.height) {
                Ok(info) => moved_images.push((placement.slot, info.image)),
                Err(error) => {
                    self.discard_images(&moved_images);
                    self.upload_queue.rollback(&self.registry, reservation);
                    return Err(error);
                }
            }
        }
        let image_for = |slot: usize| {
            moved_images
                .iter()
                .find(|&&(moved, _)| moved == slot)
                .map(|&(_, image)| image)
                .unwrap_or(self.registry.record(slot).image)
        };

        let binds = placements
            .iter()
            .map(|placement| ImageBind {
                image: image_for(placement.slot),
                memory_offset: placement.offset,
            })
            .collect::<Vec<_>>();
        let copies = placements
            .iter()
            .map(|placement| {
                let record = self.registry.record(placement.slot);
                ImageCopy {
                    src_offset: record.stage_offset,
                    image: image_for(placement.slot),
                    width: record.width,
                    height: record.height,
                }
            })
            .collect::<Vec<_>>();

        if let Err(error) = self.device.bind_image_memory(&binds) {
            log::warn!(
                "Unable to bind {} images, recreating them: {}",
                binds.len(),
                error
            );
            self.discard_images(&moved_images);
            self.recreate_images(queued);
            self.upload_queue.rollback(&self.registry, reservation);
            return Err(CacheError::BindImageFail);
        }
        if let Err(error) = self.device.record_image_upload(&copies) {
            self.discard_images(&moved_images);
            self.recreate_images(queued);
            self.upload_queue.rollback(&self.registry, reservation);
            return Err(error);
        }

        for &(slot, image) in &moved_images {
            self.release_image(slot);
            self.registry.record_mut(slot).image = image;
        }
        for &slot in reservation.evicted() {
            self.release_image(slot);
        }
        self.upload_queue
            .commit(&mut self.registry, reservation, &placements);
        Ok(())
    }

    /// Start a new frame.
    ///
    /// # Safety
    ///
    /// Unsafe because:
    ///   - the command buffer used two frames ago must be finished
    pub unsafe fn begin_frame(
        &mut self,
        frame_index: u64,
    ) -> Result<(), CacheError> {
        self.registry.remove_flags_everywhere(SlotFlags::TO_DRAW);
        self.device.begin_frame(frame_index)
    }

    /// Finish the frame's transfer commands.
    ///
    /// # Safety
    ///
    /// Unsafe because:
    ///   - the caller must execute the returned secondary command buffer
    ///     before any draw which samples this frame's uploads
    pub unsafe fn end_frame(
        &mut self,
    ) -> Result<vk::CommandBuffer, CacheError> {
        self.device.end_frame()
    }

    /// The key for a registered path.
    pub fn key(&self, path: impl AsRef<Path>) -> Option<AllocationKey> {
        self.keys_by_path.get(path.as_ref()).copied()
    }

    pub fn stage_offset(&self, key: AllocationKey) -> Option<u64> {
        self.resident_slot(key, SlotFlags::STAGED)
            .map(|slot| self.registry.record(slot).stage_offset)
    }

    pub fn upload_offset(&self, key: AllocationKey) -> Option<u64> {
        self.resident_slot(key, SlotFlags::UPLOADED)
            .map(|slot| self.registry.record(slot).upload_offset)
    }

    /// The device image for key, if it is uploaded and ready to sample.
    pub fn image(&self, key: AllocationKey) -> Option<vk::Image> {
        self.resident_slot(key, SlotFlags::UPLOADED)
            .map(|slot| self.registry.record(slot).image)
    }

    pub fn record(&self, key: AllocationKey) -> Option<&TextureRecord> {
        self.registry.slot(key).map(|slot| self.registry.record(slot))
    }

    pub fn flags(&self, key: AllocationKey) -> Option<SlotFlags> {
        self.registry.slot(key).map(|slot| self.registry.flags(slot))
    }

    pub fn weight(&self, key: AllocationKey) -> Option<u8> {
        self.registry.slot(key).map(|slot| self.registry.weight(slot))
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn stage_bitmap(&self) -> &FreeSpaceBitmap {
        self.stage_queue.bitmap()
    }

    pub fn upload_bitmap(&self) -> &FreeSpaceBitmap {
        self.upload_queue.bitmap()
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn decoder(&self) -> &I {
        &self.decoder
    }

    pub fn decoder_mut(&mut self) -> &mut I {
        &mut self.decoder
    }

    /// Destroy every image and the transfer device.
    ///
    /// # Safety
    ///
    /// Unsafe because:
    ///   - the device must be idle
    ///   - no method may be called afterwards
    pub unsafe fn destroy(&mut self) {
        log::debug!("{}", self);
        for slot in 0..self.registry.len() {
            self.release_image(slot);
        }
        self.device.destroy();
    }
}

impl<D: TransferDevice, I: ImageDecoder> std::fmt::Display
    for TextureAllocator<D, I>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = |flags| self.registry.slots_with(flags).count();
        let live_images = (0..self.registry.len())
            .filter(|&slot| {
                self.registry.record(slot).image != vk::Image::null()
            })
            .count();
        f.write_fmt(format_args!(
            indoc!(
                "
                # Texture Allocator

                textures: {} of {}
                live images: {}

                ## Stage Buffer

                staged textures: {}
                used blocks: {} of {}
                granularity: {}

                ## Upload Memory

                uploaded textures: {}
                used blocks: {} of {}
                granularity: {}
                "
            ),
            self.registry.len(),
            self.config.allocation_cap,
            live_images,
            count(SlotFlags::STAGED),
            self.stage_queue.bitmap().used_blocks(),
            self.stage_queue.bitmap().block_count(),
            PrettySize(self.config.stage_granularity),
            count(SlotFlags::UPLOADED),
            self.upload_queue.bitmap().used_blocks(),
            self.upload_queue.bitmap().block_count(),
            PrettySize(self.config.upload_granularity),
        ))
    }
}

// Private API
// -----------

impl<D: TransferDevice, I: ImageDecoder> TextureAllocator<D, I> {
    fn resident_slot(
        &self,
        key: AllocationKey,
        resident: SlotFlags,
    ) -> Option<usize> {
        self.registry
            .slot(key)
            .filter(|&slot| self.registry.flags(slot).contains(resident))
    }

    /// Validate a new image against the upload granularity and the queue
    /// caps.
    fn check_image(
        &self,
        size: u64,
        info: &ImageInfo,
    ) -> Result<(), CacheError> {
        let granularity = self.config.upload_granularity;
        if info.alignment == 0
            || !Integer::is_multiple_of(&granularity, &info.alignment)
        {
            return Err(CacheError::MisalignedBitGranularity(
                granularity,
                info.alignment,
            ));
        }

        let stage_limit =
            self.config.stage_queue_cap.min(self.config.stage_capacity);
        let upload_limit =
            self.config.upload_queue_cap.min(self.config.upload_capacity);
        if align_up(size, self.config.stage_granularity) > stage_limit
            || align_up(info.size_in_bytes, granularity) > upload_limit
        {
            return Err(CacheError::AllocationTooLarge(
                size.max(info.size_in_bytes),
            ));
        }
        Ok(())
    }

    /// Create an image for a texture which lost its image to an eviction.
    unsafe fn ensure_image(&mut self, slot: usize) -> Result<(), CacheError> {
        let record = self.registry.record(slot);
        if record.image != vk::Image::null() {
            return Ok(());
        }
        let info = self.device.create_image(record.width, record.height)?;
        self.registry.record_mut(slot).image = info.image;
        Ok(())
    }

    unsafe fn release_image(&mut self, slot: usize) {
        let record = self.registry.record_mut(slot);
        let image = std::mem::replace(&mut record.image, vk::Image::null());
        if image != vk::Image::null() {
            self.device.destroy_image(image);
        }
    }

    unsafe fn discard_images(&mut self, images: &[(usize, vk::Image)]) {
        for &(_, image) in images {
            self.device.destroy_image(image);
        }
    }

    /// Replace the images of a batch whose bind state is unknown with fresh,
    /// unbound images.
    unsafe fn recreate_images(&mut self, placements: &[Placement]) {
        for placement in placements {
            self.release_image(placement.slot);
            if let Err(error) = self.ensure_image(placement.slot) {
                log::warn!(
                    "Unable to recreate the image for {:?}, it will be \
                     created on the next upload: {}",
                    self.registry.key(placement.slot),
                    error
                );
            }
        }
    }
}

/// Decode a texture into its reserved stage region.
fn decode_into_stage<I: ImageDecoder>(
    decoder: &mut I,
    stage: &mut [u8],
    record: &TextureRecord,
    offset: u64,
) -> Result<(), CacheError> {
    let decoded = decoder.decode(&record.source_path)?;
    if (decoded.width, decoded.height) != (record.width, record.height)
        || decoded.rgba.len() as u64 != record.size
    {
        return Err(CacheError::RuntimeError(anyhow!(
            "{:?} changed from {}x{} to {}x{}",
            record.source_path,
            record.width,
            record.height,
            decoded.width,
            decoded.height
        )));
    }
    let start = offset as usize;
    let destination = stage
        .get_mut(start..start + decoded.rgba.len())
        .ok_or_else(|| {
            anyhow!("The stage memory is smaller than the stage capacity")
        })?;
    destination.copy_from_slice(&decoded.rgba);
    Ok(())
}

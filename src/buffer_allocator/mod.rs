//! Vertex and index data which lives on disk and is staged and uploaded on
//! demand.
//!
//! New allocations are registered with the define protocol:
//!
//! ```text
//! begin_allocation -> continue_allocation* -> submit_allocation
//! ```
//!
//! Every frame, the allocations about to be drawn go through the stage and
//! upload use protocols:
//!
//! ```text
//! stage_queue_begin -> stage_queue_add* -> stage_queue_submit
//! upload_queue_begin -> upload_queue_add* -> upload_queue_submit
//! ```

mod buffer_record;

use {
    crate::{
        config::align_up,
        pretty_wrappers::PrettySize,
        transfer_device::{BufferCopy, TransferDevice},
        use_queue::{Residency, UseQueue},
        AllocationKey, CacheConfig, CacheError, DiskStore, FreeSpaceBitmap,
        SlotFlags, WeightedSlotRegistry,
    },
    anyhow::anyhow,
    ash::vk,
    indoc::indoc,
    std::path::PathBuf,
};

pub use self::buffer_record::BufferRecord;

/// Stages and uploads disk-backed buffer allocations.
pub struct BufferAllocator<D: TransferDevice> {
    config: CacheConfig,
    device: D,
    registry: WeightedSlotRegistry<BufferRecord>,
    disk_store: DiskStore,
    stage_queue: UseQueue,
    upload_queue: UseQueue,

    /// The size of the allocation being defined, if any.
    definition: Option<u64>,

    /// The frame whose transfer commands are being recorded, if any.
    frame: Option<u64>,
}

// Public API
// ----------

impl<D: TransferDevice> BufferAllocator<D> {
    /// Create an allocator which spills allocation payloads to the file at
    /// disk_path.
    ///
    /// # Params
    ///
    /// * `config` - capacities and granularities. Must pass
    ///   [CacheConfig::validate].
    /// * `device` - owns the stage buffer and upload buffer. Both must be at
    ///   least as large as the configured capacities.
    /// * `disk_path` - the backing file. It is created (or truncated) by the
    ///   first call to [BufferAllocator::begin_allocation].
    pub fn new(
        config: CacheConfig,
        device: D,
        disk_path: impl Into<PathBuf>,
    ) -> Result<Self, CacheError> {
        config.validate()?;
        log::trace!("Creating a buffer allocator with\n{}", config);
        Ok(Self {
            device,
            registry: WeightedSlotRegistry::new(config.allocation_cap),
            disk_store: DiskStore::new(disk_path),
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
            definition: None,
            frame: None,
            config,
        })
    }

    /// Start defining a new allocation.
    ///
    /// # Returns
    ///
    /// * Err(AllocatorFull): the allocation cap has been reached.
    /// * Err(QueueInUse): a definition or a use queue is still open, or a
    ///   frame is being recorded. Definitions happen between frames because
    ///   they overwrite stage memory which recorded uploads read from.
    pub fn begin_allocation(&mut self) -> Result<(), CacheError> {
        if self.registry.is_full() {
            return Err(CacheError::AllocatorFull);
        }
        if self.definition.is_some()
            || self.frame.is_some()
            || self.stage_queue.is_accumulating()
            || self.upload_queue.is_accumulating()
        {
            return Err(CacheError::QueueInUse);
        }
        self.disk_store.open_for_append()?;
        self.definition = Some(0);
        Ok(())
    }

    /// Append bytes to the allocation being defined.
    ///
    /// The bytes are assembled at the start of the stage buffer, so anything
    /// staged there loses its stage residency.
    ///
    /// # Returns
    ///
    /// * Err(AllocationTooLarge): the allocation would no longer fit in one
    ///   of the queues. The definition is abandoned.
    ///
    /// # Safety
    ///
    /// Unsafe because:
    ///   - the start of the stage buffer is overwritten, no submitted
    ///     transfer may still be reading it. Uploads recorded by earlier
    ///     frames read it when their command buffers execute, so those
    ///     command buffers must be finished.
    pub unsafe fn continue_allocation(
        &mut self,
        bytes: &[u8],
    ) -> Result<(), CacheError> {
        let size = self.definition.ok_or(CacheError::QueueNotStarted)?;
        let new_size = size + bytes.len() as u64;

        let stage_limit =
            self.config.stage_queue_cap.min(self.config.stage_capacity);
        let upload_limit =
            self.config.upload_queue_cap.min(self.config.upload_capacity);
        if align_up(new_size, self.config.stage_granularity) > stage_limit
            || align_up(new_size, self.config.upload_granularity) > upload_limit
        {
            log::warn!(
                "Abandoned a definition which grew to {}",
                PrettySize(new_size)
            );
            self.definition = None;
            return Err(CacheError::AllocationTooLarge(new_size));
        }

        let blocks = self
            .stage_queue
            .bitmap()
            .blocks_for(align_up(new_size, self.config.stage_granularity));
        self.stage_queue
            .evict_overlapping(&mut self.registry, 0, blocks);

        let scratch = self
            .device
            .stage_memory()
            .get_mut(size as usize..new_size as usize)
            .ok_or_else(|| {
                anyhow!("The stage memory is smaller than the stage capacity")
            })?;
        scratch.copy_from_slice(bytes);
        self.definition = Some(new_size);
        Ok(())
    }

    /// Flush the allocation being defined to the disk store.
    ///
    /// # Returns
    ///
    /// The key for the new allocation. Keys are handed out in creation order.
    pub fn submit_allocation(&mut self) -> Result<AllocationKey, CacheError> {
        let size = self.definition.ok_or(CacheError::QueueNotStarted)?;
        let payload = self
            .device
            .stage_memory()
            .get(..size as usize)
            .ok_or_else(|| {
                anyhow!("The stage memory is smaller than the stage capacity")
            })?;
        let disk_offset = self.disk_store.append(payload)?;
        let key = self.registry.push(BufferRecord {
            size,
            stage_offset: 0,
            upload_offset: 0,
            disk_offset,
        })?;
        self.definition = None;
        log::trace!(
            "Defined {:?} with {} at disk offset {}",
            key,
            PrettySize(size),
            disk_offset
        );
        Ok(key)
    }

    /// Start a stage batch.
    ///
    /// # Returns
    ///
    /// * Err(QueueInUse): the previous batch was not submitted or an
    ///   allocation is being defined in the stage buffer.
    pub fn stage_queue_begin(&mut self) -> Result<(), CacheError> {
        if self.definition.is_some() {
            return Err(CacheError::QueueInUse);
        }
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

    /// Copy every queued allocation from the disk store into the stage
    /// buffer.
    ///
    /// # Returns
    ///
    /// * Err(StageFull): there is not enough room even after evicting every
    ///   allocation which is not needed this frame. Nothing changed, the
    ///   queue keeps its contents.
    /// * Err(RuntimeError): reading the disk store failed. Allocations
    ///   evicted for the batch stay evicted and the queue is emptied.
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
            let record = *self.registry.record(placement.slot);
            let start = placement.offset as usize;
            let end = start + record.size as usize;
            let result = match self.device.stage_memory().get_mut(start..end) {
                Some(destination) => {
                    self.disk_store.read_into(record.disk_offset, destination)
                }
                None => Err(CacheError::RuntimeError(anyhow!(
                    "The stage memory is smaller than the stage capacity"
                ))),
            };
            if let Err(error) = result {
                log::warn!(
                    "Unable to restore {:?} from disk: {}",
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
    /// * Err(NotStaged): the allocation is neither staged nor queued for
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

    /// Record stage to upload copies for every queued allocation.
    ///
    /// Each queued allocation must be staged by now.
    ///
    /// # Returns
    ///
    /// * Err(UploadFull): not enough room even after evicting. Nothing
    ///   changed, the queue keeps its contents.
    /// * Err(NotStaged): a queued allocation never made it into the stage
    ///   buffer. Nothing changed.
    ///
    /// # Safety
    ///
    /// Unsafe because:
    ///   - a frame must have been started with
    ///     [BufferAllocator::begin_frame]
    ///   - the upload regions which are reused must not be read by commands
    ///     which are still executing
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
        let copies = placements
            .iter()
            .map(|placement| {
                let record = self.registry.record(placement.slot);
                BufferCopy {
                    src_offset: record.stage_offset,
                    dst_offset: placement.offset,
                    size: record.size,
                }
            })
            .filter(|copy| copy.size > 0)
            .collect::<Vec<_>>();

        if let Err(error) = self.device.record_buffer_upload(&copies) {
            self.upload_queue.rollback(&self.registry, reservation);
            return Err(error);
        }

        self.upload_queue
            .commit(&mut self.registry, reservation, &placements);
        Ok(())
    }

    /// Start a new frame.
    ///
    /// Nothing requested by earlier frames is protected from eviction
    /// anymore.
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
        self.device.begin_frame(frame_index)?;
        self.frame = Some(frame_index);
        Ok(())
    }

    /// Finish the frame's transfer commands.
    ///
    /// # Safety
    ///
    /// Unsafe because:
    ///   - the caller must execute the returned secondary command buffer
    ///     before any draw which uses this frame's uploads
    pub unsafe fn end_frame(
        &mut self,
    ) -> Result<vk::CommandBuffer, CacheError> {
        self.frame = None;
        self.device.end_frame()
    }

    /// The byte offset of key in the stage buffer, if it is staged.
    pub fn stage_offset(&self, key: AllocationKey) -> Option<u64> {
        self.resident_slot(key, SlotFlags::STAGED)
            .map(|slot| self.registry.record(slot).stage_offset)
    }

    /// The byte offset of key in the upload buffer, if it is uploaded.
    pub fn upload_offset(&self, key: AllocationKey) -> Option<u64> {
        self.resident_slot(key, SlotFlags::UPLOADED)
            .map(|slot| self.registry.record(slot).upload_offset)
    }

    pub fn record(&self, key: AllocationKey) -> Option<&BufferRecord> {
        self.registry.slot(key).map(|slot| self.registry.record(slot))
    }

    pub fn flags(&self, key: AllocationKey) -> Option<SlotFlags> {
        self.registry.slot(key).map(|slot| self.registry.flags(slot))
    }

    pub fn weight(&self, key: AllocationKey) -> Option<u8> {
        self.registry.slot(key).map(|slot| self.registry.weight(slot))
    }

    /// The number of defined allocations.
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

    /// Destroy the transfer device and delete the disk store.
    ///
    /// # Safety
    ///
    /// Unsafe because:
    ///   - the device must be idle
    ///   - no method may be called afterwards
    pub unsafe fn destroy(&mut self) {
        log::debug!("{}", self);
        self.device.destroy();
        if let Err(error) = self.disk_store.remove() {
            log::warn!("{}", error);
        }
    }
}

impl<D: TransferDevice> std::fmt::Display for BufferAllocator<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = |flags| self.registry.slots_with(flags).count();
        f.write_fmt(format_args!(
            indoc!(
                "
                # Buffer Allocator

                allocations: {} of {}
                disk store: {} in {}

                ## Stage Buffer

                staged allocations: {}
                used blocks: {} of {}
                granularity: {}

                ## Upload Buffer

                uploaded allocations: {}
                used blocks: {} of {}
                granularity: {}
                "
            ),
            self.registry.len(),
            self.config.allocation_cap,
            PrettySize(self.disk_store.size_in_bytes()),
            self.disk_store.path().display(),
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

impl<D: TransferDevice> BufferAllocator<D> {
    fn resident_slot(
        &self,
        key: AllocationKey,
        resident: SlotFlags,
    ) -> Option<usize> {
        self.registry
            .slot(key)
            .filter(|&slot| self.registry.flags(slot).contains(resident))
    }
}

#[cfg(test)]
mod test;

//! The accumulate-then-submit protocol shared by the stage and upload queues
//! of every allocator.
//!
//! A queue owns the free-space bitmap of the buffer it fills. Submitting a
//! queue happens in three steps so the owning allocator can copy bytes in
//! between:
//!
//! 1. [UseQueue::reserve] finds one contiguous run for the whole batch,
//!    provisionally evicting low-weight residents when needed. Evicted
//!    residents which fit in the free blocks right after the run are moved
//!    there instead of being dropped.
//! 2. [UseQueue::place] assigns each queued or moved allocation its offset.
//!    The allocator copies payloads to those offsets.
//! 3. [UseQueue::commit] marks the run as used and flips the flags. If the
//!    copy failed, [UseQueue::rollback] restores the bitmap instead.

use crate::{
    config::align_up, AllocationKey, CacheError, FreeSpaceBitmap, SlotFlags,
    WeightedSlotRegistry,
};

/// Weight gained by an allocation each time it is requested.
pub(crate) const HIT_WEIGHT_INCREMENT: u8 = 2;

/// Weight lost by heavier allocations when another allocation is requested.
pub(crate) const HIT_WEIGHT_DECAY: u8 = 1;

/// Allocations carrying any of these flags are needed this frame and are
/// never evicted.
const EVICTION_GUARD: SlotFlags = SlotFlags::TO_DRAW
    .union(SlotFlags::TO_STAGE)
    .union(SlotFlags::TO_UPLOAD);

/// Which buffer a queue fills.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Residency {
    Stage,
    Upload,
}

impl Residency {
    pub fn resident_flag(self) -> SlotFlags {
        match self {
            Residency::Stage => SlotFlags::STAGED,
            Residency::Upload => SlotFlags::UPLOADED,
        }
    }

    pub fn queued_flag(self) -> SlotFlags {
        match self {
            Residency::Stage => SlotFlags::TO_STAGE,
            Residency::Upload => SlotFlags::TO_UPLOAD,
        }
    }

    fn full_error(self) -> CacheError {
        match self {
            Residency::Stage => CacheError::StageFull,
            Residency::Upload => CacheError::UploadFull,
        }
    }
}

/// An allocation record which can be resident in the stage and upload
/// buffers.
pub(crate) trait ResidentRecord {
    /// The byte offset of the record in the given buffer. Only meaningful
    /// while the matching resident flag is set.
    fn offset(&self, residency: Residency) -> u64;

    fn set_offset(&mut self, residency: Residency, offset: u64);

    /// The unaligned number of bytes the record occupies in the given
    /// buffer.
    fn size(&self, residency: Residency) -> u64;
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub(crate) struct QueueTotals {
    pub count: usize,
    pub bytes: u64,
}

/// A run of blocks reserved for a batch, plus the residents evicted to make
/// room for it.
#[derive(Debug)]
pub(crate) struct Reservation {
    first_block: usize,
    block_count: usize,
    evicted: Vec<usize>,

    /// Evicted residents moved into the free blocks after the run.
    repacked: Vec<Placement>,
    repacked_blocks: usize,
}

impl Reservation {
    /// Slots which lose residency if the reservation is committed.
    pub fn evicted(&self) -> &[usize] {
        &self.evicted
    }

    /// Residents which keep their residency at a new offset if the
    /// reservation is committed. Their payloads must be copied again.
    pub fn repacked(&self) -> &[Placement] {
        &self.repacked
    }
}

/// A queued slot and the byte offset assigned to it by a reservation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct Placement {
    pub slot: usize,
    pub offset: u64,
}

pub(crate) struct UseQueue {
    residency: Residency,
    bitmap: FreeSpaceBitmap,
    byte_cap: u64,

    /// None while the queue is available.
    totals: Option<QueueTotals>,
}

impl UseQueue {
    pub fn new(
        residency: Residency,
        capacity: u64,
        granularity: u64,
        byte_cap: u64,
    ) -> Self {
        Self {
            residency,
            bitmap: FreeSpaceBitmap::new(capacity, granularity),
            byte_cap,
            totals: None,
        }
    }

    pub fn bitmap(&self) -> &FreeSpaceBitmap {
        &self.bitmap
    }

    pub fn totals(&self) -> Option<QueueTotals> {
        self.totals
    }

    pub fn is_accumulating(&self) -> bool {
        self.totals.is_some()
    }

    /// Start accumulating a batch.
    pub fn begin(&mut self) -> Result<(), CacheError> {
        if self.totals.is_some() {
            return Err(CacheError::QueueInUse);
        }
        self.totals = Some(QueueTotals::default());
        Ok(())
    }

    /// Request residency for key.
    ///
    /// Keys which are already resident or queued are only marked for drawing
    /// and bumped, so adding the same key repeatedly is harmless.
    pub fn add<R: ResidentRecord>(
        &mut self,
        registry: &mut WeightedSlotRegistry<R>,
        key: AllocationKey,
    ) -> Result<(), CacheError> {
        let granularity = self.bitmap.granularity();
        let residency = self.residency;
        let totals = self.totals.as_mut().ok_or(CacheError::QueueNotStarted)?;
        let slot = registry.slot(key).ok_or(CacheError::UnknownKey(key))?;

        let flags = registry.flags(slot);
        let present = residency.resident_flag() | residency.queued_flag();
        if flags.intersects(present) {
            registry.insert_flags(slot, SlotFlags::TO_DRAW);
            registry.bump(key, HIT_WEIGHT_INCREMENT, HIT_WEIGHT_DECAY);
            return Ok(());
        }

        let aligned_size =
            align_up(registry.record(slot).size(residency), granularity);
        if totals.bytes + aligned_size > self.byte_cap {
            log::warn!(
                "{:?} queue is full, {:?} needs {} more bytes ({} of {} used)",
                residency,
                key,
                aligned_size,
                totals.bytes,
                self.byte_cap
            );
            return Err(CacheError::QueueFull);
        }

        totals.count += 1;
        totals.bytes += aligned_size;
        registry
            .insert_flags(slot, residency.queued_flag() | SlotFlags::TO_DRAW);
        registry.bump(key, HIT_WEIGHT_INCREMENT, HIT_WEIGHT_DECAY);
        log::trace!(
            "Queued {:?} for {:?} ({} bytes)",
            key,
            residency,
            aligned_size
        );
        Ok(())
    }

    /// Forget everything added since [UseQueue::begin] and make the queue
    /// available again.
    pub fn make_empty<R>(&mut self, registry: &mut WeightedSlotRegistry<R>) {
        registry.remove_flags_everywhere(self.residency.queued_flag());
        self.totals = None;
    }

    /// Find room for the accumulated batch.
    ///
    /// # Returns
    ///
    /// * Ok(None): nothing was queued. The queue is available again.
    /// * Ok(Some(reservation)): room was found. Follow with
    ///   [UseQueue::commit] or [UseQueue::rollback].
    /// * Err(StageFull | UploadFull): not even evicting every unused resident
    ///   makes enough contiguous room. The bitmap is unchanged and the queue
    ///   keeps its contents.
    pub fn reserve<R: ResidentRecord>(
        &mut self,
        registry: &WeightedSlotRegistry<R>,
    ) -> Result<Option<Reservation>, CacheError> {
        let totals = self.totals.ok_or(CacheError::QueueNotStarted)?;
        if totals.count == 0 {
            self.totals = None;
            return Ok(None);
        }

        let block_count = self.bitmap.blocks_for(totals.bytes);
        if let Some(first_block) = self.bitmap.find_contiguous_free(block_count)
        {
            return Ok(Some(Reservation {
                first_block,
                block_count,
                evicted: vec![],
                repacked: vec![],
                repacked_blocks: 0,
            }));
        }

        let candidates = registry
            .lowest_first(self.residency.resident_flag(), EVICTION_GUARD)
            .collect::<Vec<usize>>();

        let mut evicted = vec![];
        let mut found = None;
        for slot in candidates {
            let (offset, len) = block_range(
                &self.bitmap,
                self.residency,
                registry.record(slot),
            );
            self.bitmap.mark_free(offset, len);
            evicted.push(slot);
            found = self.bitmap.find_contiguous_free(block_count);
            if found.is_some() {
                break;
            }
        }

        let Some(first_block) = found else {
            for &slot in evicted.iter().rev() {
                let (offset, len) = block_range(
                    &self.bitmap,
                    self.residency,
                    registry.record(slot),
                );
                self.bitmap.mark_used(offset, len);
            }
            log::warn!(
                "Unable to fit {} blocks in the {:?} buffer after trying {} \
                 evictions",
                block_count,
                self.residency,
                evicted.len()
            );
            return Err(self.residency.full_error());
        };

        // Provisional evictions outside of the chosen run keep their
        // residency.
        let run = first_block..first_block + block_count;
        let residency = self.residency;
        evicted.retain(|&slot| {
            let (offset, len) =
                block_range(&self.bitmap, residency, registry.record(slot));
            let overlaps = offset < run.end && run.start < offset + len;
            if !overlaps {
                self.bitmap.mark_used(offset, len);
            }
            overlaps
        });
        let (repacked, repacked_blocks) =
            self.repack(registry, &mut evicted, run.end);

        log::debug!(
            "{:?} batch of {} blocks placed at block {} by evicting {} \
             allocations and moving {}",
            self.residency,
            block_count,
            first_block,
            evicted.len(),
            repacked.len()
        );
        Ok(Some(Reservation {
            first_block,
            block_count,
            evicted,
            repacked,
            repacked_blocks,
        }))
    }

    /// Assign each queued slot its byte offset inside the reserved run, in
    /// slot order. The repacked residents follow the queued slots.
    pub fn place<R: ResidentRecord>(
        &self,
        registry: &WeightedSlotRegistry<R>,
        reservation: &Reservation,
    ) -> Vec<Placement> {
        let granularity = self.bitmap.granularity();
        let mut offset = reservation.first_block as u64 * granularity;
        registry
            .slots_with(self.residency.queued_flag())
            .map(|slot| {
                let placement = Placement { slot, offset };
                offset += align_up(
                    registry.record(slot).size(self.residency),
                    granularity,
                );
                placement
            })
            .chain(reservation.repacked.iter().copied())
            .collect()
    }

    /// Undo the provisional evictions of a reservation. The bitmap is left
    /// exactly as it was before [UseQueue::reserve].
    pub fn rollback<R: ResidentRecord>(
        &mut self,
        registry: &WeightedSlotRegistry<R>,
        reservation: Reservation,
    ) {
        let moved = reservation.repacked.iter().map(|placement| placement.slot);
        for slot in reservation.evicted.iter().copied().chain(moved) {
            let (offset, len) = block_range(
                &self.bitmap,
                self.residency,
                registry.record(slot),
            );
            self.bitmap.mark_used(offset, len);
        }
    }

    /// Give up on a batch whose copies partially overwrote evicted residents.
    /// The evictions are kept, the batch is not committed.
    pub fn abandon<R: ResidentRecord>(
        &mut self,
        registry: &mut WeightedSlotRegistry<R>,
        reservation: Reservation,
    ) {
        let moved = reservation.repacked.iter().map(|placement| placement.slot);
        for slot in reservation.evicted.iter().copied().chain(moved) {
            registry.remove_flags(slot, self.residency.resident_flag());
        }
    }

    /// Make the batch resident.
    pub fn commit<R: ResidentRecord>(
        &mut self,
        registry: &mut WeightedSlotRegistry<R>,
        reservation: Reservation,
        placements: &[Placement],
    ) {
        let resident = self.residency.resident_flag();
        for &slot in &reservation.evicted {
            registry.remove_flags(slot, resident);
        }
        self.bitmap
            .mark_used(reservation.first_block, reservation.block_count);
        if reservation.repacked_blocks > 0 {
            self.bitmap.mark_used(
                reservation.first_block + reservation.block_count,
                reservation.repacked_blocks,
            );
        }
        for placement in placements {
            let record = registry.record_mut(placement.slot);
            record.set_offset(self.residency, placement.offset);
            registry.remove_flags(placement.slot, self.residency.queued_flag());
            registry.insert_flags(placement.slot, resident);
        }
        debug_assert!(self.bitmap.used_blocks() <= self.bitmap.block_count());
        self.totals = None;
    }

    /// Drop residency for every resident whose blocks overlap the range.
    ///
    /// Used when the buffer is written outside of the queue protocol.
    pub fn evict_overlapping<R: ResidentRecord>(
        &mut self,
        registry: &mut WeightedSlotRegistry<R>,
        first_block: usize,
        block_count: usize,
    ) {
        let resident = self.residency.resident_flag();
        let end = first_block + block_count;
        let overlapping = registry
            .slots_with(resident)
            .filter(|&slot| {
                let (offset, len) = block_range(
                    &self.bitmap,
                    self.residency,
                    registry.record(slot),
                );
                offset < end && first_block < offset + len
            })
            .collect::<Vec<usize>>();
        for slot in overlapping {
            let (offset, len) = block_range(
                &self.bitmap,
                self.residency,
                registry.record(slot),
            );
            self.bitmap.mark_free(offset, len);
            registry.remove_flags(slot, resident);
            log::trace!(
                "Evicted {:?} from the {:?} buffer",
                registry.key(slot),
                self.residency
            );
        }
    }
}

// Private API
// -----------

impl UseQueue {
    /// Move evicted residents into the free blocks which start at
    /// first_spare, heaviest first. Slots which fit are removed from
    /// evicted.
    ///
    /// # Returns
    ///
    /// The new placements and the number of blocks they cover.
    fn repack<R: ResidentRecord>(
        &self,
        registry: &WeightedSlotRegistry<R>,
        evicted: &mut Vec<usize>,
        first_spare: usize,
    ) -> (Vec<Placement>, usize) {
        let granularity = self.bitmap.granularity();
        let spare = self.bitmap.run_length_at(first_spare);
        let mut used = 0;
        let mut repacked = vec![];
        if spare == 0 {
            return (repacked, used);
        }

        // the registry keeps heavier slots first
        evicted.sort_unstable();
        evicted.retain(|&slot| {
            // uploads are copied from the stage buffer
            if self.residency == Residency::Upload
                && !registry.flags(slot).contains(SlotFlags::STAGED)
            {
                return true;
            }
            let record = registry.record(slot);
            let (_, len) = block_range(&self.bitmap, self.residency, record);
            if used + len > spare {
                return true;
            }
            repacked.push(Placement {
                slot,
                offset: (first_spare + used) as u64 * granularity,
            });
            used += len;
            false
        });
        (repacked, used)
    }
}

/// The blocks occupied by a resident record.
fn block_range<R: ResidentRecord>(
    bitmap: &FreeSpaceBitmap,
    residency: Residency,
    record: &R,
) -> (usize, usize) {
    (
        bitmap.blocks_for(record.offset(residency)),
        bitmap.blocks_for(align_up(
            record.size(residency),
            bitmap.granularity(),
        )),
    )
}

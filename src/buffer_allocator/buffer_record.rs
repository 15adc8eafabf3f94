use crate::use_queue::{Residency, ResidentRecord};

/// Where a buffer allocation lives.
///
/// The stage and upload offsets are only meaningful while the allocation is
/// STAGED or UPLOADED respectively.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct BufferRecord {
    /// The payload size in bytes.
    pub size: u64,
    pub stage_offset: u64,
    pub upload_offset: u64,

    /// Where the payload starts in the disk store.
    pub disk_offset: u64,
}

impl ResidentRecord for BufferRecord {
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

    fn size(&self, _residency: Residency) -> u64 {
        self.size
    }
}

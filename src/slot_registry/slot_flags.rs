use bitflags::bitflags;

bitflags! {
    /// Residency state of a single allocation.
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
    pub struct SlotFlags: u8 {
        /// Requested by the current frame, never evicted until the next frame.
        const TO_DRAW = 1 << 0;
        /// The payload is resident in the stage buffer.
        const STAGED = 1 << 1;
        /// The payload is resident in upload (device-local) memory.
        const UPLOADED = 1 << 2;
        /// Queued in the current stage batch.
        const TO_STAGE = 1 << 3;
        /// Queued in the current upload batch.
        const TO_UPLOAD = 1 << 4;
    }
}

//! # Overview
//!
//! A flat buffer is managed as a sequence of evenly-sized blocks. One bit per
//! block records whether that block currently backs a resident allocation.
//!
//! ## Terms
//!
//! * Block: `granularity` bytes of the managed buffer.
//! * Run: a contiguous sequence of free blocks.
//!
//! All offsets and lengths taken by the bitmap are measured in blocks.
//! Callers round byte sizes up to the granularity before touching the map.

use crate::pretty_wrappers::{PrettyBitflag, PrettySize};

const WORD_BITS: usize = u64::BITS as usize;

/// Occupancy of a buffer at block granularity. A set bit is a used block.
#[derive(Clone, PartialEq, Eq)]
pub struct FreeSpaceBitmap {
    words: Vec<u64>,
    block_count: usize,
    granularity: u64,
}

// Public API
// ----------

impl FreeSpaceBitmap {
    /// Create a bitmap where every block is free.
    ///
    /// # Params
    ///
    /// * capacity_in_bytes: the size of the managed buffer.
    /// * granularity: the number of bytes represented by each bit.
    ///
    /// # Panic
    ///
    /// Panics if granularity is zero.
    pub fn new(capacity_in_bytes: u64, granularity: u64) -> Self {
        assert!(granularity != 0, "granularity must be non-zero");
        let block_count = (capacity_in_bytes / granularity) as usize;
        Self {
            words: vec![0; block_count.div_ceil(WORD_BITS)],
            block_count,
            granularity,
        }
    }

    /// The number of bytes represented by each block.
    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    /// The total number of blocks in the map.
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// The number of blocks currently marked as used.
    pub fn used_blocks(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// The number of blocks currently free.
    pub fn free_blocks(&self) -> usize {
        self.block_count - self.used_blocks()
    }

    /// Convert a byte offset or size into blocks, rounding down.
    pub fn blocks_for(&self, bytes: u64) -> usize {
        (bytes / self.granularity) as usize
    }

    /// Mark a range of blocks as backing an allocation.
    pub fn mark_used(&mut self, offset: usize, len: usize) {
        self.set_range(offset, len, true);
    }

    /// Return a range of blocks to the free pool.
    pub fn mark_free(&mut self, offset: usize, len: usize) {
        self.set_range(offset, len, false);
    }

    /// Returns true when every block in the range is free.
    pub fn is_free(&self, offset: usize, len: usize) -> bool {
        offset + len <= self.block_count
            && (offset..offset + len).all(|block| !self.bit(block))
    }

    /// Find the first run of at least `min_blocks` free blocks.
    ///
    /// # Returns
    ///
    /// * Some(offset): the first block of the run.
    /// * None: when there isn't enough contiguous space.
    pub fn find_contiguous_free(&self, min_blocks: usize) -> Option<usize> {
        if min_blocks == 0 {
            return Some(0);
        }
        if self.free_blocks() < min_blocks {
            return None;
        }

        let mut run_start = 0;
        let mut run_length = 0;
        let mut block = 0;
        while block < self.block_count {
            let word = self.words[block / WORD_BITS];
            let is_word_start = block % WORD_BITS == 0;

            if is_word_start && word == u64::MAX {
                // A completely used word ends any run.
                run_length = 0;
                block += WORD_BITS;
                continue;
            }

            if is_word_start
                && word == 0
                && block + WORD_BITS <= self.block_count
            {
                if run_length == 0 {
                    run_start = block;
                }
                run_length += WORD_BITS;
                block += WORD_BITS;
            } else {
                if self.bit(block) {
                    run_length = 0;
                } else {
                    if run_length == 0 {
                        run_start = block;
                    }
                    run_length += 1;
                }
                block += 1;
            }

            if run_length >= min_blocks {
                return Some(run_start);
            }
        }
        None
    }

    /// The number of consecutive free blocks starting at offset.
    pub fn run_length_at(&self, offset: usize) -> usize {
        (offset..self.block_count)
            .take_while(|&block| !self.bit(block))
            .count()
    }
}

impl std::fmt::Debug for FreeSpaceBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeSpaceBitmap")
            .field("granularity", &PrettySize(self.granularity))
            .field("block_count", &self.block_count)
            .field("used_blocks", &self.used_blocks())
            .field(
                "words",
                &self
                    .words
                    .iter()
                    .map(|&word| PrettyBitflag(word))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

// Private API
// -----------

impl FreeSpaceBitmap {
    fn bit(&self, block: usize) -> bool {
        self.words[block / WORD_BITS] & (1 << (block % WORD_BITS)) != 0
    }

    fn set_range(&mut self, offset: usize, len: usize, value: bool) {
        assert!(
            offset + len <= self.block_count,
            "range {}..{} is outside of the {} block bitmap",
            offset,
            offset + len,
            self.block_count
        );
        for block in offset..offset + len {
            let mask = 1 << (block % WORD_BITS);
            let word = &mut self.words[block / WORD_BITS];
            if value {
                *word |= mask;
            } else {
                *word &= !mask;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use {super::*, pretty_assertions::assert_eq};

    fn bitmap_from_str(blocks: &str) -> FreeSpaceBitmap {
        let mut bitmap = FreeSpaceBitmap::new(blocks.len() as u64, 1);
        for (index, block) in blocks.chars().enumerate() {
            if block == 'x' {
                bitmap.mark_used(index, 1);
            }
        }
        bitmap
    }

    fn bitmap_to_str(bitmap: &FreeSpaceBitmap) -> String {
        (0..bitmap.block_count())
            .map(|block| if bitmap.bit(block) { 'x' } else { 'f' })
            .collect()
    }

    #[test]
    fn new_bitmap_is_empty() {
        let bitmap = FreeSpaceBitmap::new(1024, 256);
        assert_eq!(bitmap.block_count(), 4);
        assert_eq!(bitmap.used_blocks(), 0);
        assert_eq!(bitmap_to_str(&bitmap), "ffff");
    }

    #[test]
    fn mark_used_and_free() {
        let mut bitmap = FreeSpaceBitmap::new(10, 1);
        bitmap.mark_used(2, 3);
        assert_eq!(bitmap_to_str(&bitmap), "ffxxxfffff");
        assert!(!bitmap.is_free(4, 2));
        assert!(bitmap.is_free(5, 5));
        assert!(!bitmap.is_free(5, 6));

        bitmap.mark_free(3, 1);
        assert_eq!(bitmap_to_str(&bitmap), "ffxfxfffff");
        assert_eq!(bitmap.used_blocks(), 2);
    }

    #[test]
    fn find_contiguous_free() {
        let bitmap = bitmap_from_str("fxxfffxxxxff");
        assert_eq!(bitmap.find_contiguous_free(1), Some(0));
        assert_eq!(bitmap.find_contiguous_free(2), Some(3));
        assert_eq!(bitmap.find_contiguous_free(3), Some(3));
        assert_eq!(bitmap.find_contiguous_free(4), None);
    }

    #[test]
    fn find_contiguous_free_short_circuits_on_total() {
        let bitmap = bitmap_from_str("xxxxxxff");
        assert_eq!(bitmap.find_contiguous_free(3), None);
        assert_eq!(bitmap.find_contiguous_free(2), Some(6));
    }

    #[test]
    fn find_contiguous_free_across_words() {
        let mut bitmap = FreeSpaceBitmap::new(200, 1);
        bitmap.mark_used(0, 60);
        bitmap.mark_used(64, 64);
        bitmap.mark_used(190, 10);

        // The 4 free blocks at the end of the first word are too small, the
        // second word is full, the run starting at 128 is 62 blocks long.
        assert_eq!(bitmap.find_contiguous_free(4), Some(60));
        assert_eq!(bitmap.find_contiguous_free(5), Some(128));
        assert_eq!(bitmap.find_contiguous_free(62), Some(128));
        assert_eq!(bitmap.find_contiguous_free(63), None);
    }

    #[test]
    fn run_length_at() {
        let bitmap = bitmap_from_str("fxxfffxxxxff");
        assert_eq!(bitmap.run_length_at(0), 1);
        assert_eq!(bitmap.run_length_at(1), 0);
        assert_eq!(bitmap.run_length_at(3), 3);
        assert_eq!(bitmap.run_length_at(4), 2);
        assert_eq!(bitmap.run_length_at(10), 2);
    }

    #[test]
    #[should_panic]
    fn mark_used_panics_when_outside_range() {
        let mut bitmap = FreeSpaceBitmap::new(4, 1);
        bitmap.mark_used(2, 3);
    }

    #[test]
    fn smoke_test() {
        let mut bitmap = FreeSpaceBitmap::new(1000, 1);
        let mut runs = vec![];
        for _ in 0..10_000 {
            if let Some(offset) = bitmap.find_contiguous_free(5) {
                bitmap.mark_used(offset, 5);
                runs.push(offset);
            }
        }
        assert_eq!(bitmap.used_blocks(), 1000);

        for offset in runs.drain(0..) {
            bitmap.mark_free(offset, 5);
        }
        assert_eq!(bitmap.used_blocks(), 0);
    }
}

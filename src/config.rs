use {crate::CacheError, indoc::indoc, num::Integer};

/// The sizes and limits which shape a buffer or texture allocator.
///
/// Build one with struct update syntax and let the rest default:
///
/// ```
/// # use ccthw_ash_resource_cache::CacheConfig;
/// let config = CacheConfig {
///     stage_capacity: 1024,
///     stage_granularity: 256,
///     ..CacheConfig::default()
/// };
/// ```
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CacheConfig {
    /// Size of the host-visible stage buffer in bytes.
    pub stage_capacity: u64,

    /// Size of the device-local upload buffer or memory in bytes.
    pub upload_capacity: u64,

    /// Bytes represented by each bit of the stage free-space bitmap.
    pub stage_granularity: u64,

    /// Bytes represented by each bit of the upload free-space bitmap.
    pub upload_granularity: u64,

    /// Maximum aligned bytes which can be added to one stage batch.
    pub stage_queue_cap: u64,

    /// Maximum aligned bytes which can be added to one upload batch.
    pub upload_queue_cap: u64,

    /// Maximum number of allocations the registry can hold.
    pub allocation_cap: usize,

    /// The device's minimum copy offset alignment
    /// (optimalBufferCopyOffsetAlignment).
    pub min_copy_offset_alignment: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stage_capacity: 16 * 1024 * 1024,
            upload_capacity: 64 * 1024 * 1024,
            stage_granularity: 1024,
            upload_granularity: 1024,
            stage_queue_cap: 16 * 1024 * 1024,
            upload_queue_cap: 64 * 1024 * 1024,
            allocation_cap: 1024,
            min_copy_offset_alignment: 4,
        }
    }
}

impl CacheConfig {
    /// Check the granularities against the capacities and the device's copy
    /// alignment.
    ///
    /// Errors here are configuration mistakes. Callers should abort setup
    /// rather than retry.
    pub fn validate(&self) -> Result<(), CacheError> {
        check_granularity(
            self.stage_capacity,
            self.stage_granularity,
            self.min_copy_offset_alignment,
        )?;
        check_granularity(
            self.upload_capacity,
            self.upload_granularity,
            self.min_copy_offset_alignment,
        )
    }
}

impl std::fmt::Display for CacheConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            indoc!(
                "
                stage: {} bytes in {} byte blocks, queue cap {}
                upload: {} bytes in {} byte blocks, queue cap {}
                allocation cap: {}"
            ),
            self.stage_capacity,
            self.stage_granularity,
            self.stage_queue_cap,
            self.upload_capacity,
            self.upload_granularity,
            self.upload_queue_cap,
            self.allocation_cap,
        ))
    }
}

fn check_granularity(
    capacity: u64,
    granularity: u64,
    alignment: u64,
) -> Result<(), CacheError> {
    let is_aligned = granularity.is_power_of_two()
        && alignment != 0
        && Integer::is_multiple_of(&granularity, &alignment)
        && Integer::is_multiple_of(&capacity, &granularity);
    if !is_aligned {
        return Err(CacheError::MisalignedBitGranularity(
            granularity,
            alignment,
        ));
    }
    Ok(())
}

/// Round size up to the next multiple of granularity. Empty allocations
/// still occupy one block so every resident allocation has a distinct range.
pub(crate) fn align_up(size: u64, granularity: u64) -> u64 {
    Integer::next_multiple_of(&size.max(1), &granularity)
}

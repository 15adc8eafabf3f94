#![allow(dead_code)]

use {
    ccthw_ash_resource_cache::{
        AllocationKey, BufferAllocator, CacheConfig, CacheError,
        FakeTransferDevice,
    },
    std::{path::PathBuf, sync::Once},
};

/// Install the test logger. Safe to call from every test.
pub fn setup_logger() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let started = flexi_logger::Logger::try_with_env_or_str("trace")
            .and_then(|logger| logger.start());
        if let Ok(handle) = started {
            // keep logging alive for the whole test binary
            std::mem::forget(handle);
        }
    });
}

/// A per-process path in the temp dir for a disk store.
pub fn disk_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "ccthw_resource_cache_{}_{}.bin",
        name,
        std::process::id()
    ))
}

/// The small allocator used throughout the scenarios: four 256 byte blocks
/// in each buffer.
pub fn small_config() -> CacheConfig {
    CacheConfig {
        stage_capacity: 1024,
        upload_capacity: 1024,
        stage_granularity: 256,
        upload_granularity: 256,
        stage_queue_cap: 2048,
        upload_queue_cap: 2048,
        allocation_cap: 16,
        ..CacheConfig::default()
    }
}

pub type FakeBufferAllocator = BufferAllocator<FakeTransferDevice>;

pub fn buffer_allocator(
    config: CacheConfig,
    disk_path: &PathBuf,
) -> Result<FakeBufferAllocator, CacheError> {
    BufferAllocator::new(config, FakeTransferDevice::new(&config), disk_path)
}

/// Define a new allocation in one go.
pub fn define(
    allocator: &mut FakeBufferAllocator,
    bytes: &[u8],
) -> Result<AllocationKey, CacheError> {
    allocator.begin_allocation()?;
    unsafe { allocator.continue_allocation(bytes)? };
    allocator.submit_allocation()
}

/// Run one frame which stages every key.
pub fn stage_frame(
    allocator: &mut FakeBufferAllocator,
    frame_index: u64,
    keys: &[AllocationKey],
) -> Result<(), CacheError> {
    unsafe {
        allocator.begin_frame(frame_index)?;
        let result = stage_all(allocator, keys);
        allocator.end_frame()?;
        result
    }
}

/// Run one frame which stages and uploads every key.
pub fn draw_frame(
    allocator: &mut FakeBufferAllocator,
    frame_index: u64,
    keys: &[AllocationKey],
) -> Result<(), CacheError> {
    unsafe {
        allocator.begin_frame(frame_index)?;
        let result = stage_all(allocator, keys).and_then(|_| {
            allocator.upload_queue_begin()?;
            for &key in keys {
                allocator.upload_queue_add(key)?;
            }
            allocator.upload_queue_submit()
        });
        allocator.end_frame()?;
        result
    }
}

unsafe fn stage_all(
    allocator: &mut FakeBufferAllocator,
    keys: &[AllocationKey],
) -> Result<(), CacheError> {
    allocator.stage_queue_begin()?;
    for &key in keys {
        allocator.stage_queue_add(key)?;
    }
    allocator.stage_queue_submit()
}

/// A recognizable payload for allocation number seed.
pub fn payload(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| seed.wrapping_mul(31).wrapping_add(i as u8))
        .collect()
}

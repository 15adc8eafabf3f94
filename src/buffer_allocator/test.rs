use {
    super::*,
    crate::FakeTransferDevice,
    pretty_assertions::assert_eq,
    scopeguard::defer,
    std::path::Path,
};

fn config() -> CacheConfig {
    CacheConfig {
        stage_capacity: 1024,
        upload_capacity: 2048,
        stage_granularity: 256,
        upload_granularity: 256,
        stage_queue_cap: 2048,
        upload_queue_cap: 2048,
        allocation_cap: 4,
        ..CacheConfig::default()
    }
}

fn disk_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "buffer_allocator_{}_{}.bin",
        name,
        std::process::id()
    ))
}

fn allocator(
    path: &Path,
) -> Result<BufferAllocator<FakeTransferDevice>, CacheError> {
    let config = config();
    BufferAllocator::new(config, FakeTransferDevice::new(&config), path)
}

fn define(
    allocator: &mut BufferAllocator<FakeTransferDevice>,
    bytes: &[u8],
) -> Result<AllocationKey, CacheError> {
    allocator.begin_allocation()?;
    unsafe { allocator.continue_allocation(bytes)? };
    allocator.submit_allocation()
}

fn stage(
    allocator: &mut BufferAllocator<FakeTransferDevice>,
    keys: &[AllocationKey],
) -> Result<(), CacheError> {
    allocator.stage_queue_begin()?;
    for &key in keys {
        allocator.stage_queue_add(key)?;
    }
    unsafe { allocator.stage_queue_submit() }
}

#[test]
fn begin_allocation_twice_is_queue_in_use() -> Result<(), CacheError> {
    let path = disk_path("begin_twice");
    let cleanup = path.clone();
    defer! { let _ = std::fs::remove_file(&cleanup); }

    let mut allocator = allocator(&path)?;
    allocator.begin_allocation()?;
    assert!(matches!(
        allocator.begin_allocation(),
        Err(CacheError::QueueInUse)
    ));
    assert!(matches!(
        allocator.begin_allocation(),
        Err(CacheError::QueueInUse)
    ));
    Ok(())
}

#[test]
fn begin_allocation_at_capacity_is_allocator_full() -> Result<(), CacheError>
{
    let path = disk_path("allocator_full");
    let cleanup = path.clone();
    defer! { let _ = std::fs::remove_file(&cleanup); }

    let mut allocator = allocator(&path)?;
    for i in 0..4 {
        define(&mut allocator, &[i; 8])?;
    }
    assert!(matches!(
        allocator.begin_allocation(),
        Err(CacheError::AllocatorFull)
    ));
    Ok(())
}

#[test]
fn keys_are_assigned_in_creation_order() -> Result<(), CacheError> {
    let path = disk_path("creation_order");
    let cleanup = path.clone();
    defer! { let _ = std::fs::remove_file(&cleanup); }

    let mut allocator = allocator(&path)?;
    let a = define(&mut allocator, &[1; 10])?;
    let b = define(&mut allocator, &[2; 20])?;
    assert_eq!((a.index(), b.index()), (0, 1));
    assert_eq!(allocator.record(b).map(|record| record.disk_offset), Some(10));
    Ok(())
}

#[test]
fn begin_allocation_during_a_frame_is_queue_in_use() -> Result<(), CacheError>
{
    let path = disk_path("define_in_frame");
    let cleanup = path.clone();
    defer! { let _ = std::fs::remove_file(&cleanup); }

    let mut allocator = allocator(&path)?;
    unsafe { allocator.begin_frame(0)? };
    assert!(matches!(
        allocator.begin_allocation(),
        Err(CacheError::QueueInUse)
    ));
    unsafe { allocator.end_frame()? };
    define(&mut allocator, &[1; 16])?;
    assert_eq!(allocator.len(), 1);
    Ok(())
}

#[test]
fn oversized_definitions_are_abandoned() -> Result<(), CacheError> {
    let path = disk_path("too_large");
    let cleanup = path.clone();
    defer! { let _ = std::fs::remove_file(&cleanup); }

    let mut allocator = allocator(&path)?;
    allocator.begin_allocation()?;
    unsafe {
        allocator.continue_allocation(&[0; 1000])?;
        assert!(matches!(
            allocator.continue_allocation(&[0; 100]),
            Err(CacheError::AllocationTooLarge(1100))
        ));
    }
    assert!(matches!(
        allocator.submit_allocation(),
        Err(CacheError::QueueNotStarted)
    ));
    assert!(allocator.begin_allocation().is_ok());
    Ok(())
}

#[test]
fn defining_evicts_the_start_of_the_stage_buffer() -> Result<(), CacheError> {
    let path = disk_path("define_evicts");
    let cleanup = path.clone();
    defer! { let _ = std::fs::remove_file(&cleanup); }

    let mut allocator = allocator(&path)?;
    let a = define(&mut allocator, &[1; 100])?;
    stage(&mut allocator, &[a])?;
    assert_eq!(allocator.stage_offset(a), Some(0));

    define(&mut allocator, &[2; 10])?;
    assert_eq!(allocator.stage_offset(a), None);
    assert_eq!(allocator.stage_bitmap().used_blocks(), 0);
    Ok(())
}

#[test]
fn oversized_batches_report_stage_full() -> Result<(), CacheError> {
    let path = disk_path("stage_full");
    let cleanup = path.clone();
    defer! { let _ = std::fs::remove_file(&cleanup); }

    let mut allocator = allocator(&path)?;
    let keys = [
        define(&mut allocator, &[1; 300])?,
        define(&mut allocator, &[2; 300])?,
        define(&mut allocator, &[3; 300])?,
    ];
    assert!(matches!(
        stage(&mut allocator, &keys),
        Err(CacheError::StageFull)
    ));
    assert_eq!(allocator.stage_bitmap().used_blocks(), 0);
    for key in keys {
        assert_eq!(allocator.stage_offset(key), None);
    }
    Ok(())
}

#[test]
fn evicted_allocations_move_into_spare_room() -> Result<(), CacheError> {
    let path = disk_path("spare_room");
    let cleanup = path.clone();
    defer! { let _ = std::fs::remove_file(&cleanup); }

    let mut allocator = allocator(&path)?;
    let a = define(&mut allocator, &[1; 256])?;
    let b = define(&mut allocator, &[2; 512])?;
    let e = define(&mut allocator, &[3; 512])?;

    // a lands in block 0 and b in blocks 1-2, b is requested twice
    let batches: [&[AllocationKey]; 4] = [&[a], &[b], &[b], &[e]];
    for (frame, batch) in batches.into_iter().enumerate() {
        unsafe { allocator.begin_frame(frame as u64)? };
        stage(&mut allocator, batch)?;
        unsafe { allocator.end_frame()? };
        if frame == 1 {
            assert_eq!(allocator.stage_offset(a), Some(0));
            assert_eq!(allocator.stage_offset(b), Some(256));
        }
    }

    // making room for e evicts both, b fits in the blocks after e
    assert_eq!(allocator.stage_offset(e), Some(0));
    assert_eq!(allocator.stage_offset(b), Some(512));
    assert_eq!(allocator.stage_offset(a), None);
    assert_eq!(allocator.stage_bitmap().used_blocks(), 4);
    let stage = &allocator.device().stage;
    assert_eq!(&stage[..512], &[3; 512][..]);
    assert_eq!(&stage[512..1024], &[2; 512][..]);
    Ok(())
}

#[test]
fn upload_requires_staging() -> Result<(), CacheError> {
    let path = disk_path("not_staged");
    let cleanup = path.clone();
    defer! { let _ = std::fs::remove_file(&cleanup); }

    let mut allocator = allocator(&path)?;
    let a = define(&mut allocator, &[1; 16])?;
    allocator.upload_queue_begin()?;
    assert!(matches!(
        allocator.upload_queue_add(a),
        Err(CacheError::NotStaged(key)) if key == a
    ));
    Ok(())
}

#[test]
fn upload_submit_rejects_failed_stages() -> Result<(), CacheError> {
    let path = disk_path("stage_failed");
    let cleanup = path.clone();
    defer! { let _ = std::fs::remove_file(&cleanup); }

    let mut allocator = allocator(&path)?;
    let a = define(&mut allocator, &[1; 16])?;

    unsafe { allocator.begin_frame(0)? };
    allocator.stage_queue_begin()?;
    allocator.stage_queue_add(a)?;
    allocator.upload_queue_begin()?;
    allocator.upload_queue_add(a)?;

    // the stage batch is dropped, so there is nothing to upload from
    allocator.stage_queue_make_empty();
    assert!(matches!(
        unsafe { allocator.upload_queue_submit() },
        Err(CacheError::NotStaged(_))
    ));
    assert_eq!(allocator.upload_bitmap().used_blocks(), 0);
    Ok(())
}

#[test]
fn uploads_copy_the_staged_bytes() -> Result<(), CacheError> {
    let path = disk_path("upload_bytes");
    let cleanup = path.clone();
    defer! { let _ = std::fs::remove_file(&cleanup); }

    let mut allocator = allocator(&path)?;
    let a = define(&mut allocator, &[7; 300])?;
    let b = define(&mut allocator, &[9; 20])?;

    unsafe {
        allocator.begin_frame(0)?;
        allocator.stage_queue_begin()?;
        allocator.stage_queue_add(a)?;
        allocator.stage_queue_add(b)?;
        allocator.upload_queue_begin()?;
        allocator.upload_queue_add(a)?;
        allocator.upload_queue_add(b)?;
        allocator.stage_queue_submit()?;
        allocator.upload_queue_submit()?;
        allocator.end_frame()?;
    }

    let upload_a = allocator.upload_offset(a).unwrap() as usize;
    let upload_b = allocator.upload_offset(b).unwrap() as usize;
    let device = allocator.device();
    assert_eq!(&device.upload[upload_a..upload_a + 300], &[7; 300][..]);
    assert_eq!(&device.upload[upload_b..upload_b + 20], &[9; 20][..]);
    assert_eq!(device.buffer_copies.len(), 2);
    assert_eq!(
        allocator.flags(a),
        Some(SlotFlags::STAGED | SlotFlags::UPLOADED | SlotFlags::TO_DRAW)
    );
    Ok(())
}

#[test]
fn begin_frame_clears_to_draw() -> Result<(), CacheError> {
    let path = disk_path("clears_to_draw");
    let cleanup = path.clone();
    defer! { let _ = std::fs::remove_file(&cleanup); }

    let mut allocator = allocator(&path)?;
    let a = define(&mut allocator, &[1; 16])?;
    stage(&mut allocator, &[a])?;
    assert_eq!(
        allocator.flags(a),
        Some(SlotFlags::STAGED | SlotFlags::TO_DRAW)
    );

    unsafe {
        allocator.begin_frame(1)?;
        allocator.end_frame()?;
    }
    assert_eq!(allocator.flags(a), Some(SlotFlags::STAGED));
    Ok(())
}

#[test]
fn the_report_names_the_disk_store() -> Result<(), CacheError> {
    let path = disk_path("report");
    let cleanup = path.clone();
    defer! { let _ = std::fs::remove_file(&cleanup); }

    let mut allocator = allocator(&path)?;
    define(&mut allocator, &[1; 300])?;
    let report = allocator.to_string();
    assert!(report.contains(&format!("in {}", path.display())));
    assert!(report.contains("allocations: 1 of 4"));
    Ok(())
}

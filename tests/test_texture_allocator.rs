//! Textures decoded from real image files and uploaded through the fake
//! transfer device.

use {
    anyhow::{Context, Result},
    assert2::check,
    ccthw_ash_resource_cache::{
        AllocationKey, CacheConfig, CacheError, FakeTransferDevice,
        FileImageDecoder, TextureAllocator,
    },
    scopeguard::defer,
    std::path::{Path, PathBuf},
};

mod common;

type Allocator = TextureAllocator<FakeTransferDevice, FileImageDecoder>;

/// Write a solid color PNG into a fresh directory under the temp dir.
fn write_png(
    dir: &Path,
    name: &str,
    width: u32,
    height: u32,
    color: [u8; 4],
) -> Result<PathBuf> {
    let path = dir.join(name);
    image::RgbaImage::from_pixel(width, height, image::Rgba(color))
        .save(&path)
        .with_context(|| format!("unable to write {:?}", path))?;
    Ok(path)
}

fn test_dir(name: &str) -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!(
        "ccthw_resource_cache_{}_{}",
        name,
        std::process::id()
    ));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn allocator() -> Result<Allocator, CacheError> {
    let config = CacheConfig {
        stage_capacity: 2048,
        upload_capacity: 2048,
        ..common::small_config()
    };
    TextureAllocator::new(
        config,
        FakeTransferDevice::new(&config),
        FileImageDecoder,
    )
}

unsafe fn draw(
    allocator: &mut Allocator,
    frame_index: u64,
    keys: &[AllocationKey],
) -> Result<(), CacheError> {
    allocator.begin_frame(frame_index)?;
    allocator.stage_queue_begin()?;
    allocator.upload_queue_begin()?;
    for &key in keys {
        allocator.stage_queue_add(key)?;
        allocator.upload_queue_add(key)?;
    }
    let result = allocator
        .stage_queue_submit()
        .and_then(|_| allocator.upload_queue_submit());
    allocator.end_frame()?;
    result
}

#[test]
fn repeated_paths_share_one_texture() -> Result<()> {
    common::setup_logger();
    let dir = test_dir("dedupe")?;
    let cleanup = dir.clone();
    defer! { let _ = std::fs::remove_dir_all(&cleanup); }

    let red = write_png(&dir, "red.png", 8, 8, [255, 0, 0, 255])?;
    let mut allocator = allocator()?;

    let mut weights = vec![];
    let key = unsafe { allocator.add_texture(&red)? };
    for _ in 0..4 {
        let again = unsafe { allocator.add_texture(&red)? };
        check!(again == key);
        weights.push(allocator.weight(key).unwrap_or(0));
    }
    check!(allocator.len() == 1);
    check!(allocator.device().images_created == 1);
    check!(weights.windows(2).all(|pair| pair[0] < pair[1]));
    Ok(())
}

#[test]
fn decoded_pixels_reach_the_image() -> Result<()> {
    common::setup_logger();
    let dir = test_dir("pixels")?;
    let cleanup = dir.clone();
    defer! { let _ = std::fs::remove_dir_all(&cleanup); }

    let red = write_png(&dir, "red.png", 8, 8, [255, 0, 0, 255])?;
    let blue = write_png(&dir, "blue.png", 4, 16, [0, 0, 255, 128])?;
    let mut allocator = allocator()?;

    let red_key = unsafe { allocator.add_texture(&red)? };
    let blue_key = unsafe { allocator.add_texture(&blue)? };
    unsafe { draw(&mut allocator, 0, &[red_key, blue_key])? };

    let device = allocator.device();
    let red_image = allocator.image(red_key).context("red is not uploaded")?;
    let blue_image =
        allocator.image(blue_key).context("blue is not uploaded")?;
    check!(device.images[&red_image].pixels == [255_u8, 0, 0, 255].repeat(64));
    check!(device.images[&blue_image].pixels == [0_u8, 0, 255, 128].repeat(64));
    check!(
        allocator.upload_offset(red_key) != allocator.upload_offset(blue_key)
    );
    Ok(())
}

#[test]
fn failed_binds_report_bind_image_fail() -> Result<()> {
    common::setup_logger();
    let dir = test_dir("bind_fail")?;
    let cleanup = dir.clone();
    defer! { let _ = std::fs::remove_dir_all(&cleanup); }

    let a = write_png(&dir, "a.png", 8, 8, [1, 2, 3, 4])?;
    let b = write_png(&dir, "b.png", 8, 8, [5, 6, 7, 8])?;
    let mut allocator = allocator()?;
    let keys =
        unsafe { [allocator.add_texture(&a)?, allocator.add_texture(&b)?] };

    allocator.device_mut().fail_next_bind = true;
    let result = unsafe { draw(&mut allocator, 0, &keys) };
    check!(matches!(result, Err(CacheError::BindImageFail)));
    for key in keys {
        check!(allocator.image(key) == None);
    }
    check!(allocator.upload_bitmap().used_blocks() == 0);

    // the staged pixels survive, so the next frame can retry
    allocator.upload_queue_make_empty();
    unsafe { draw(&mut allocator, 1, &keys)? };
    for key in keys {
        check!(allocator.image(key).is_some());
    }
    Ok(())
}

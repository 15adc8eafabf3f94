use {
    super::{DecodedImage, ImageDecoder},
    crate::CacheError,
    anyhow::Context,
    std::path::Path,
};

/// Decodes PNG and JPEG files from disk.
#[derive(Debug, Copy, Clone, Default)]
pub struct FileImageDecoder;

impl ImageDecoder for FileImageDecoder {
    fn dimensions(&mut self, path: &Path) -> Result<(u32, u32), CacheError> {
        let dimensions = image::image_dimensions(path).with_context(|| {
            format!("Unable to read the dimensions of {:?}", path)
        })?;
        Ok(dimensions)
    }

    fn decode(&mut self, path: &Path) -> Result<DecodedImage, CacheError> {
        let rgba = image::open(path)
            .with_context(|| format!("Unable to decode {:?}", path))?
            .to_rgba8();
        log::trace!(
            "Decoded {:?} ({}x{})",
            path,
            rgba.width(),
            rgba.height()
        );
        Ok(DecodedImage {
            width: rgba.width(),
            height: rgba.height(),
            rgba: rgba.into_raw(),
        })
    }
}

#[cfg(test)]
mod test {
    use {super::*, pretty_assertions::assert_eq, scopeguard::defer};

    #[test]
    fn decode_png_as_rgba() -> Result<(), CacheError> {
        let path = std::env::temp_dir().join(format!(
            "file_image_decoder_{}.png",
            std::process::id()
        ));
        let cleanup_path = path.clone();
        defer! { let _ = std::fs::remove_file(&cleanup_path); }

        let pixels = image::RgbImage::from_fn(3, 2, |x, y| {
            image::Rgb([x as u8, y as u8, 7])
        });
        pixels.save(&path).context("unable to write the test image")?;

        let mut decoder = FileImageDecoder;
        assert_eq!(decoder.dimensions(&path)?, (3, 2));

        let decoded = decoder.decode(&path)?;
        assert_eq!((decoded.width, decoded.height), (3, 2));
        assert_eq!(decoded.rgba.len(), 24);
        assert_eq!(&decoded.rgba[4..8], &[1, 0, 7, 255]);
        Ok(())
    }

    #[test]
    fn missing_files_are_runtime_errors() {
        let mut decoder = FileImageDecoder;
        let result = decoder.decode(Path::new("/does/not/exist.png"));
        assert!(matches!(result, Err(CacheError::RuntimeError(_))));
    }
}

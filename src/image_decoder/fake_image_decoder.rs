use {
    super::{DecodedImage, ImageDecoder},
    crate::CacheError,
    anyhow::anyhow,
    std::{
        collections::HashMap,
        path::{Path, PathBuf},
    },
};

/// An in-memory decoder which serves registered images and counts how often
/// it is asked for them.
#[derive(Debug, Default)]
pub struct FakeImageDecoder {
    images: HashMap<PathBuf, DecodedImage>,

    /// The number of calls to [ImageDecoder::dimensions].
    pub dimension_reads: usize,

    /// The number of calls to [ImageDecoder::decode].
    pub decodes: usize,

    /// When set, every decode fails.
    pub fail_decodes: bool,
}

impl FakeImageDecoder {
    /// Register a solid image at path where every byte is fill.
    pub fn insert(
        &mut self,
        path: impl Into<PathBuf>,
        width: u32,
        height: u32,
        fill: u8,
    ) {
        let size = DecodedImage::size_in_bytes(width, height) as usize;
        self.insert_image(
            path,
            DecodedImage {
                width,
                height,
                rgba: vec![fill; size],
            },
        );
    }

    pub fn insert_image(
        &mut self,
        path: impl Into<PathBuf>,
        image: DecodedImage,
    ) {
        self.images.insert(path.into(), image);
    }

    fn get(&self, path: &Path) -> Result<&DecodedImage, CacheError> {
        self.images.get(path).ok_or_else(|| {
            CacheError::RuntimeError(anyhow!("No fake image at {:?}", path))
        })
    }
}

impl ImageDecoder for FakeImageDecoder {
    fn dimensions(&mut self, path: &Path) -> Result<(u32, u32), CacheError> {
        self.dimension_reads += 1;
        let image = self.get(path)?;
        Ok((image.width, image.height))
    }

    fn decode(&mut self, path: &Path) -> Result<DecodedImage, CacheError> {
        self.decodes += 1;
        if self.fail_decodes {
            return Err(CacheError::RuntimeError(anyhow!(
                "Simulated decode failure for {:?}",
                path
            )));
        }
        self.get(path).cloned()
    }
}

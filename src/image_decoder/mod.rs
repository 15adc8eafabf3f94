mod fake_image_decoder;
mod file_image_decoder;

use {
    crate::{pretty_wrappers::PrettySize, CacheError},
    std::path::Path,
};

pub use self::{
    fake_image_decoder::FakeImageDecoder, file_image_decoder::FileImageDecoder,
};

/// A decoded image with tightly packed 8-bit RGBA pixels.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl DecodedImage {
    /// The number of bytes in a tightly packed RGBA image with these
    /// dimensions.
    pub fn size_in_bytes(width: u32, height: u32) -> u64 {
        width as u64 * height as u64 * 4
    }
}

impl std::fmt::Debug for DecodedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("rgba", &PrettySize(self.rgba.len() as u64))
            .finish()
    }
}

/// Turns an image file into RGBA pixels.
///
/// Textures are never kept around on the host. Whenever a texture has to be
/// staged again after eviction it is decoded again from its source path.
pub trait ImageDecoder {
    /// Read just enough of the file to learn its dimensions.
    fn dimensions(&mut self, path: &Path) -> Result<(u32, u32), CacheError>;

    /// Decode the whole file.
    fn decode(&mut self, path: &Path) -> Result<DecodedImage, CacheError>;
}

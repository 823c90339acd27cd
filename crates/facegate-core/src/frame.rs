//! Photo decoding for uploaded registration images.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PhotoError {
    #[error("empty image payload")]
    Empty,
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

/// A decoded photo as interleaved RGB, row-major, 3 bytes per pixel.
#[derive(Clone, Debug)]
pub struct PhotoFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl PhotoFrame {
    /// Decode uploaded bytes in any common raster format (JPEG, PNG, ...).
    pub fn decode(bytes: &[u8]) -> Result<Self, PhotoError> {
        if bytes.is_empty() {
            return Err(PhotoError::Empty);
        }
        let rgb = image::load_from_memory(bytes)?.to_rgb8();
        let (width, height) = rgb.dimensions();
        Ok(Self {
            data: rgb.into_raw(),
            width,
            height,
        })
    }
}

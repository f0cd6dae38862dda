use std::io::Cursor;

use image::error::{LimitError, LimitErrorKind};
use image::{ImageError, ImageReader, Limits};

use redecor_contracts::errors::ErrorKind;

use crate::raster::CanonicalImage;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("uploaded file is empty")]
    Empty,

    #[error("uploaded file is {actual} bytes, limit is {limit}")]
    TooLarge { actual: usize, limit: usize },

    #[error("image dimensions exceed the {limit}px per-side limit")]
    Dimensions { limit: u32 },

    #[error("invalid image file, please upload a valid JPG or PNG: {0}")]
    Unsupported(#[source] ImageError),
}

impl DecodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Empty | Self::TooLarge { .. } | Self::Dimensions { .. } => {
                ErrorKind::InvalidInput
            }
            Self::Unsupported(_) => ErrorKind::UnsupportedFormat,
        }
    }
}

/// Validates raw upload bytes and normalizes them to RGB.
#[derive(Debug, Clone, Copy)]
pub struct ImageDecoder {
    max_bytes: usize,
    max_side: u32,
}

impl Default for ImageDecoder {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

impl ImageDecoder {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            max_side: 8192,
        }
    }

    /// Refuses images wider or taller than `max_side` before allocating pixels.
    pub fn with_max_side(mut self, max_side: u32) -> Self {
        self.max_side = max_side;
        self
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<CanonicalImage, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }
        if bytes.len() > self.max_bytes {
            return Err(DecodeError::TooLarge {
                actual: bytes.len(),
                limit: self.max_bytes,
            });
        }
        let mut limits = Limits::default();
        limits.max_image_width = Some(self.max_side);
        limits.max_image_height = Some(self.max_side);

        let mut reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|err| DecodeError::Unsupported(ImageError::IoError(err)))?;
        reader.limits(limits);
        let decoded = reader.decode().map_err(|err| match err {
            ImageError::Limits(limit) if is_dimension_limit(&limit) => DecodeError::Dimensions {
                limit: self.max_side,
            },
            other => DecodeError::Unsupported(other),
        })?;
        Ok(CanonicalImage::new(decoded.to_rgb8()))
    }
}

fn is_dimension_limit(err: &LimitError) -> bool {
    matches!(err.kind(), LimitErrorKind::DimensionError)
}

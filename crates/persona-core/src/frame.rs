//! Frame type, decoding, and the preprocessing collaborator.

use image::imageops::FilterType;
use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;

/// Side length the enhancement pipeline resizes frames to before detection.
pub const DEFAULT_FRAME_SIZE: u32 = 224;

/// One decoded RGB frame submitted for detection.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Position in the request, used in logs and results.
    pub index: usize,
    pub image: Arc<RgbImage>,
}

#[derive(Error, Debug)]
#[error("frame {index}: {source}")]
pub struct DecodeError {
    pub index: usize,
    #[source]
    pub source: image::ImageError,
}

impl Frame {
    pub fn new(index: usize, image: RgbImage) -> Self {
        Self {
            index,
            image: Arc::new(image),
        }
    }

    /// Decode encoded image bytes (JPEG, PNG, ...) into an RGB frame.
    pub fn decode(index: usize, bytes: &[u8]) -> Result<Self, DecodeError> {
        let image = image::load_from_memory(bytes)
            .map_err(|source| DecodeError { index, source })?
            .to_rgb8();
        Ok(Self::new(index, image))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Normalizes a raw frame before detection. Must be deterministic and free of
/// side effects.
pub trait Preprocessor: Send + Sync {
    fn normalize(&self, frame: Frame) -> Frame;
}

/// Leaves frames untouched.
pub struct Passthrough;

impl Preprocessor for Passthrough {
    fn normalize(&self, frame: Frame) -> Frame {
        frame
    }
}

/// Lanczos resize to a fixed size.
pub struct Resize {
    pub width: u32,
    pub height: u32,
}

impl Resize {
    pub fn square(size: u32) -> Self {
        Self {
            width: size,
            height: size,
        }
    }
}

impl Preprocessor for Resize {
    fn normalize(&self, frame: Frame) -> Frame {
        if frame.width() == self.width && frame.height() == self.height {
            return frame;
        }
        if frame.width() == 0 || frame.height() == 0 {
            return frame;
        }
        let resized =
            image::imageops::resize(frame.image.as_ref(), self.width, self.height, FilterType::Lanczos3);
        Frame::new(frame.index, resized)
    }
}

//! On-disk scratch copies of frames for backends that consume file paths.

use image::ImageFormat;
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::frame::Frame;

#[derive(Error, Debug)]
pub enum ScratchError {
    #[error("scratch file: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode frame: {0}")]
    Encode(#[from] image::ImageError),
}

/// A frame written to a temporary PNG. The file is removed when this value is
/// dropped, including when a timed-out backend future is cancelled.
#[derive(Debug)]
pub struct ScratchFile {
    file: NamedTempFile,
}

impl ScratchFile {
    /// Encodes and writes synchronously; async callers run this on the blocking pool.
    pub fn write(frame: &Frame) -> Result<Self, ScratchError> {
        let file = tempfile::Builder::new()
            .prefix(&format!("persona-frame-{}-", frame.index))
            .suffix(".png")
            .tempfile()?;
        frame.image.save_with_format(file.path(), ImageFormat::Png)?;
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

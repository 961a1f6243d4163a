use std::path::Path;

use thiserror::Error;

use crate::frame::{Dimensions, Frame};

#[derive(Debug, Error)]
pub enum CacheLoadError {
    #[error("failed to read media: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to decode media: {0}")]
    Decode(#[from] image::ImageError),
    #[error("decode task failed: {0}")]
    Task(String),
}

/// Turns an image file into a ready-to-display frame. Called from blocking
/// worker threads.
pub trait MediaDecoder: Send + Sync + 'static {
    fn decode_image(&self, path: &Path) -> Result<Frame, CacheLoadError>;
}

/// Decodes with the `image` crate and scales to fit the display.
pub struct ImageDecoder {
    target: Dimensions,
}

impl ImageDecoder {
    pub fn new(target: Dimensions) -> Self {
        Self { target }
    }
}

impl MediaDecoder for ImageDecoder {
    fn decode_image(&self, path: &Path) -> Result<Frame, CacheLoadError> {
        let image = image::ImageReader::open(path)?
            .with_guessed_format()?
            .decode()?;
        Ok(Frame::fit_image(&image, self.target))
    }
}

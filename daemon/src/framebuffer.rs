//! The SPI panel behind a Linux framebuffer device.

use std::path::PathBuf;

use async_trait::async_trait;
use log::{error, info};
use pocketcam::pipeline::{Display, DisplayError};
use pocketcam::{Dimensions, Frame};

pub struct Framebuffer {
    path: PathBuf,
    backlight_path: PathBuf,
    dimensions: Dimensions,
}

impl Framebuffer {
    pub fn new(path: impl Into<PathBuf>, backlight_path: impl Into<PathBuf>, dimensions: Dimensions) -> Self {
        Self {
            path: path.into(),
            backlight_path: backlight_path.into(),
            dimensions,
        }
    }
}

#[async_trait]
impl Display for Framebuffer {
    fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    async fn present(&mut self, frame: Frame) -> Result<(), DisplayError> {
        if frame.dimensions() != self.dimensions {
            return Err(DisplayError::SizeMismatch {
                expected: self.dimensions,
                actual: frame.dimensions(),
            });
        }
        tokio::fs::write(&self.path, frame.to_rgb565_le()).await?;
        Ok(())
    }

    async fn set_backlight(&mut self, on: bool) -> Result<(), DisplayError> {
        info!("turning backlight {}", if on { "on" } else { "off" });
        // bl_power is 0 for on
        let value = if on { "0" } else { "1" };
        if let Err(e) = tokio::fs::write(&self.backlight_path, value).await {
            error!(
                "failed to write backlight {}: {e}",
                self.backlight_path.display()
            );
            return Err(e.into());
        }
        Ok(())
    }
}

//! The camera sensor as seen by the viewfinder.
//!
//! The sensor driver can't be reconfigured while a frame read is in flight,
//! so every call goes through [SharedCamera], an async mutex held for the
//! whole request or reconfiguration.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use embedded_graphics::pixelcolor::Rgb888;
use embedded_graphics::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::frame::{Dimensions, Frame};

/// Full sensor size of the IMX477.
pub const SENSOR_SIZE: Dimensions = Dimensions::new(4056, 3040);

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("camera I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("camera backend failed: {0}")]
    Backend(String),
    #[error("camera image could not be processed: {0}")]
    Image(#[from] image::ImageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamPurpose {
    Preview,
    Still,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StillFormat {
    Png,
    Jpeg,
}

impl StillFormat {
    pub fn extension(self) -> &'static str {
        match self {
            StillFormat::Png => "png",
            StillFormat::Jpeg => "jpg",
        }
    }

    pub fn image_format(self) -> image::ImageFormat {
        match self {
            StillFormat::Png => image::ImageFormat::Png,
            StillFormat::Jpeg => image::ImageFormat::Jpeg,
        }
    }
}

/// A sensor output configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeDescriptor {
    pub purpose: StreamPurpose,
    pub size: Dimensions,
}

impl ModeDescriptor {
    pub fn preview(size: Dimensions) -> Self {
        Self {
            purpose: StreamPurpose::Preview,
            size,
        }
    }

    pub fn still(size: Dimensions) -> Self {
        Self {
            purpose: StreamPurpose::Still,
            size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Rect([u32; 4]),
}

pub type Controls = BTreeMap<String, ControlValue>;
pub type Metadata = BTreeMap<String, f64>;

#[derive(Debug, Clone)]
pub struct Capture {
    pub frame: Frame,
    pub metadata: Metadata,
}

#[async_trait]
pub trait Camera: Send {
    async fn configure(&mut self, mode: &ModeDescriptor) -> Result<(), CameraError>;
    async fn set_controls(&mut self, controls: &Controls) -> Result<(), CameraError>;
    async fn capture_request(&mut self) -> Result<Capture, CameraError>;
    async fn switch_mode(&mut self, mode: &ModeDescriptor) -> Result<(), CameraError>;
}

/// A camera behind its reconfiguration lock.
pub type SharedCamera = Arc<Mutex<Box<dyn Camera>>>;

pub fn shared(camera: impl Camera + 'static) -> SharedCamera {
    Arc::new(Mutex::new(Box::new(camera)))
}

/// Sensor crop for a digital zoom factor, as `[x, y, width, height]`.
///
/// Zoom is applied to the centred square region of the sensor so the
/// preview stays square on the panel.
pub fn scaler_crop(zoom: f64) -> [u32; 4] {
    let square = SENSOR_SIZE.height;
    let x_base = (SENSOR_SIZE.width - square) / 2;
    let side = (square as f64 / zoom.max(1.0)).round() as u32;
    let inset = (square - side) / 2;
    [x_base + inset, inset, side, side]
}

/// Draws moving colour bars. Used when no sensor is attached.
pub struct TestPattern {
    size: Dimensions,
    tick: u32,
    controls: Controls,
}

impl TestPattern {
    pub fn new() -> Self {
        Self {
            size: Dimensions::new(240, 240),
            tick: 0,
            controls: Controls::new(),
        }
    }

    pub fn controls(&self) -> &Controls {
        &self.controls
    }
}

impl Default for TestPattern {
    fn default() -> Self {
        Self::new()
    }
}

const BARS: [Rgb888; 6] = [
    Rgb888::WHITE,
    Rgb888::YELLOW,
    Rgb888::CYAN,
    Rgb888::GREEN,
    Rgb888::MAGENTA,
    Rgb888::RED,
];

#[async_trait]
impl Camera for TestPattern {
    async fn configure(&mut self, mode: &ModeDescriptor) -> Result<(), CameraError> {
        self.size = mode.size;
        Ok(())
    }

    async fn set_controls(&mut self, controls: &Controls) -> Result<(), CameraError> {
        self.controls
            .extend(controls.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn capture_request(&mut self) -> Result<Capture, CameraError> {
        self.tick = self.tick.wrapping_add(1);
        let mut frame = Frame::new(self.size);
        let bar_width = (self.size.width / BARS.len() as u32).max(1);
        for x in 0..self.size.width {
            let bar = ((x + self.tick) / bar_width) as usize % BARS.len();
            for y in 0..self.size.height {
                frame.set_pixel(x, y, BARS[bar]);
            }
        }
        let mut metadata = Metadata::new();
        metadata.insert("ExposureTime".to_string(), 10_000.0);
        metadata.insert("AnalogueGain".to_string(), 1.0);
        metadata.insert("FocusFoM".to_string(), (self.tick % 100) as f64);
        Ok(Capture { frame, metadata })
    }

    async fn switch_mode(&mut self, mode: &ModeDescriptor) -> Result<(), CameraError> {
        self.configure(mode).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaler_crop_bounds() {
        assert_eq!(scaler_crop(1.0), [508, 0, 3040, 3040]);
        let [x, y, w, h] = scaler_crop(2.0);
        assert_eq!((w, h), (1520, 1520));
        assert_eq!((x, y), (508 + 760, 760));
        // zoom below 1 is clamped
        assert_eq!(scaler_crop(0.5), scaler_crop(1.0));
    }

    #[tokio::test]
    async fn test_pattern_follows_configuration() {
        let camera = shared(TestPattern::new());
        let mut cam = camera.lock().await;
        cam.configure(&ModeDescriptor::preview(Dimensions::new(12, 8)))
            .await
            .unwrap();
        let capture = cam.capture_request().await.unwrap();
        assert_eq!(capture.frame.dimensions(), Dimensions::new(12, 8));
        assert!(capture.metadata.contains_key("FocusFoM"));
    }

    #[test]
    fn test_control_value_json() {
        let mut controls = Controls::new();
        controls.insert("ScalerCrop".to_string(), ControlValue::Rect([1, 2, 3, 4]));
        controls.insert("Brightness".to_string(), ControlValue::Float(0.25));
        let json = serde_json::to_string(&controls).unwrap();
        assert_eq!(json, r#"{"Brightness":0.25,"ScalerCrop":[1,2,3,4]}"#);
    }
}

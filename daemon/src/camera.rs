//! The sensor driven through `rpicam-still`.
//!
//! Each request runs the tool once and decodes the PNG it writes to stdout.
//! Per-frame metadata comes back through a JSON side file.

use std::path::PathBuf;

use async_trait::async_trait;
use log::{debug, warn};
use pocketcam::Frame;
use pocketcam::camera::{
    Camera, CameraError, Capture, ControlValue, Controls, Metadata, ModeDescriptor, SENSOR_SIZE,
};
use tokio::process::Command;

pub struct RpicamCamera {
    command: String,
    mode: Option<ModeDescriptor>,
    controls: Controls,
    metadata_path: PathBuf,
}

impl RpicamCamera {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            mode: None,
            controls: Controls::new(),
            metadata_path: std::env::temp_dir()
                .join(format!("pocketcam-{}-metadata.json", std::process::id())),
        }
    }
}

fn control_args(controls: &Controls) -> Vec<String> {
    let mut args = Vec::new();
    for (name, value) in controls {
        match (name.as_str(), value) {
            ("ExposureValue", ControlValue::Float(ev)) => {
                args.extend(["--ev".to_string(), ev.to_string()]);
            }
            ("Brightness", ControlValue::Float(b)) => {
                args.extend(["--brightness".to_string(), b.to_string()]);
            }
            ("AeEnable", ControlValue::Bool(false)) => {
                args.extend(["--shutter", "10000", "--gain", "1"].map(String::from));
            }
            ("AwbEnable", ControlValue::Bool(false)) => {
                args.extend(["--awbgains", "1.0,1.0"].map(String::from));
            }
            ("ScalerCrop", ControlValue::Rect([x, y, w, h])) => {
                let (sw, sh) = (SENSOR_SIZE.width as f64, SENSOR_SIZE.height as f64);
                let roi = format!(
                    "{:.4},{:.4},{:.4},{:.4}",
                    *x as f64 / sw,
                    *y as f64 / sh,
                    *w as f64 / sw,
                    *h as f64 / sh
                );
                args.extend(["--roi".to_string(), roi]);
            }
            ("AeEnable" | "AwbEnable", ControlValue::Bool(true)) => {}
            _ => debug!("rpicam has no flag for {name}={value:?}"),
        }
    }
    args
}

/// Arguments for one capture in `mode`, writing metadata to `metadata`.
pub fn still_args(mode: &ModeDescriptor, controls: &Controls, metadata: &str) -> Vec<String> {
    let mut args: Vec<String> = [
        "--nopreview",
        "--immediate",
        "--encoding",
        "png",
        "--output",
        "-",
        "--metadata",
        metadata,
        "--metadata-format",
        "json",
    ]
    .map(String::from)
    .into();
    args.extend([
        "--width".to_string(),
        mode.size.width.to_string(),
        "--height".to_string(),
        mode.size.height.to_string(),
    ]);
    args.extend(control_args(controls));
    args
}

/// Keeps the numeric fields of an rpicam metadata dump.
pub fn parse_metadata(contents: &str) -> Metadata {
    let Ok(serde_json::Value::Object(fields)) = serde_json::from_str(contents) else {
        return Metadata::new();
    };
    fields
        .into_iter()
        .filter_map(|(key, value)| value.as_f64().map(|v| (key, v)))
        .collect()
}

#[async_trait]
impl Camera for RpicamCamera {
    async fn configure(&mut self, mode: &ModeDescriptor) -> Result<(), CameraError> {
        debug!("configuring {mode:?}");
        self.mode = Some(*mode);
        Ok(())
    }

    async fn set_controls(&mut self, controls: &Controls) -> Result<(), CameraError> {
        self.controls
            .extend(controls.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn capture_request(&mut self) -> Result<Capture, CameraError> {
        let mode = self
            .mode
            .ok_or_else(|| CameraError::Backend("capture before configure".to_string()))?;
        let metadata_path = self.metadata_path.to_string_lossy().into_owned();
        let output = Command::new(&self.command)
            .args(still_args(&mode, &self.controls, &metadata_path))
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CameraError::Backend(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }
        let image = image::load_from_memory(&output.stdout)?;
        let metadata = match tokio::fs::read_to_string(&self.metadata_path).await {
            Ok(contents) => parse_metadata(&contents),
            Err(e) => {
                warn!("no capture metadata: {e}");
                Metadata::new()
            }
        };
        Ok(Capture {
            frame: Frame::fit_image(&image, mode.size),
            metadata,
        })
    }

    async fn switch_mode(&mut self, mode: &ModeDescriptor) -> Result<(), CameraError> {
        self.configure(mode).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pocketcam::Dimensions;

    #[test]
    fn test_args_follow_mode_and_controls() {
        let mut controls = Controls::new();
        controls.insert("ExposureValue".into(), ControlValue::Float(0.5));
        controls.insert("AwbEnable".into(), ControlValue::Bool(true));
        controls.insert("ScalerCrop".into(), ControlValue::Rect([508, 0, 3040, 3040]));
        let args = still_args(
            &ModeDescriptor::still(Dimensions::new(2028, 1520)),
            &controls,
            "/tmp/meta.json",
        );
        let joined = args.join(" ");
        assert!(joined.contains("--width 2028 --height 1520"));
        assert!(joined.contains("--ev 0.5"));
        assert!(joined.contains("--roi 0.1252,0.0000,0.7495,1.0000"));
        assert!(joined.contains("--metadata /tmp/meta.json"));
        assert!(!joined.contains("awbgains"));
    }

    #[test]
    fn test_metadata_keeps_numbers() {
        let metadata = parse_metadata(
            r#"{"ExposureTime": 16000, "Lux": 412.5, "SensorTimestamp": "x", "ColourGains": [1.2, 1.8]}"#,
        );
        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata["ExposureTime"], 16000.0);
        assert_eq!(metadata["Lux"], 412.5);
        assert!(parse_metadata("not json").is_empty());
    }

    #[tokio::test]
    async fn test_capture_before_configure_fails() {
        let mut camera = RpicamCamera::new("true");
        assert!(matches!(
            camera.capture_request().await,
            Err(CameraError::Backend(_))
        ));
    }
}

//! Video playback through `ffprobe` and `ffmpeg`.
//!
//! Nothing is decoded ahead: each frame the browser asks for is a single
//! seek-and-extract run of ffmpeg.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::debug;
use pocketcam::media::video::{VideoBackend, VideoError, VideoStream};
use pocketcam::{Dimensions, Frame};
use serde::Deserialize;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct FfmpegBackend {
    ffmpeg: String,
    ffprobe: String,
}

impl FfmpegBackend {
    pub fn new(ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    r_frame_rate: Option<String>,
    nb_read_packets: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamInfo {
    pub fps: f64,
    pub total_frames: u64,
}

fn parse_rate(rate: &str) -> Option<f64> {
    let (num, den) = rate.split_once('/').unwrap_or((rate, "1"));
    let (num, den): (f64, f64) = (num.parse().ok()?, den.parse().ok()?);
    (den > 0.0 && num > 0.0).then(|| num / den)
}

/// Reads fps and frame count out of `ffprobe -of json` output.
pub fn parse_probe(json: &str) -> Result<StreamInfo, VideoError> {
    let probe: ProbeOutput = serde_json::from_str(json)
        .map_err(|e| VideoError::Backend(format!("unreadable ffprobe output: {e}")))?;
    let stream = probe
        .streams
        .first()
        .ok_or_else(|| VideoError::Backend("no video stream".to_string()))?;
    let fps = stream
        .r_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .ok_or_else(|| VideoError::Backend("no frame rate".to_string()))?;
    let total_frames = stream
        .nb_read_packets
        .as_deref()
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| VideoError::Backend("no frame count".to_string()))?;
    Ok(StreamInfo { fps, total_frames })
}

pub fn frame_args(path: &Path, index: u64, fps: f64, target: Dimensions) -> Vec<String> {
    let seconds = index as f64 / fps;
    vec![
        "-v".into(),
        "error".into(),
        "-ss".into(),
        format!("{seconds:.3}"),
        "-i".into(),
        path.to_string_lossy().into_owned(),
        "-frames:v".into(),
        "1".into(),
        "-vf".into(),
        format!(
            "scale={}:{}:force_original_aspect_ratio=decrease",
            target.width, target.height
        ),
        "-f".into(),
        "image2pipe".into(),
        "-vcodec".into(),
        "png".into(),
        "-".into(),
    ]
}

async fn run(program: &str, args: &[String]) -> Result<Vec<u8>, VideoError> {
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await?;
    if !output.status.success() {
        return Err(VideoError::Backend(format!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(output.stdout)
}

#[async_trait]
impl VideoBackend for FfmpegBackend {
    async fn open(&self, path: &Path, target: Dimensions) -> Result<Box<dyn VideoStream>, VideoError> {
        let args: Vec<String> = [
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-count_packets",
            "-show_entries",
            "stream=r_frame_rate,nb_read_packets",
            "-of",
            "json",
        ]
        .map(String::from)
        .into_iter()
        .chain([path.to_string_lossy().into_owned()])
        .collect();
        let probe = run(&self.ffprobe, &args).await?;
        let info = parse_probe(&String::from_utf8_lossy(&probe))?;
        debug!("opened {}: {info:?}", path.display());
        Ok(Box::new(FfmpegStream {
            ffmpeg: self.ffmpeg.clone(),
            path: path.to_path_buf(),
            info,
            target,
        }))
    }
}

struct FfmpegStream {
    ffmpeg: String,
    path: PathBuf,
    info: StreamInfo,
    target: Dimensions,
}

#[async_trait]
impl VideoStream for FfmpegStream {
    fn fps(&self) -> f64 {
        self.info.fps
    }

    fn total_frames(&self) -> u64 {
        self.info.total_frames
    }

    async fn frame_at(&mut self, index: u64) -> Result<Frame, VideoError> {
        let args = frame_args(&self.path, index, self.info.fps, self.target);
        let png = run(&self.ffmpeg, &args).await?;
        let image = image::load_from_memory(&png)
            .map_err(|e| VideoError::Backend(format!("bad frame from ffmpeg: {e}")))?;
        Ok(Frame::fit_image(&image, self.target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_probe() {
        let info = parse_probe(
            r#"{"programs": [], "streams": [{"r_frame_rate": "30000/1001", "nb_read_packets": "300"}]}"#,
        )
        .unwrap();
        assert!((info.fps - 29.97).abs() < 0.01);
        assert_eq!(info.total_frames, 300);

        assert!(parse_probe(r#"{"streams": []}"#).is_err());
        assert!(parse_probe(r#"{"streams": [{"r_frame_rate": "0/0", "nb_read_packets": "3"}]}"#).is_err());
    }

    #[test]
    fn test_frame_args_seek_by_index() {
        let args = frame_args(Path::new("/v/clip.mp4"), 45, 30.0, Dimensions::new(240, 240));
        let joined = args.join(" ");
        assert!(joined.starts_with("-v error -ss 1.500 -i /v/clip.mp4 -frames:v 1"));
        assert!(joined.contains("scale=240:240:force_original_aspect_ratio=decrease"));
        assert!(joined.ends_with("-vcodec png -"));
    }

    #[tokio::test]
    async fn test_missing_tool_is_io_error() {
        let backend = FfmpegBackend::new("/nonexistent/ffmpeg", "/nonexistent/ffprobe");
        let result = backend
            .open(Path::new("clip.mp4"), Dimensions::new(4, 4))
            .await;
        assert!(matches!(result, Err(VideoError::Io(_))));
    }
}

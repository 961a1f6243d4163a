//! On-demand video playback for the media browser.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

use crate::frame::{Dimensions, Frame};

#[derive(Debug, Error)]
pub enum VideoError {
    #[error("video I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("video backend failed: {0}")]
    Backend(String),
}

/// Opens video files for frame-accurate reads.
#[async_trait]
pub trait VideoBackend: Send + Sync {
    async fn open(&self, path: &Path, target: Dimensions) -> Result<Box<dyn VideoStream>, VideoError>;
}

#[async_trait]
pub trait VideoStream: Send {
    fn fps(&self) -> f64;
    fn total_frames(&self) -> u64;
    async fn frame_at(&mut self, index: u64) -> Result<Frame, VideoError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Playing,
}

/// An open video and where playback is in it.
pub struct Playback {
    stream: Box<dyn VideoStream>,
    state: PlaybackState,
    position: u64,
    next_due: Instant,
    needs_redraw: bool,
}

impl Playback {
    pub fn new(stream: Box<dyn VideoStream>) -> Self {
        Self {
            stream,
            state: PlaybackState::Stopped,
            position: 0,
            next_due: Instant::now(),
            needs_redraw: true,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state == PlaybackState::Playing
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn total_frames(&self) -> u64 {
        self.stream.total_frames()
    }

    pub fn fps(&self) -> f64 {
        self.stream.fps()
    }

    /// Fraction of the video played, in 0..=1.
    pub fn progress(&self) -> f64 {
        match self.total_frames() {
            0 => 0.0,
            total => self.position as f64 / total as f64,
        }
    }

    fn frame_interval(&self) -> Duration {
        let fps = self.fps();
        if fps > 0.0 {
            Duration::from_secs_f64(1.0 / fps)
        } else {
            Duration::from_millis(40)
        }
    }

    pub fn toggle(&mut self) {
        self.state = match self.state {
            PlaybackState::Stopped => {
                self.next_due = Instant::now();
                PlaybackState::Playing
            }
            PlaybackState::Playing => PlaybackState::Stopped,
        };
    }

    pub fn stop(&mut self) {
        self.state = PlaybackState::Stopped;
    }

    /// Jumps to `fraction` of the way through and pauses there.
    pub fn seek(&mut self, fraction: f64) {
        let total = self.total_frames();
        let target = (fraction.clamp(0.0, 1.0) * total as f64) as u64;
        self.position = target.min(total.saturating_sub(1));
        self.state = PlaybackState::Stopped;
        self.needs_redraw = true;
    }

    /// Returns the next frame to show, or `None` if nothing changed.
    ///
    /// While playing this waits until the frame is due. Reaching the end
    /// rewinds to the start and stops. Cancel safe: state only advances
    /// once a frame has been decoded.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, VideoError> {
        match self.state {
            PlaybackState::Stopped => {
                if !self.needs_redraw {
                    return Ok(None);
                }
                let frame = self.stream.frame_at(self.position).await?;
                self.needs_redraw = false;
                Ok(Some(frame))
            }
            PlaybackState::Playing => {
                tokio::time::sleep_until(self.next_due).await;
                if self.position >= self.total_frames() {
                    let frame = self.stream.frame_at(0).await?;
                    self.position = 0;
                    self.state = PlaybackState::Stopped;
                    self.needs_redraw = false;
                    return Ok(Some(frame));
                }
                let frame = self.stream.frame_at(self.position).await?;
                self.position += 1;
                self.next_due += self.frame_interval();
                let now = Instant::now();
                if self.next_due < now {
                    // fell behind, don't try to catch up
                    self.next_due = now;
                }
                Ok(Some(frame))
            }
        }
    }
}

//! Single-slot frame channel between the supervisor and the display.
//!
//! The consumer runs as its own task so a slow panel write never delays
//! input handling. The channel holds at most one frame: a producer that
//! gets ahead of the display waits for the slot to free up.

use async_trait::async_trait;
use log::{error, info};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::frame::{Dimensions, Frame};

#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("display write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame is {actual:?} but the display is {expected:?}")]
    SizeMismatch {
        expected: Dimensions,
        actual: Dimensions,
    },
}

#[derive(Debug, Error)]
#[error("display pipeline closed")]
pub struct PipelineClosed;

/// The physical display transport.
#[async_trait]
pub trait Display: Send {
    fn dimensions(&self) -> Dimensions;

    /// Takes ownership of `frame` and shows it.
    async fn present(&mut self, frame: Frame) -> Result<(), DisplayError>;

    async fn set_backlight(&mut self, on: bool) -> Result<(), DisplayError>;
}

/// Producer side of the pipeline.
#[derive(Clone)]
pub struct DisplayPipeline {
    frames: mpsc::Sender<Frame>,
    backlight: watch::Sender<bool>,
    dimensions: Dimensions,
}

impl DisplayPipeline {
    /// Spawns the consumer on `task_tracker`. The handle resolves when the
    /// consumer stops, with the display error that stopped it if any.
    pub fn spawn(
        task_tracker: &TaskTracker,
        display: Box<dyn Display>,
        shutdown_token: CancellationToken,
    ) -> (Self, JoinHandle<Result<(), DisplayError>>) {
        let (frames_tx, frames_rx) = mpsc::channel(1);
        let (backlight_tx, backlight_rx) = watch::channel(true);
        let dimensions = display.dimensions();
        let handle = task_tracker.spawn(run_consumer(
            display,
            frames_rx,
            backlight_rx,
            shutdown_token,
        ));
        let pipeline = Self {
            frames: frames_tx,
            backlight: backlight_tx,
            dimensions,
        };
        (pipeline, handle)
    }

    pub fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    /// Hands a frame to the consumer, waiting while the slot is occupied.
    pub async fn push(&self, frame: Frame) -> Result<(), PipelineClosed> {
        self.frames.send(frame).await.map_err(|_| PipelineClosed)
    }

    /// Waits for the slot to free up without producing anything yet, so the
    /// caller can render a frame that is fresh when it lands.
    pub async fn reserve(&self) -> Result<mpsc::OwnedPermit<Frame>, PipelineClosed> {
        self.frames
            .clone()
            .reserve_owned()
            .await
            .map_err(|_| PipelineClosed)
    }

    pub fn set_backlight(&self, on: bool) {
        self.backlight.send_replace(on);
    }

    pub fn is_closed(&self) -> bool {
        self.frames.is_closed()
    }
}

async fn run_consumer(
    mut display: Box<dyn Display>,
    mut frames: mpsc::Receiver<Frame>,
    mut backlight: watch::Receiver<bool>,
    shutdown_token: CancellationToken,
) -> Result<(), DisplayError> {
    let result = consume(display.as_mut(), &mut frames, &mut backlight, &shutdown_token).await;
    if let Err(e) = &result {
        error!("display consumer stopped: {e}");
    }
    result
}

async fn consume(
    display: &mut dyn Display,
    frames: &mut mpsc::Receiver<Frame>,
    backlight: &mut watch::Receiver<bool>,
    shutdown_token: &CancellationToken,
) -> Result<(), DisplayError> {
    let mut backlight_open = true;
    loop {
        tokio::select! {
            _ = shutdown_token.cancelled() => {
                info!("display consumer shutting down");
                return Ok(());
            }
            changed = backlight.changed(), if backlight_open => {
                if changed.is_err() {
                    backlight_open = false;
                    continue;
                }
                let on = *backlight.borrow_and_update();
                display.set_backlight(on).await?;
            }
            frame = frames.recv() => match frame {
                Some(frame) => {
                    let expected = display.dimensions();
                    if frame.dimensions() != expected {
                        return Err(DisplayError::SizeMismatch {
                            expected,
                            actual: frame.dimensions(),
                        });
                    }
                    display.present(frame).await?;
                }
                None => {
                    info!("frame producer gone, display consumer exiting");
                    return Ok(());
                }
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use embedded_graphics::pixelcolor::Rgb888;
    use embedded_graphics::prelude::RgbColor;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Records the first pixel's red channel of every presented frame, used
    /// as a frame number by the tests.
    #[derive(Clone)]
    pub struct RecordingDisplay {
        pub dimensions: Dimensions,
        pub presented: Arc<Mutex<Vec<u8>>>,
        pub backlight: Arc<Mutex<Vec<bool>>>,
        pub delay: Duration,
        pub fail: bool,
    }

    impl RecordingDisplay {
        pub fn new(dimensions: Dimensions) -> Self {
            Self {
                dimensions,
                presented: Arc::new(Mutex::new(Vec::new())),
                backlight: Arc::new(Mutex::new(Vec::new())),
                delay: Duration::ZERO,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl Display for RecordingDisplay {
        fn dimensions(&self) -> Dimensions {
            self.dimensions
        }

        async fn present(&mut self, frame: Frame) -> Result<(), DisplayError> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(DisplayError::Io(std::io::Error::other("spi timeout")));
            }
            let tag = frame.pixel(0, 0).map(|c| c.r()).unwrap_or(0);
            self.presented.lock().unwrap().push(tag);
            Ok(())
        }

        async fn set_backlight(&mut self, on: bool) -> Result<(), DisplayError> {
            self.backlight.lock().unwrap().push(on);
            Ok(())
        }
    }

    pub fn tagged(dimensions: Dimensions, tag: u8) -> Frame {
        Frame::filled(dimensions, Rgb888::new(tag, 0, 0))
    }

    const DIMS: Dimensions = Dimensions::new(4, 4);

    #[tokio::test(start_paused = true)]
    async fn test_frames_arrive_in_order_with_one_slot() {
        let tracker = TaskTracker::new();
        let mut display = RecordingDisplay::new(DIMS);
        display.delay = Duration::from_millis(50);
        let presented = display.presented.clone();
        let (pipeline, _handle) =
            DisplayPipeline::spawn(&tracker, Box::new(display), CancellationToken::new());

        for tag in 1..=3 {
            pipeline.push(tagged(DIMS, tag)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(*presented.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_producer_blocks_while_slot_is_full() {
        let tracker = TaskTracker::new();
        let mut display = RecordingDisplay::new(DIMS);
        display.delay = Duration::from_secs(10);
        let (pipeline, _handle) =
            DisplayPipeline::spawn(&tracker, Box::new(display), CancellationToken::new());

        // first frame goes to the display, second fills the slot
        pipeline.push(tagged(DIMS, 1)).await.unwrap();
        tokio::task::yield_now().await;
        pipeline.push(tagged(DIMS, 2)).await.unwrap();

        let third = tokio::time::timeout(Duration::from_secs(1), pipeline.push(tagged(DIMS, 3)));
        assert!(third.await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_display_error_is_propagated() {
        let tracker = TaskTracker::new();
        let mut display = RecordingDisplay::new(DIMS);
        display.fail = true;
        let (pipeline, handle) =
            DisplayPipeline::spawn(&tracker, Box::new(display), CancellationToken::new());

        pipeline.push(tagged(DIMS, 1)).await.unwrap();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(DisplayError::Io(_))));
        assert!(pipeline.push(tagged(DIMS, 2)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_size_frame_is_rejected() {
        let tracker = TaskTracker::new();
        let (pipeline, handle) = DisplayPipeline::spawn(
            &tracker,
            Box::new(RecordingDisplay::new(DIMS)),
            CancellationToken::new(),
        );
        pipeline.push(tagged(Dimensions::new(2, 2), 1)).await.unwrap();
        assert!(matches!(
            handle.await.unwrap(),
            Err(DisplayError::SizeMismatch { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlight_and_shutdown() {
        let tracker = TaskTracker::new();
        let display = RecordingDisplay::new(DIMS);
        let backlight = display.backlight.clone();
        let token = CancellationToken::new();
        let (pipeline, handle) = DisplayPipeline::spawn(&tracker, Box::new(display), token.clone());

        pipeline.set_backlight(false);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*backlight.lock().unwrap(), vec![false]);

        token.cancel();
        assert!(handle.await.unwrap().is_ok());
    }
}

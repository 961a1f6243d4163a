//! Input replay device for running without buttons.
//!
//! A script has one event per line: `<delay_ms> <control> <action>`, where
//! action is `press`, `release` or `long`, and `encoder cw` / `encoder ccw`
//! turn the encoder. Blank lines and `#` comments are skipped.

use std::path::Path;
use std::time::Duration;

use log::info;
use pocketcam::input::Rotation;
use pocketcam::{ControlId, InputEvent, InputEventSource};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("failed to read replay script: {0}")]
    Io(#[from] std::io::Error),
    #[error("replay script line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayStep {
    pub delay: Duration,
    pub event: InputEvent,
}

fn parse_line(text: &str) -> Result<ReplayStep, String> {
    let fields: Vec<&str> = text.split_whitespace().collect();
    let &[delay, control, action] = fields.as_slice() else {
        return Err(format!("expected 3 fields, got {}", fields.len()));
    };
    let delay = delay
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| format!("bad delay {delay:?}: {e}"))?;
    let event = if control.eq_ignore_ascii_case("encoder") {
        match action {
            "cw" => InputEvent::Encoder(Rotation::Clockwise),
            "ccw" => InputEvent::Encoder(Rotation::CounterClockwise),
            _ => return Err(format!("encoder can't {action}")),
        }
    } else {
        let control: ControlId = control.parse().map_err(|e| format!("{e}"))?;
        match action {
            "press" => InputEvent::press(control),
            "release" => InputEvent::release(control),
            "long" => InputEvent::LongPress { control },
            _ => return Err(format!("unknown action {action:?}")),
        }
    };
    Ok(ReplayStep { delay, event })
}

pub fn parse_script(script: &str) -> Result<Vec<ReplayStep>, ReplayError> {
    script
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.split('#').next().unwrap_or("").trim()))
        .filter(|(_, line)| !line.is_empty())
        .map(|(line, text)| parse_line(text).map_err(|reason| ReplayError::Parse { line, reason }))
        .collect()
}

/// A device that replays scripted input instead of reading /dev/input.
pub struct InputReplayDevice {
    steps: Vec<ReplayStep>,
}

impl InputReplayDevice {
    pub async fn open(path: &Path) -> Result<Self, ReplayError> {
        info!("opening input script for replay: {}", path.display());
        let script = tokio::fs::read_to_string(path).await?;
        let steps = parse_script(&script)?;
        info!("replaying {} input events", steps.len());
        Ok(Self { steps })
    }

    /// Feeds the script into `source`, sleeping before each event.
    pub async fn run(self, source: InputEventSource, shutdown_token: CancellationToken) {
        for step in self.steps {
            tokio::select! {
                _ = shutdown_token.cancelled() => return,
                _ = tokio::time::sleep(step.delay) => source.inject(step.event),
            }
        }
        info!("input script finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pocketcam::input::{InputConfig, LineReader};
    use pocketcam::peripheral::PeripheralError;
    use std::sync::Arc;
    use tokio_util::task::TaskTracker;

    const SCRIPT: &str = "\
# walk to the gallery and back
500 triangle long
100 down press
 50 down release

200 encoder ccw   # previous
10 Cross press
";

    struct NoLines;

    impl LineReader for NoLines {
        fn is_active(&self, _control: ControlId) -> Result<bool, PeripheralError> {
            Ok(false)
        }
    }

    #[test]
    fn test_parse_script() {
        let steps = parse_script(SCRIPT).unwrap();
        assert_eq!(steps.len(), 5);
        assert_eq!(
            steps[0],
            ReplayStep {
                delay: Duration::from_millis(500),
                event: InputEvent::LongPress {
                    control: ControlId::Triangle
                },
            }
        );
        assert_eq!(steps[2].event, InputEvent::release(ControlId::Down));
        assert_eq!(steps[3].event, InputEvent::Encoder(Rotation::CounterClockwise));
        assert_eq!(steps[4].event, InputEvent::press(ControlId::Cross));
    }

    #[test]
    fn test_errors_name_the_line() {
        let err = parse_script("10 up press\n\n10 zoom press\n").unwrap_err();
        assert!(matches!(err, ReplayError::Parse { line: 3, .. }));
        assert!(parse_script("soon up press").is_err());
        assert!(parse_script("10 up").is_err());
        assert!(parse_script("10 encoder press").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_paces_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.txt");
        std::fs::write(&path, "1000 center press\n1000 center release\n").unwrap();
        let device = InputReplayDevice::open(&path).await.unwrap();

        let tracker = TaskTracker::new();
        let (source, mut rx) =
            InputEventSource::channel(&tracker, Arc::new(NoLines), InputConfig::default(), 4);
        let start = tokio::time::Instant::now();
        tokio::spawn(device.run(source, CancellationToken::new()));

        assert_eq!(rx.recv().await, Some(InputEvent::press(ControlId::Center)));
        assert_eq!(rx.recv().await, Some(InputEvent::release(ControlId::Center)));
        assert!(start.elapsed() >= Duration::from_millis(2000));
        assert_eq!(rx.recv().await, None);
    }
}

//! Physical input turned into discrete events.
//!
//! Hardware readers call [InputEventSource::on_edge] and
//! [InputEventSource::on_rotation] from their own context. Events are pushed
//! into a bounded channel drained by the supervisor, so a reader never runs
//! mode logic and never blocks on a slow consumer.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;

use crate::frame::Orientation;
use crate::peripheral::PeripheralError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlId {
    Up,
    Down,
    Left,
    Right,
    Center,
    Circle,
    Triangle,
    Square,
    Cross,
    Shutter,
}

impl ControlId {
    const DIRECTIONS: [ControlId; 4] = [
        ControlId::Up,
        ControlId::Right,
        ControlId::Down,
        ControlId::Left,
    ];

    /// Maps a physical direction to the on-screen direction for the given
    /// device orientation. Non-directional controls pass through.
    pub fn remap(self, orientation: Orientation) -> ControlId {
        let Some(k) = Self::DIRECTIONS.iter().position(|c| *c == self) else {
            return self;
        };
        let q = orientation.quarter_turns() as usize;
        Self::DIRECTIONS[(q * 3 + k) % 4]
    }

    pub fn is_directional(self) -> bool {
        Self::DIRECTIONS.contains(&self)
    }
}

impl fmt::Display for ControlId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlId::Up => "up",
            ControlId::Down => "down",
            ControlId::Left => "left",
            ControlId::Right => "right",
            ControlId::Center => "center",
            ControlId::Circle => "circle",
            ControlId::Triangle => "triangle",
            ControlId::Square => "square",
            ControlId::Cross => "cross",
            ControlId::Shutter => "shutter",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("unknown control: {0}")]
pub struct UnknownControl(pub String);

impl FromStr for ControlId {
    type Err = UnknownControl;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "up" => ControlId::Up,
            "down" => ControlId::Down,
            "left" => ControlId::Left,
            "right" => ControlId::Right,
            "center" => ControlId::Center,
            "circle" => ControlId::Circle,
            "triangle" => ControlId::Triangle,
            "square" => ControlId::Square,
            "cross" => ControlId::Cross,
            "shutter" => ControlId::Shutter,
            _ => return Err(UnknownControl(s.to_string())),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Press,
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Clockwise,
    CounterClockwise,
}

impl Rotation {
    pub fn delta(self) -> i32 {
        match self {
            Rotation::Clockwise => 1,
            Rotation::CounterClockwise => -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    Control { control: ControlId, edge: Edge },
    /// An overloaded control held for at least the long-press threshold.
    LongPress { control: ControlId },
    Encoder(Rotation),
}

impl InputEvent {
    pub fn press(control: ControlId) -> Self {
        InputEvent::Control {
            control,
            edge: Edge::Press,
        }
    }

    pub fn release(control: ControlId) -> Self {
        InputEvent::Control {
            control,
            edge: Edge::Release,
        }
    }

    /// Returns the control if this is a press edge of it.
    pub fn pressed(&self) -> Option<ControlId> {
        match self {
            InputEvent::Control {
                control,
                edge: Edge::Press,
            } => Some(*control),
            _ => None,
        }
    }
}

/// Samples the current level of a control's input line.
pub trait LineReader: Send + Sync {
    fn is_active(&self, control: ControlId) -> Result<bool, PeripheralError>;
}

#[derive(Debug, Clone)]
pub struct InputConfig {
    /// Hold time at which a press becomes a long press.
    pub long_press: Duration,
    /// Holds shorter than this are contact bounce and produce nothing.
    pub debounce: Duration,
    pub poll_interval: Duration,
    /// Controls that carry a separate long-press action.
    pub overloaded: Vec<ControlId>,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            long_press: Duration::from_millis(1000),
            debounce: Duration::from_millis(90),
            poll_interval: Duration::from_millis(10),
            overloaded: vec![ControlId::Square, ControlId::Cross, ControlId::Triangle],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressKind {
    Bounce,
    Short,
    Long,
}

/// Polls `control` until it releases or the long-press threshold passes,
/// whichever comes first. A read error ends the poll with `None`.
pub async fn measure_hold(
    lines: &dyn LineReader,
    control: ControlId,
    config: &InputConfig,
) -> Option<PressKind> {
    let start = Instant::now();
    loop {
        match lines.is_active(control) {
            Ok(true) => {}
            Ok(false) => {
                let held = start.elapsed();
                return Some(if held < config.debounce {
                    PressKind::Bounce
                } else {
                    PressKind::Short
                });
            }
            Err(e) => {
                warn!("failed to sample {control}: {e}");
                return None;
            }
        }
        if start.elapsed() >= config.long_press {
            return Some(PressKind::Long);
        }
        tokio::time::sleep(config.poll_interval).await;
    }
}

#[derive(Clone)]
pub struct InputEventSource {
    sender: mpsc::Sender<InputEvent>,
    lines: Arc<dyn LineReader>,
    config: Arc<InputConfig>,
    in_flight: Arc<Mutex<HashSet<ControlId>>>,
    task_tracker: TaskTracker,
}

impl InputEventSource {
    pub fn new(
        task_tracker: &TaskTracker,
        lines: Arc<dyn LineReader>,
        config: InputConfig,
        sender: mpsc::Sender<InputEvent>,
    ) -> Self {
        Self {
            sender,
            lines,
            config: Arc::new(config),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            task_tracker: task_tracker.clone(),
        }
    }

    /// Creates a source together with the receiving end for the supervisor.
    pub fn channel(
        task_tracker: &TaskTracker,
        lines: Arc<dyn LineReader>,
        config: InputConfig,
        depth: usize,
    ) -> (Self, mpsc::Receiver<InputEvent>) {
        let (tx, rx) = mpsc::channel(depth);
        (Self::new(task_tracker, lines, config, tx), rx)
    }

    /// Reports a line transition. Never blocks.
    pub fn on_edge(&self, control: ControlId, edge: Edge) {
        if !self.config.overloaded.contains(&control) {
            self.emit(InputEvent::Control { control, edge });
            return;
        }
        // the classifier reports the release itself
        if edge == Edge::Release {
            return;
        }
        match self.in_flight.lock() {
            Ok(mut in_flight) => {
                if !in_flight.insert(control) {
                    return;
                }
            }
            Err(_) => {
                warn!("input classifier state poisoned, dropping {control}");
                return;
            }
        }

        let source = self.clone();
        self.task_tracker.spawn(async move {
            let kind = measure_hold(source.lines.as_ref(), control, &source.config).await;
            if let Ok(mut in_flight) = source.in_flight.lock() {
                in_flight.remove(&control);
            }
            match kind {
                Some(PressKind::Short) => {
                    source.emit(InputEvent::press(control));
                    source.emit(InputEvent::release(control));
                }
                Some(PressKind::Long) => source.emit(InputEvent::LongPress { control }),
                Some(PressKind::Bounce) => debug!("ignoring bounce on {control}"),
                None => {}
            }
        });
    }

    pub fn on_rotation(&self, rotation: Rotation) {
        self.emit(InputEvent::Encoder(rotation));
    }

    /// Injects an already classified event, as a replay script does.
    pub fn inject(&self, event: InputEvent) {
        self.emit(event);
    }

    fn emit(&self, event: InputEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("input queue full, dropping {event:?}");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("input queue closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// A single line whose level the test flips by hand.
    #[derive(Default)]
    struct ManualLine {
        active: AtomicBool,
        broken: AtomicBool,
    }

    impl LineReader for ManualLine {
        fn is_active(&self, _control: ControlId) -> Result<bool, PeripheralError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(PeripheralError::Unavailable("line".to_string()));
            }
            Ok(self.active.load(Ordering::SeqCst))
        }
    }

    fn source(line: Arc<ManualLine>) -> (InputEventSource, mpsc::Receiver<InputEvent>) {
        InputEventSource::channel(&TaskTracker::new(), line, InputConfig::default(), 8)
    }

    #[test]
    fn test_remap_by_orientation() {
        assert_eq!(ControlId::Up.remap(Orientation::Deg0), ControlId::Up);
        assert_eq!(ControlId::Up.remap(Orientation::Deg90), ControlId::Left);
        assert_eq!(ControlId::Right.remap(Orientation::Deg90), ControlId::Up);
        assert_eq!(ControlId::Up.remap(Orientation::Deg180), ControlId::Down);
        assert_eq!(ControlId::Up.remap(Orientation::Deg270), ControlId::Right);
        assert_eq!(ControlId::Center.remap(Orientation::Deg90), ControlId::Center);
    }

    #[test]
    fn test_control_names_parse() {
        for control in [ControlId::Up, ControlId::Shutter, ControlId::Triangle] {
            assert_eq!(control.to_string().parse::<ControlId>(), Ok(control));
        }
        assert_eq!("CROSS".parse::<ControlId>(), Ok(ControlId::Cross));
        assert!("joystick".parse::<ControlId>().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_plain_control_forwards_edges_in_order() {
        let (source, mut rx) = source(Arc::new(ManualLine::default()));
        source.on_edge(ControlId::Up, Edge::Press);
        source.on_edge(ControlId::Up, Edge::Release);
        assert_eq!(rx.recv().await, Some(InputEvent::press(ControlId::Up)));
        assert_eq!(rx.recv().await, Some(InputEvent::release(ControlId::Up)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_press_on_overloaded_control() {
        let line = Arc::new(ManualLine::default());
        let (source, mut rx) = source(line.clone());
        line.active.store(true, Ordering::SeqCst);
        source.on_edge(ControlId::Square, Edge::Press);
        tokio::time::sleep(Duration::from_millis(300)).await;
        line.active.store(false, Ordering::SeqCst);
        source.on_edge(ControlId::Square, Edge::Release);

        assert_eq!(rx.recv().await, Some(InputEvent::press(ControlId::Square)));
        assert_eq!(rx.recv().await, Some(InputEvent::release(ControlId::Square)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_press_stops_at_threshold() {
        let line = Arc::new(ManualLine::default());
        let (source, mut rx) = source(line.clone());
        line.active.store(true, Ordering::SeqCst);
        let start = Instant::now();
        source.on_edge(ControlId::Cross, Edge::Press);

        assert_eq!(
            rx.recv().await,
            Some(InputEvent::LongPress {
                control: ControlId::Cross
            })
        );
        assert!(start.elapsed() < Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounce_is_ignored() {
        let line = Arc::new(ManualLine::default());
        let (source, mut rx) = source(line.clone());
        line.active.store(true, Ordering::SeqCst);
        source.on_edge(ControlId::Square, Edge::Press);
        tokio::time::sleep(Duration::from_millis(30)).await;
        line.active.store(false, Ordering::SeqCst);

        source.on_edge(ControlId::Up, Edge::Press);
        assert_eq!(rx.recv().await, Some(InputEvent::press(ControlId::Up)));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_error_counts_as_no_press() {
        let line = Arc::new(ManualLine::default());
        line.broken.store(true, Ordering::SeqCst);
        let config = InputConfig::default();
        assert_eq!(measure_hold(line.as_ref(), ControlId::Cross, &config).await, None);

        // the source keeps working afterwards
        let (source, mut rx) = source(line.clone());
        source.on_edge(ControlId::Cross, Edge::Press);
        source.on_rotation(Rotation::Clockwise);
        assert_eq!(rx.recv().await, Some(InputEvent::Encoder(Rotation::Clockwise)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_drops_without_blocking() {
        let (source, mut rx) = InputEventSource::channel(
            &TaskTracker::new(),
            Arc::new(ManualLine::default()),
            InputConfig::default(),
            1,
        );
        source.on_rotation(Rotation::Clockwise);
        source.on_rotation(Rotation::CounterClockwise);
        assert_eq!(rx.recv().await, Some(InputEvent::Encoder(Rotation::Clockwise)));
        assert!(rx.try_recv().is_err());
    }
}

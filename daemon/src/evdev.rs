//! Buttons and the rotary encoder read from `/dev/input/event*`.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use pocketcam::input::{Edge, LineReader, Rotation};
use pocketcam::peripheral::PeripheralError;
use pocketcam::{ControlId, InputEventSource};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

/// `struct input_event` on a 64-bit kernel: a 16 byte timeval, then type,
/// code and value.
pub const INPUT_EVENT_SIZE: usize = 24;

const EV_KEY: u16 = 0x01;
const EV_REL: u16 = 0x02;

const KEY_RELEASE: i32 = 0;
const KEY_PRESS: i32 = 1;

/// Detents handled from one report. Larger values are corrupt reads.
const MAX_ENCODER_STEPS: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: u16,
    pub code: u16,
    pub value: i32,
}

pub fn parse_event(buf: &[u8; INPUT_EVENT_SIZE]) -> RawEvent {
    RawEvent {
        kind: u16::from_ne_bytes([buf[16], buf[17]]),
        code: u16::from_ne_bytes([buf[18], buf[19]]),
        value: i32::from_ne_bytes([buf[20], buf[21], buf[22], buf[23]]),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Translated {
    Edge(ControlId, Edge),
    Rotation(Rotation, u32),
}

/// Which key codes drive which controls, and which relative axis is the
/// encoder.
#[derive(Debug, Clone)]
pub struct KeyMap {
    pub controls: BTreeMap<u16, ControlId>,
    pub encoder_axis: u16,
}

impl KeyMap {
    /// Autorepeat (value 2), sync reports and unmapped codes yield nothing.
    pub fn translate(&self, event: RawEvent) -> Option<Translated> {
        match event.kind {
            EV_KEY => {
                let control = *self.controls.get(&event.code)?;
                let edge = match event.value {
                    KEY_PRESS => Edge::Press,
                    KEY_RELEASE => Edge::Release,
                    _ => return None,
                };
                Some(Translated::Edge(control, edge))
            }
            EV_REL if event.code == self.encoder_axis && event.value != 0 => {
                let rotation = if event.value > 0 {
                    Rotation::Clockwise
                } else {
                    Rotation::CounterClockwise
                };
                Some(Translated::Rotation(
                    rotation,
                    event.value.unsigned_abs().min(MAX_ENCODER_STEPS),
                ))
            }
            _ => None,
        }
    }
}

/// Which controls are down right now, shared by every reader. The long-press
/// classifier samples it.
#[derive(Debug, Clone, Default)]
pub struct KeyState {
    held: Arc<Mutex<HashSet<ControlId>>>,
}

impl KeyState {
    fn set(&self, control: ControlId, down: bool) {
        match self.held.lock() {
            Ok(mut held) => {
                if down {
                    held.insert(control);
                } else {
                    held.remove(&control);
                }
            }
            Err(_) => warn!("key state poisoned, dropping {control}"),
        }
    }
}

impl LineReader for KeyState {
    fn is_active(&self, control: ControlId) -> Result<bool, PeripheralError> {
        self.held
            .lock()
            .map(|held| held.contains(&control))
            .map_err(|_| PeripheralError::Unavailable("key state".to_string()))
    }
}

pub struct EvdevReader {
    path: PathBuf,
    keys: KeyMap,
    state: KeyState,
}

impl EvdevReader {
    pub fn new(path: impl Into<PathBuf>, keys: KeyMap, state: KeyState) -> Self {
        Self {
            path: path.into(),
            keys,
            state,
        }
    }

    fn dispatch(&self, event: RawEvent, source: &InputEventSource) {
        match self.keys.translate(event) {
            Some(Translated::Edge(control, edge)) => {
                // the state must be current before the classifier samples it
                self.state.set(control, edge == Edge::Press);
                source.on_edge(control, edge);
            }
            Some(Translated::Rotation(rotation, steps)) => {
                for _ in 0..steps {
                    source.on_rotation(rotation);
                }
            }
            None => {}
        }
    }

    /// Reads events until shutdown. A device that can't be opened or read is
    /// logged and given up on without affecting the other readers.
    pub async fn run(self, source: InputEventSource, shutdown_token: CancellationToken) {
        let mut file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) => {
                warn!("failed to open input device {}: {e}", self.path.display());
                return;
            }
        };
        info!("reading input from {}", self.path.display());

        let mut buf = [0u8; INPUT_EVENT_SIZE];
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => break,
                read = file.read_exact(&mut buf) => {
                    if let Err(e) = read {
                        warn!("input device {} failed: {e}", self.path.display());
                        break;
                    }
                    self.dispatch(parse_event(&buf), &source);
                }
            }
        }
        debug!("input reader for {} stopped", self.path.display());
    }
}

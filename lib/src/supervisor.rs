//! The supervisor owns the mode registry and the focus. It drains input
//! events, runs focus transfers and pulls frames from the focused mode into
//! the display pipeline, all from one task.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Local;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::{
    Address, LookupError, Message, MessageBus, ModeContext, ModeId, ModeRegistry, Payload,
    Request, Routed,
};
use crate::frame::{Frame, Orientation};
use crate::input::{ControlId, Edge, InputEvent};
use crate::mode::{FrameSession, Mode};
use crate::modes::ids;
use crate::pipeline::{DisplayPipeline, PipelineClosed};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error("mode {0} registered twice")]
    DuplicateMode(ModeId),
    #[error("no modes registered")]
    NoModes,
    #[error("display pipeline closed")]
    DisplayClosed,
}

impl From<PipelineClosed> for SupervisorError {
    fn from(_: PipelineClosed) -> Self {
        SupervisorError::DisplayClosed
    }
}

/// Appliance-wide power actions requested over the message bus.
#[async_trait]
pub trait PowerControl: Send {
    async fn power_off(&mut self) -> std::io::Result<()>;
    async fn reboot(&mut self) -> std::io::Result<()>;
    /// Restarts the control plane itself.
    async fn restart(&mut self) -> std::io::Result<()>;
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub initial_mode: ModeId,
    /// Where long-pressing Square saves the last frame. Screenshots are
    /// disabled without one.
    pub screenshot_dir: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            initial_mode: ids::VIEWFINDER,
            screenshot_dir: None,
        }
    }
}

pub struct Supervisor {
    registry: ModeRegistry,
    focused: usize,
    previous: Option<ModeId>,
    pending_enter: bool,
    session: FrameSession,
    orientation: Orientation,
    asleep: bool,
    events: mpsc::Receiver<InputEvent>,
    pipeline: DisplayPipeline,
    power: Box<dyn PowerControl>,
    screenshot_dir: Option<PathBuf>,
    last_frame: Option<Frame>,
    shutdown: CancellationToken,
}

type Pulled = Result<Option<(Frame, mpsc::OwnedPermit<Frame>)>, PipelineClosed>;

impl Supervisor {
    pub fn new(
        modes: Vec<Box<dyn Mode>>,
        config: SupervisorConfig,
        events: mpsc::Receiver<InputEvent>,
        pipeline: DisplayPipeline,
        power: Box<dyn PowerControl>,
        shutdown: CancellationToken,
    ) -> Result<Self, SupervisorError> {
        if modes.is_empty() {
            return Err(SupervisorError::NoModes);
        }
        let mut registry = ModeRegistry::new();
        for mode in modes {
            registry
                .register(mode)
                .map_err(|mode| SupervisorError::DuplicateMode(mode.id().clone()))?;
        }
        let focused = registry.lookup(&config.initial_mode)?;
        Ok(Self {
            registry,
            focused,
            previous: None,
            pending_enter: true,
            session: FrameSession::default(),
            orientation: Orientation::default(),
            asleep: false,
            events,
            pipeline,
            power,
            screenshot_dir: config.screenshot_dir,
            last_frame: None,
            shutdown,
        })
    }

    pub fn focused(&self) -> &ModeId {
        self.registry.id(self.focused)
    }

    pub fn session(&self) -> &FrameSession {
        &self.session
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn is_asleep(&self) -> bool {
        self.asleep
    }

    /// Runs until shutdown is requested or the input channel closes.
    ///
    /// Returns an error on a wiring bug (an unknown mode id) or when the
    /// display consumer has gone away.
    pub async fn run(mut self) -> Result<(), SupervisorError> {
        info!("supervisor starting with {} modes", self.registry.len());
        loop {
            if self.pending_enter {
                self.enter_focused().await?;
                continue;
            }
            let pulling = self.session.is_open() && !self.asleep;
            let focused = self.focused;
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("supervisor shutting down");
                    return Ok(());
                }
                event = self.events.recv() => match event {
                    Some(event) => self.dispatch(event).await?,
                    None => {
                        info!("input closed, supervisor exiting");
                        return Ok(());
                    }
                },
                pulled = pull_frame(&mut self.registry, focused, &self.pipeline), if pulling => {
                    self.present(pulled)?;
                }
            }
        }
    }

    /// Moves focus to `target`. The new mode's enter hook runs on the next
    /// loop iteration.
    pub async fn request_focus(&mut self, target: ModeId) -> Result<(), SupervisorError> {
        self.process(vec![Request::Focus(target)]).await
    }

    /// Sends a message on behalf of the supervisor.
    pub async fn send(&mut self, receiver: Address, payload: Payload) -> Result<(), SupervisorError> {
        let message = Message {
            sender: Address::Supervisor,
            receiver,
            payload,
        };
        self.process(vec![Request::Send(message)]).await
    }

    async fn enter_focused(&mut self) -> Result<(), SupervisorError> {
        self.pending_enter = false;
        let id = self.registry.id(self.focused).clone();
        match &self.previous {
            Some(previous) => info!("focus {previous} -> {id}"),
            None => info!("focus -> {id}"),
        }
        let previous = self.previous.clone();
        let mut ctx = ModeContext::new(id);
        self.registry
            .get_mut(self.focused)
            .on_focus_enter(previous.as_ref(), &mut ctx)
            .await;
        self.session = FrameSession::open();
        self.process(ctx.into_requests()).await
    }

    fn present(&mut self, pulled: Pulled) -> Result<(), SupervisorError> {
        match pulled? {
            Some((frame, permit)) => {
                if self.screenshot_dir.is_some() {
                    self.last_frame = Some(frame.clone());
                }
                permit.send(frame);
                self.session.record_frame();
            }
            None => {
                debug!(
                    "{} finished its frames after {}",
                    self.focused(),
                    self.session.produced()
                );
                self.session.exhaust();
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, event: InputEvent) -> Result<(), SupervisorError> {
        match event {
            InputEvent::LongPress {
                control: ControlId::Cross,
            } => {
                self.toggle_sleep();
                return Ok(());
            }
            _ if self.asleep => {
                debug!("asleep, ignoring {event:?}");
                return Ok(());
            }
            InputEvent::Control {
                control: ControlId::Square,
                edge,
            } => {
                if edge == Edge::Press {
                    self.rotate();
                }
                return Ok(());
            }
            InputEvent::LongPress {
                control: ControlId::Square,
            } => {
                self.screenshot().await;
                return Ok(());
            }
            _ => {}
        }

        let event = oriented(event, self.orientation);
        let mut ctx = ModeContext::new(self.registry.id(self.focused).clone());
        self.registry
            .get_mut(self.focused)
            .on_input(event, &mut ctx)
            .await;
        self.process(ctx.into_requests()).await
    }

    /// Carries out requests in order. Requests raised while handling one
    /// are queued behind the rest.
    async fn process(&mut self, requests: Vec<Request>) -> Result<(), SupervisorError> {
        let mut queue = VecDeque::from(requests);
        while let Some(request) = queue.pop_front() {
            match request {
                Request::Focus(target) => queue.extend(self.begin_transfer(&target).await?),
                Request::Send(message) => {
                    match MessageBus::route(&mut self.registry, message).await? {
                        Routed::Delivered(ctx) => queue.extend(ctx.into_requests()),
                        Routed::Supervisor { sender, payload } => {
                            if let Some(target) = self.handle_message(&sender, payload).await {
                                queue.push_back(Request::Focus(target));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn begin_transfer(&mut self, target: &ModeId) -> Result<Vec<Request>, SupervisorError> {
        let slot = self.registry.lookup(target)?;
        if self.pending_enter {
            // the mode we were about to enter never saw focus, so it gets no exit
            debug!("focus retargeted {} -> {target}", self.focused());
            self.focused = slot;
            return Ok(Vec::new());
        }
        let old = self.registry.id(self.focused).clone();
        let mut ctx = ModeContext::new(old.clone());
        self.registry
            .get_mut(self.focused)
            .on_focus_exit(&mut ctx)
            .await;
        self.session.abandon();
        self.previous = Some(old);
        self.focused = slot;
        self.pending_enter = true;
        Ok(ctx.into_requests())
    }

    /// Returns a focus target for navigation messages.
    async fn handle_message(&mut self, sender: &Address, payload: Payload) -> Option<ModeId> {
        match payload {
            Payload::Navigate(target) => return Some(target),
            Payload::Command(command) => {
                info!("{sender} requested {command}");
                let result = match command.as_str() {
                    "poweroff" => self.power.power_off().await,
                    "reboot" => self.power.reboot().await,
                    "restart" => self.power.restart().await,
                    other => {
                        warn!("unknown supervisor command {other} from {sender}");
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    error!("{command} failed: {e}");
                }
            }
            other => debug!("supervisor ignoring {other:?} from {sender}"),
        }
        None
    }

    fn rotate(&mut self) {
        self.orientation = self.orientation.next();
        info!("orientation {}", self.orientation.degrees());
        for mode in self.registry.iter_mut() {
            mode.set_orientation(self.orientation);
        }
    }

    fn toggle_sleep(&mut self) {
        self.asleep = !self.asleep;
        info!("{}", if self.asleep { "sleeping" } else { "waking" });
        self.pipeline.set_backlight(!self.asleep);
    }

    async fn screenshot(&mut self) {
        let (Some(dir), Some(frame)) = (&self.screenshot_dir, &self.last_frame) else {
            warn!("no screenshot directory or nothing shown yet");
            return;
        };
        let path = dir.join(crate::timestamped_name("screenshot", Local::now(), "png"));
        let frame = frame.clone();
        let saved = tokio::task::spawn_blocking(move || save_png(&frame, &path).map(|_| path)).await;
        match saved {
            Ok(Ok(path)) => info!("saved screenshot {}", path.display()),
            Ok(Err(e)) => warn!("failed to save screenshot: {e}"),
            Err(e) => warn!("screenshot task failed: {e}"),
        }
    }
}

/// Reserves the display slot first so the frame is produced only once the
/// display can take it. Dropping this future releases the reservation.
async fn pull_frame(registry: &mut ModeRegistry, slot: usize, pipeline: &DisplayPipeline) -> Pulled {
    let permit = pipeline.reserve().await?;
    let frame = registry.get_mut(slot).next_frame().await;
    Ok(frame.map(|frame| (frame, permit)))
}

fn oriented(event: InputEvent, orientation: Orientation) -> InputEvent {
    match event {
        InputEvent::Control { control, edge } => InputEvent::Control {
            control: control.remap(orientation),
            edge,
        },
        InputEvent::LongPress { control } => InputEvent::LongPress {
            control: control.remap(orientation),
        },
        InputEvent::Encoder(_) => event,
    }
}

fn save_png(frame: &Frame, path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let bytes = frame
        .encode(image::ImageFormat::Png)
        .map_err(std::io::Error::other)?;
    std::fs::write(path, bytes)
}

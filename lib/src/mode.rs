use async_trait::async_trait;

use crate::bus::{Address, ModeContext, ModeId, Payload};
use crate::frame::{Frame, Orientation};
use crate::input::InputEvent;

/// A unit of control that can hold focus.
///
/// The supervisor calls these from its own task only, one at a time. While
/// the mode holds focus the supervisor keeps pulling [Mode::next_frame];
/// that future is dropped whenever input arrives or focus moves, so it must
/// be cancel safe: only commit state once the frame is ready.
#[async_trait]
pub trait Mode: Send {
    fn id(&self) -> &ModeId;

    async fn on_input(&mut self, event: InputEvent, ctx: &mut ModeContext);

    /// Called before the first frame pull of a focus session.
    async fn on_focus_enter(&mut self, previous: Option<&ModeId>, ctx: &mut ModeContext);

    /// Called once when focus moves away. Per-session resources such as open
    /// video handles should be released here.
    async fn on_focus_exit(&mut self, ctx: &mut ModeContext);

    /// The next frame of this focus session, or `None` once the session has
    /// nothing more to show. A mode with nothing new to draw should stay
    /// pending rather than return a duplicate.
    async fn next_frame(&mut self) -> Option<Frame>;

    async fn receive_message(&mut self, sender: &Address, payload: Payload, ctx: &mut ModeContext);

    /// Delivered to every registered mode, focused or not.
    fn set_orientation(&mut self, orientation: Orientation);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the focused mode's enter hook.
    Pending,
    Open,
    /// The mode returned `None`; nothing is pulled until the next focus entry.
    Exhausted,
    /// Focus moved away mid-sequence.
    Abandoned,
}

/// Tracks the frame sequence of the focused mode for one focus session.
#[derive(Debug, Clone)]
pub struct FrameSession {
    state: SessionState,
    produced: u64,
}

impl Default for FrameSession {
    fn default() -> Self {
        Self {
            state: SessionState::Pending,
            produced: 0,
        }
    }
}

impl FrameSession {
    pub fn open() -> Self {
        Self {
            state: SessionState::Open,
            produced: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    pub fn produced(&self) -> u64 {
        self.produced
    }

    pub fn record_frame(&mut self) {
        self.produced += 1;
    }

    pub fn exhaust(&mut self) {
        if self.state == SessionState::Open {
            self.state = SessionState::Exhausted;
        }
    }

    /// Stops pulling without draining. Idempotent.
    pub fn abandon(&mut self) {
        if matches!(self.state, SessionState::Open | SessionState::Pending) {
            self.state = SessionState::Abandoned;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_lifecycle() {
        let mut session = FrameSession::open();
        assert!(session.is_open());
        session.record_frame();
        session.abandon();
        assert_eq!(session.state(), SessionState::Abandoned);
        assert_eq!(session.produced(), 1);

        session.exhaust();
        assert_eq!(session.state(), SessionState::Abandoned);
    }

    #[test]
    fn test_exhausted_session_stays_closed() {
        let mut session = FrameSession::open();
        session.exhaust();
        assert!(!session.is_open());
        session.abandon();
        assert_eq!(session.state(), SessionState::Exhausted);
    }
}

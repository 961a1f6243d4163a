//! Addressed messaging between modes and the supervisor.
//!
//! Modes never hold references to each other. A handler records what it
//! wants to happen in its [ModeContext]; the supervisor drains the context
//! right after the handler returns, routing each message through
//! [MessageBus::route] against the same registry used for focus transfers.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mode::Mode;
use crate::options::{OptionTree, OptionValue};

/// Identifies a registered mode instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModeId(Cow<'static, str>);

impl ModeId {
    pub const fn from_static(id: &'static str) -> Self {
        ModeId(Cow::Borrowed(id))
    }

    pub fn new(id: impl Into<String>) -> Self {
        ModeId(Cow::Owned(id.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModeId {
    fn from(id: &str) -> Self {
        ModeId::new(id)
    }
}

const SUPERVISOR: &str = "Supervisor";

/// Sender or receiver of a [Message].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Address {
    Supervisor,
    Mode(ModeId),
}

impl From<String> for Address {
    fn from(value: String) -> Self {
        if value == SUPERVISOR {
            Address::Supervisor
        } else {
            Address::Mode(ModeId::new(value))
        }
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.to_string()
    }
}

impl From<ModeId> for Address {
    fn from(id: ModeId) -> Self {
        Address::Mode(id)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Supervisor => f.write_str(SUPERVISOR),
            Address::Mode(id) => id.fmt(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A mode announcing itself as the owner of the menu section the
    /// receiving menu should show.
    Attach(ModeId),
    /// The owner's settings after a change, starting at `menu_id`.
    Settings { menu_id: String, tree: OptionTree },
    ApplyOption { option_id: String, value: OptionValue },
    Navigate(ModeId),
    Command(String),
    Value(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub sender: Address,
    pub receiver: Address,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Focus(ModeId),
    Send(Message),
}

/// Collects the focus requests and messages a handler issues.
#[derive(Debug)]
pub struct ModeContext {
    me: Address,
    requests: Vec<Request>,
}

impl ModeContext {
    pub fn new(me: impl Into<Address>) -> Self {
        Self {
            me: me.into(),
            requests: Vec::new(),
        }
    }

    pub fn me(&self) -> &Address {
        &self.me
    }

    pub fn request_focus(&mut self, target: ModeId) {
        self.requests.push(Request::Focus(target));
    }

    pub fn send(&mut self, receiver: impl Into<Address>, payload: Payload) {
        self.requests.push(Request::Send(Message {
            sender: self.me.clone(),
            receiver: receiver.into(),
            payload,
        }));
    }

    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    pub fn into_requests(self) -> Vec<Request> {
        self.requests
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("no mode registered as {0}")]
pub struct LookupError(pub ModeId);

/// The set of registered modes, owned by the supervisor.
#[derive(Default)]
pub struct ModeRegistry {
    modes: Vec<Box<dyn Mode>>,
    index: HashMap<ModeId, usize>,
}

impl ModeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a mode. Returns the mode back if its id is already taken.
    pub fn register(&mut self, mode: Box<dyn Mode>) -> Result<usize, Box<dyn Mode>> {
        let id = mode.id().clone();
        if self.index.contains_key(&id) {
            return Err(mode);
        }
        let slot = self.modes.len();
        self.modes.push(mode);
        self.index.insert(id, slot);
        Ok(slot)
    }

    pub fn lookup(&self, id: &ModeId) -> Result<usize, LookupError> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| LookupError(id.clone()))
    }

    pub fn get_mut(&mut self, slot: usize) -> &mut dyn Mode {
        self.modes[slot].as_mut()
    }

    pub fn id(&self, slot: usize) -> &ModeId {
        self.modes[slot].id()
    }

    pub fn len(&self) -> usize {
        self.modes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Mode>> {
        self.modes.iter_mut()
    }
}

/// Where a routed message ended up.
#[derive(Debug)]
pub enum Routed {
    /// Addressed to the supervisor, which handles it itself.
    Supervisor { sender: Address, payload: Payload },
    /// Delivered to a mode. Holds whatever the receiver asked for in turn.
    Delivered(ModeContext),
}

pub struct MessageBus;

impl MessageBus {
    /// Delivers `message` at most once. An unknown receiver is a wiring bug
    /// and is returned as an error without delivering anything.
    pub async fn route(
        registry: &mut ModeRegistry,
        message: Message,
    ) -> Result<Routed, LookupError> {
        let Message {
            sender,
            receiver,
            payload,
        } = message;
        match receiver {
            Address::Supervisor => Ok(Routed::Supervisor { sender, payload }),
            Address::Mode(id) => {
                let slot = registry.lookup(&id)?;
                let mut ctx = ModeContext::new(id);
                registry
                    .get_mut(slot)
                    .receive_message(&sender, payload, &mut ctx)
                    .await;
                Ok(Routed::Delivered(ctx))
            }
        }
    }
}

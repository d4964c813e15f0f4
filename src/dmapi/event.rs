//! Event messages as a lazy, finite sequence (§9 design notes: "Event
//! batch walked via struct-stepping macros" becomes a plain `Vec` here
//! since a batch is bounded and not restartable anyway).

use super::{Handle, TokenId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Mount,
    Read,
    Write,
    Truncate,
    Destroy,
    Other,
}

#[derive(Debug, Clone)]
pub struct MountEvent {
    pub root_handle: Handle,
}

/// One event delivered by `get_events`. `token` is `None` for a
/// sentinel/invalid token some backends attach to a destroy message
/// (§4.3.2): such a message must never be responded to.
#[derive(Debug, Clone)]
pub struct EventMessage {
    pub ev_type: EventType,
    pub token: Option<TokenId>,
    pub handle: Option<Handle>,
    pub mount: Option<MountEvent>,
}

impl EventMessage {
    pub fn has_real_token(&self) -> bool {
        self.token.is_some()
    }
}

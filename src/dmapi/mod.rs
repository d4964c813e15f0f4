//! The DMAPI access layer: the trait every protocol module (migrator,
//! daemon) is written against, plus the RAII types that replace the
//! source's raw-pointer-plus-length handles and ambient-global tokens
//! (§9 design notes).
//!
//! Two backends implement [`DmSession`]: [`sys`] (real `extern "C"`
//! bindings to `libdm`, gated behind the `real-dmapi` feature) and
//! [`virtual_session`] (an in-process simulation used by tests and by
//! anyone developing away from a DMAPI-capable filesystem).

pub mod event;
#[cfg(feature = "real-dmapi")]
pub mod sys;
pub mod virtual_session;

use std::path::Path;

use crate::error::HsmResult;
pub use event::{EventMessage, EventType, MountEvent};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventSet: u32 {
        const MOUNT     = 1 << 0;
        const READ      = 1 << 1;
        const WRITE     = 1 << 2;
        const TRUNCATE  = 1 << 3;
        const DESTROY   = 1 << 4;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub offset: u64,
    /// 0 means "whole file".
    pub size: u64,
    pub flags: RegionFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Right {
    None,
    Shared,
    Exclusive,
}

/// Response code a handler closes a token with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Let the kernel retry the original syscall (or, for a
    /// user-created token, simply release rights).
    Continue,
    /// Fail the original syscall with the given errno.
    Abort(i32),
}

/// An owned, opaque file handle. The destructor frees the underlying
/// kernel resource (`dm_handle_free` in the source); callers never see
/// the raw pointer-plus-length pair.
#[derive(Debug, Clone)]
pub struct Handle(pub(crate) Vec<u8>);

impl Handle {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The global handle (`DM_GLOBAL_HANP`/`DM_GLOBAL_HLEN` in the
    /// source): not tied to any filesystem, used only to register for
    /// `MOUNT` events before any filesystem has been mounted (§4.3
    /// startup step 3).
    pub fn global() -> Self {
        Handle(Vec::new())
    }
}

/// An event token. Must be responded to exactly once; `already_responded`
/// turns a double-response into a caught programming error instead of an
/// ignored duplicate kernel call. This is the scoped "event response"
/// guard called for in §9: construct with [`Token::new`], call
/// [`Token::mark_responded`] from the one place that actually calls
/// `respond_event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenId(pub u64);

pub struct Token {
    pub id: TokenId,
    responded: bool,
}

impl Token {
    pub fn new(id: TokenId) -> Self {
        Token { id, responded: false }
    }

    pub fn mark_responded(&mut self) {
        self.responded = true;
    }

    pub fn is_responded(&self) -> bool {
        self.responded
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        if !self.responded {
            log::warn!("token {:?} dropped without a response", self.id);
        }
    }
}

/// Everything the migration/daemon protocol needs from DMAPI.
///
/// Implemented by [`sys::SysSession`] (real) and
/// [`virtual_session::VirtualSession`] (simulated).
pub trait DmSession {
    fn path_to_handle(&self, path: &Path) -> HsmResult<Handle>;

    fn create_userevent(&self) -> HsmResult<Token>;

    fn request_right(&self, handle: &Handle, token: &Token, right: Right) -> HsmResult<()>;
    fn downgrade_right(&self, handle: &Handle, token: &Token) -> HsmResult<()>;
    fn upgrade_right(&self, handle: &Handle, token: &Token) -> HsmResult<()>;
    fn release_right(&self, handle: &Handle, token: &Token) -> HsmResult<()>;

    fn get_dmattr(&self, handle: &Handle, token: &Token, name: &str) -> HsmResult<Option<Vec<u8>>>;
    fn set_dmattr(&self, handle: &Handle, token: &Token, name: &str, value: &[u8]) -> HsmResult<()>;
    fn remove_dmattr(&self, handle: &Handle, token: &Token, name: &str) -> HsmResult<()>;

    fn set_region(&self, handle: &Handle, token: &Token, regions: &[Region]) -> HsmResult<()>;
    fn punch_hole(&self, handle: &Handle, token: &Token, offset: u64, size: u64) -> HsmResult<()>;

    fn read_invis(&self, handle: &Handle, token: &Token, offset: u64, buf: &mut [u8]) -> HsmResult<usize>;
    fn write_invis(&self, handle: &Handle, token: &Token, offset: u64, buf: &[u8]) -> HsmResult<usize>;

    fn respond_event(&self, token: &mut Token, response: Response) -> HsmResult<()>;

    fn set_disp(&self, handle: &Handle, events: EventSet) -> HsmResult<()>;
    fn set_eventlist(&self, handle: &Handle, events: EventSet) -> HsmResult<()>;

    /// Fetch the next batch of pending event messages. Empty in
    /// non-blocking/polling mode when nothing is ready.
    fn get_events(&self, wait: bool) -> HsmResult<Vec<EventMessage>>;

    /// List the tokens outstanding on this session (used by recovery
    /// and cleanup mode, §4.2/§4.4).
    fn outstanding_tokens(&self) -> HsmResult<Vec<TokenId>>;

    /// Look up the original event message for a token, for recovery.
    fn find_eventmsg(&self, token: TokenId) -> HsmResult<Option<EventMessage>>;
}

/// `recover_or_create(name)`: the two-phase listing-then-creating dance
/// (§9) that lets a daemon restart without orphaning its predecessor's
/// tokens. Generic over any `DmSession` implementation that also offers
/// session-level recovery through its own constructor; concretely only
/// [`sys::SysSession::recover_or_create`] and
/// [`virtual_session::VirtualSession::recover_or_create`] exist, since the
/// session name is tied to how the backend opens its session in the
/// first place.
pub mod session {
    /// Marker trait implemented by both backends' session constructors,
    /// documented here so the intent ("recover by name, else create") is
    /// visible from one place even though each backend's mechanics
    /// differ (kernel session table vs. in-process map).
    pub trait RecoverOrCreate: Sized {
        fn recover_or_create(name: &str) -> crate::error::HsmResult<Self>;
    }
}

//! Crate-local error type.
//!
//! Mirrors the rest of the ambient stack: `thiserror` for the enum that
//! call sites match on, `anyhow::Error` everywhere a function only needs
//! to propagate with context.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HsmError {
    #[error("dmapi transport error: {0}")]
    Transport(String),

    #[error("dmapi session is stale, needs reinitialization")]
    Stale,

    #[error("bad hacksm attribute magic {0:?}, expected \"HSM1\"")]
    BadMagic([u8; 4]),

    #[error("hacksm attribute has wrong length: got {0}, expected {1}")]
    BadAttrLen(usize, usize),

    #[error("hacksm attribute has invalid state value {0}")]
    BadState(u32),

    #[error("attribute is in unexpected state {0:?}, expected {1:?}")]
    UnexpectedState(crate::attr::HsmState, crate::attr::HsmState),

    #[error("no hacksm attribute present on file")]
    NoAttribute,

    #[error("store object for 0x{device:x}:0x{inode:x} not found")]
    StoreObjectMissing { device: u64, inode: u64 },

    #[error("store I/O error: {0}")]
    StoreIo(#[source] std::io::Error),

    #[error("short write to store: wrote {wrote} of {requested} bytes")]
    ShortWrite { wrote: usize, requested: usize },

    #[error("path {0:?} is not a regular file")]
    NotRegularFile(std::path::PathBuf),

    #[error("file {0:?} has zero size")]
    ZeroSize(std::path::PathBuf),

    #[error("right acquisition failed: {0}")]
    RightDenied(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type HsmResult<T> = Result<T, HsmError>;

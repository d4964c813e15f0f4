//! The listing tool (`hacksm_ls`): a read-only inspector. Peripheral to
//! the core protocol (§1), but useful enough in the test suite that its
//! logic is factored out of the binary for direct unit testing.

use std::path::Path;

use crate::attr::HSM_ATTRNAME;
use crate::dmapi::{DmSession, Right};
use crate::error::HsmResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listing {
    /// `m <size> <state> <path>`
    Managed { size: u64, state: u32, path: String },
    /// `p           <path>`
    Plain { path: String },
}

impl std::fmt::Display for Listing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Listing::Managed { size, state, path } => write!(f, "m {:7} {}  {}", size, state, path),
            Listing::Plain { path } => write!(f, "p            {}", path),
        }
    }
}

pub fn ls(sess: &impl DmSession, path: &Path) -> HsmResult<Listing> {
    let handle = sess.path_to_handle(path)?;
    let mut token = sess.create_userevent()?;

    sess.request_right(&handle, &token, Right::Shared)?;
    let raw = sess.get_dmattr(&handle, &token, HSM_ATTRNAME)?;
    sess.release_right(&handle, &token)?;

    let result = match raw {
        None => Listing::Plain { path: path.display().to_string() },
        Some(raw) => {
            let attr = crate::attr::HsmAttr::decode(&raw)?;
            Listing::Managed { size: attr.size, state: attr.state as u32, path: path.display().to_string() }
        }
    };

    sess.respond_event(&mut token, crate::dmapi::Response::Continue)?;
    Ok(result)
}

//! The destroy handler (§4.3.2). One documented bug in the original C
//! source double-unlinks the store object (intending the second unlink
//! to be the attribute removal); this implementation unlinks once, then
//! removes the attribute, in that order (§9 open question).

use crate::attr::{HsmAttr, HSM_ATTRNAME};
use crate::dmapi::{DmSession, Handle, Response, Right, Token};
use crate::error::HsmResult;
use crate::store::Store;

/// `has_real_token` mirrors the source's handling of a sentinel/invalid
/// token some DMAPI implementations attach to destroy messages: when
/// false, the handler must not call `respond_event` at all.
pub fn handle_destroy(
    sess: &impl DmSession,
    store: &Store,
    handle: &Handle,
    token: Option<&mut Token>,
) -> HsmResult<()> {
    let Some(token) = token else {
        return Ok(());
    };

    let result = destroy_inner(sess, store, handle, token);
    if let Err(ref e) = result {
        log::warn!("destroy handler cleanup failed: {}", e);
    }
    sess.respond_event(token, Response::Continue)?;
    Ok(())
}

fn destroy_inner(sess: &impl DmSession, store: &Store, handle: &Handle, token: &Token) -> HsmResult<()> {
    sess.request_right(handle, token, Right::Exclusive)?;

    let raw = match sess.get_dmattr(handle, token, HSM_ATTRNAME)? {
        Some(raw) => raw,
        None => return Ok(()),
    };
    let attr = HsmAttr::decode(&raw)?;

    if let Err(e) = store.remove(attr.device, attr.inode) {
        log::warn!("failed to unlink store object for 0x{:x}:0x{:x}: {}", attr.device, attr.inode, e);
    }
    sess.remove_dmattr(handle, token, HSM_ATTRNAME)?;
    sess.set_region(handle, token, &[])?;
    Ok(())
}

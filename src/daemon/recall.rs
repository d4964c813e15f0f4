//! The recall handler (§4.3.1): brings a migrated file's data back on
//! first access.

use rand::Rng;
use std::time::Duration;

use crate::attr::{HsmAttr, HsmState, HSM_ATTRNAME};
use crate::config::Config;
use crate::dmapi::{DmSession, Handle, Response, Right, Token};
use crate::error::HsmResult;
use crate::store::Store;

const RECALL_CHUNK: usize = 0x10000;

/// `suppress_delay` is set during recovery (§4.4), where re-dispatching
/// a replayed event should not re-roll the test-only randomized delay.
pub fn handle_recall(
    sess: &impl DmSession,
    store: &Store,
    cfg: &Config,
    handle: &Handle,
    token: &mut Token,
    suppress_delay: bool,
) -> HsmResult<()> {
    let result = recall_inner(sess, store, cfg, handle, token, suppress_delay);
    let response = match result {
        Ok(()) => Response::Continue,
        Err(ref e) => {
            log::error!("recall failed: {}", e);
            Response::Abort(libc::EIO)
        }
    };
    sess.respond_event(token, response)?;
    result
}

fn recall_inner(
    sess: &impl DmSession,
    store: &Store,
    cfg: &Config,
    handle: &Handle,
    token: &Token,
    suppress_delay: bool,
) -> HsmResult<()> {
    sess.request_right(handle, token, Right::Exclusive)?;

    let raw = match sess.get_dmattr(handle, token, HSM_ATTRNAME)? {
        Some(raw) => raw,
        None => {
            log::info!("file already recalled by a peer handler");
            return Ok(());
        }
    };
    let attr = HsmAttr::decode(&raw)?;

    let in_progress = HsmAttr { state: HsmState::Recall, ..attr };
    sess.set_dmattr(handle, token, HSM_ATTRNAME, &in_progress.encode())?;

    let mut store_handle = store.open(attr.device, attr.inode, true)?;

    if !suppress_delay && cfg.recall_delay_ceiling_secs > 0 {
        let secs = rand::thread_rng().gen_range(0..=cfg.recall_delay_ceiling_secs);
        std::thread::sleep(Duration::from_secs(secs));
    }

    let mut buf = [0u8; RECALL_CHUNK];
    let mut offset = 0u64;
    loop {
        let n = store_handle.read(&mut buf)?;
        if n == 0 {
            break;
        }
        sess.write_invis(handle, token, offset, &buf[..n])?;
        offset += n as u64;
    }

    sess.remove_dmattr(handle, token, HSM_ATTRNAME)?;

    if let Err(e) = store.remove(attr.device, attr.inode) {
        log::warn!("failed to unlink store object after recall: {}", e);
    }

    sess.set_region(handle, token, &[])?;

    log::info!("recalled file 0x{:x}:0x{:x} ({} bytes)", attr.device, attr.inode, attr.size);
    Ok(())
}

//! Daemon restart recovery (§4.4).
//!
//! A `START` attribute left behind by a dead migrator needs no action
//! here: the file still has valid data, and either a later `migrate`
//! invocation or an incoming user I/O event will drive it forward. A
//! `RECALL` attribute left behind by a dead daemon is handled simply by
//! the recall handler being idempotent — the next access (or, as here,
//! the replay of the event that was in flight) re-enters it safely.

use crate::config::Config;
use crate::dmapi::{DmSession, Response};
use crate::error::HsmResult;
use crate::store::Store;

use super::dispatch_one;

pub fn recover(sess: &impl DmSession, store: &Store, cfg: &Config) -> HsmResult<()> {
    let outstanding = sess.outstanding_tokens()?;
    log::info!("recovering {} outstanding token(s)", outstanding.len());

    for token_id in outstanding {
        match sess.find_eventmsg(token_id)? {
            Some(msg) if msg.token == Some(token_id) => {
                log::info!("replaying event {:?} for recovered token {:?}", msg.ev_type, token_id);
                dispatch_one(sess, store, cfg, msg, true)?;
            }
            _ => {
                log::warn!("token {:?} has no matching event message, aborting it", token_id);
                let mut token = crate::dmapi::Token::new(token_id);
                sess.respond_event(&mut token, Response::Abort(libc::EINTR))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dmapi::virtual_session::{VirtualFs, VirtualSession};

    #[test]
    fn recovery_with_no_outstanding_tokens_is_a_no_op() {
        let fs = VirtualFs::new();
        let sess = VirtualSession::new(fs, "hacksmd");
        let dir = tempfile::tempdir().unwrap();
        let store = Store::init(dir.path()).unwrap();
        recover(&sess, &store, &Config::default()).unwrap();
    }
}

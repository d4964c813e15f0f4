//! The migrator (M), §4.2: drives a file from resident to migrated.

use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::attr::{HsmAttr, HsmState, HSM_ATTRNAME};
use crate::config::Config;
use crate::dmapi::{DmSession, Region, RegionFlags, Response, Right};
use crate::error::{HsmError, HsmResult};
use crate::store::Store;

const ANTI_THRASH_SECS: u64 = 60;
const COPY_CHUNK: usize = 0x1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Migrated,
    Skipped(String),
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

/// Migrate one path. Every post-copy failure unlinks the partial store
/// object and aborts the event with `CONTINUE` (no kernel retry is
/// possible for a user-created token); the response call happens on
/// every exit path via the `respond` closure below.
pub fn migrate(sess: &impl DmSession, store: &Store, cfg: &Config, path: &Path) -> HsmResult<Outcome> {
    let handle = sess.path_to_handle(path)?;
    let mut token = sess.create_userevent()?;

    let result = migrate_inner(sess, store, cfg, path, &handle, &token);

    sess.respond_event(&mut token, Response::Continue)?;
    result
}

fn migrate_inner(
    sess: &impl DmSession,
    store: &Store,
    cfg: &Config,
    path: &Path,
    handle: &crate::dmapi::Handle,
    token: &crate::dmapi::Token,
) -> HsmResult<Outcome> {
    // Getting EXCL first then downgrading is more reliable than going
    // straight to SHARED (observed race on at least one target fs).
    sess.request_right(handle, token, Right::Exclusive)?;
    sess.downgrade_right(handle, token)?;

    if let Some(raw) = sess.get_dmattr(handle, token, HSM_ATTRNAME)? {
        let existing = HsmAttr::decode(&raw)?;
        match existing.state {
            HsmState::Start => {
                if existing.migrate_time + ANTI_THRASH_SECS > now_secs() {
                    return Ok(Outcome::Skipped("recent partially migrated file".into()));
                }
                log::info!("continuing migration of partly migrated file {:?}", path);
                store.remove(existing.device, existing.inode)?;
            }
            HsmState::Migrated | HsmState::Recall => {
                return Ok(Outcome::Skipped("already migrated".into()));
            }
        }
    }

    let meta = std::fs::symlink_metadata(path).map_err(HsmError::StoreIo)?;
    if !meta.is_file() {
        return Ok(Outcome::Skipped(format!("{:?} is not a regular file", path)));
    }
    if meta.len() == 0 {
        return Ok(Outcome::Skipped(format!("{:?} has zero size", path)));
    }

    let device = meta.dev();
    let inode = meta.ino();
    let size = meta.len();

    if let Err(e) = copy_to_store(sess, store, handle, token, device, inode, size) {
        let _ = store.remove(device, inode);
        return Err(e);
    }

    if cfg.quiescence_gap_enabled {
        quiescence_sleep(cfg);
    }

    sess.upgrade_right(handle, token)?;

    let attr = HsmAttr { migrate_time: now_secs(), size, device, inode, state: HsmState::Start };
    if let Err(e) = sess.set_dmattr(handle, token, HSM_ATTRNAME, &attr.encode()) {
        let _ = store.remove(device, inode);
        return Err(e);
    }

    let region = Region { offset: 0, size, flags: RegionFlags::READ | RegionFlags::WRITE };
    if let Err(e) = sess.set_region(handle, token, &[region]) {
        let _ = store.remove(device, inode);
        return Err(e);
    }

    // Give reads that slipped in between the attribute/region writes
    // another chance to drain before we punch the hole.
    sess.downgrade_right(handle, token)?;
    if cfg.quiescence_gap_enabled {
        quiescence_sleep(cfg);
    }
    sess.upgrade_right(handle, token)?;

    let raw = sess.get_dmattr(handle, token, HSM_ATTRNAME)?;
    let current = match raw {
        Some(raw) => HsmAttr::decode(&raw)?,
        None => {
            log::warn!("abandoning partial migrate of {:?} - attribute gone", path);
            return Ok(Outcome::Skipped("attribute disappeared, a peer took over".into()));
        }
    };
    if current.state != HsmState::Start {
        log::warn!("abandoning partial migrate of {:?} - state={:?}", path, current.state);
        return Ok(Outcome::Skipped(format!("state changed to {:?} underneath us", current.state)));
    }

    if let Err(e) = sess.punch_hole(handle, token, 0, size) {
        let _ = store.remove(device, inode);
        return Err(e);
    }

    let final_attr = HsmAttr { state: HsmState::Migrated, ..attr };
    if let Err(e) = sess.set_dmattr(handle, token, HSM_ATTRNAME, &final_attr.encode()) {
        let _ = store.remove(device, inode);
        return Err(e);
    }

    log::info!("migrated {:?} ({} bytes)", path, size);
    Ok(Outcome::Migrated)
}

fn copy_to_store(
    sess: &impl DmSession,
    store: &Store,
    handle: &crate::dmapi::Handle,
    token: &crate::dmapi::Token,
    device: u64,
    inode: u64,
    size: u64,
) -> HsmResult<()> {
    let mut out = store.open(device, inode, false)?;
    let mut buf = [0u8; COPY_CHUNK];
    let mut offset = 0u64;
    while offset < size {
        let n = sess.read_invis(handle, token, offset, &mut buf)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        offset += n as u64;
    }
    out.close()
}

fn quiescence_sleep(cfg: &Config) {
    if cfg.wait_time_ms > 0 {
        std::thread::sleep(Duration::from_millis(cfg.wait_time_ms));
    }
}

/// Cleanup mode (`-c`): respond `CONTINUE/0` to every token left
/// outstanding by a crashed prior invocation of M.
pub fn cleanup_tokens(sess: &impl DmSession) -> HsmResult<usize> {
    let tokens = sess.outstanding_tokens()?;
    let mut n = 0;
    for id in tokens {
        let mut token = crate::dmapi::Token::new(id);
        sess.respond_event(&mut token, Response::Continue)?;
        n += 1;
    }
    Ok(n)
}

//! Real bindings to the platform DMAPI library (`libdm`).
//!
//! Incomplete by design — only the entry points the protocol in this
//! crate actually calls are declared, in the same spirit as the
//! `libsgutils2` bindings this codebase's lineage carries for SCSI
//! generic I/O: a thin `extern "C"` block, an opaque handle type with a
//! `Drop` impl that frees it, and a safe wrapper on top that upholds the
//! invariants (handle length always matches the buffer, tokens always
//! get responded).
//!
//! Gated behind the `real-dmapi` feature; the default build and test
//! suite exercise the protocol through
//! [`crate::dmapi::virtual_session`] instead.

#![allow(non_camel_case_types)]

use std::ffi::CString;
use std::os::raw::{c_char, c_int, c_void};
use std::path::Path;

use super::{
    DmSession, EventMessage, EventSet, Handle, Region, Response, Right, Token, TokenId,
};
use crate::error::{HsmError, HsmResult};

pub type dm_sessid_t = c_int;
pub type dm_token_t = u64;

pub const DM_NO_SESSION: dm_sessid_t = 0;
pub const DM_NO_TOKEN: dm_token_t = 0;

#[link(name = "dm")]
extern "C" {
    fn dm_init_service(version: *mut *mut c_char) -> c_int;
    fn dm_create_session(old: dm_sessid_t, name: *const c_char, new: *mut dm_sessid_t) -> c_int;
    fn dm_getall_sessions(nelem: u32, buf: *mut dm_sessid_t, rlen: *mut u32) -> c_int;
    fn dm_query_session(sid: dm_sessid_t, buflen: usize, buf: *mut c_char, rlen: *mut usize) -> c_int;

    fn dm_path_to_handle(path: *const c_char, hanp: *mut *mut c_void, hlen: *mut usize) -> c_int;
    fn dm_handle_free(hanp: *mut c_void, hlen: usize);

    fn dm_create_userevent(sid: dm_sessid_t, msglen: usize, msg: *const c_void, token: *mut dm_token_t) -> c_int;
    fn dm_request_right(sid: dm_sessid_t, hanp: *const c_void, hlen: usize, token: dm_token_t, flags: c_int, right: c_int) -> c_int;
    fn dm_release_right(sid: dm_sessid_t, hanp: *const c_void, hlen: usize, token: dm_token_t) -> c_int;
    fn dm_upgrade_right(sid: dm_sessid_t, hanp: *const c_void, hlen: usize, token: dm_token_t) -> c_int;
    fn dm_downgrade_right(sid: dm_sessid_t, hanp: *const c_void, hlen: usize, token: dm_token_t) -> c_int;

    fn dm_get_dmattr(sid: dm_sessid_t, hanp: *const c_void, hlen: usize, token: dm_token_t, attrname: *const c_char, buflen: usize, buf: *mut c_void, rlen: *mut usize) -> c_int;
    fn dm_set_dmattr(sid: dm_sessid_t, hanp: *const c_void, hlen: usize, token: dm_token_t, attrname: *const c_char, setdtime: c_int, buflen: usize, buf: *const c_void) -> c_int;
    fn dm_remove_dmattr(sid: dm_sessid_t, hanp: *const c_void, hlen: usize, token: dm_token_t, setdtime: c_int, attrname: *const c_char) -> c_int;

    fn dm_set_region(sid: dm_sessid_t, hanp: *const c_void, hlen: usize, token: dm_token_t, nelem: u32, regbufp: *const c_void, exactflagp: *mut c_int) -> c_int;
    fn dm_punch_hole(sid: dm_sessid_t, hanp: *const c_void, hlen: usize, token: dm_token_t, off: u64, len: u64) -> c_int;

    fn dm_read_invis(sid: dm_sessid_t, hanp: *const c_void, hlen: usize, token: dm_token_t, off: u64, len: usize, bufp: *mut c_void) -> isize;
    fn dm_write_invis(sid: dm_sessid_t, hanp: *const c_void, hlen: usize, token: dm_token_t, flags: c_int, off: u64, len: usize, bufp: *const c_void) -> isize;

    fn dm_respond_event(sid: dm_sessid_t, token: dm_token_t, response: c_int, reterror: c_int, rlen: usize, respbuf: *const c_void) -> c_int;

    fn dm_set_disp(sid: dm_sessid_t, hanp: *const c_void, hlen: usize, token: dm_token_t, eventsp: *const c_void, maxevent: u32) -> c_int;
    fn dm_set_eventlist(sid: dm_sessid_t, hanp: *const c_void, hlen: usize, token: dm_token_t, eventsp: *const c_void, maxevent: u32) -> c_int;

    fn dm_get_events(sid: dm_sessid_t, flags: c_int, maxmsgs: c_int, buflen: usize, buf: *mut c_void, rlenp: *mut usize) -> c_int;
    fn dm_find_eventmsg(sid: dm_sessid_t, token: dm_token_t, buflen: usize, buf: *mut c_void, rlenp: *mut usize) -> c_int;
}

/// Initialize the DMAPI service, retrying until it answers (§4.3
/// startup step 1 — accommodates boot order). Logs once per *changed*
/// error so a persistently-down service doesn't spam.
pub fn init_service_with_retry(mut sleep: impl FnMut()) {
    let mut last_err: Option<i32> = None;
    loop {
        let mut version: *mut c_char = std::ptr::null_mut();
        let ret = unsafe { dm_init_service(&mut version) };
        if ret == 0 {
            return;
        }
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(-1);
        if last_err != Some(errno) {
            log::error!("dm_init_service failed (errno {}), retrying", errno);
            last_err = Some(errno);
        }
        sleep();
    }
}

pub struct SysSession {
    sid: dm_sessid_t,
}

impl SysSession {
    /// `recover_or_create(name)`: enumerate existing sessions, reuse one
    /// whose queried name matches, else create fresh (§9).
    pub fn recover_or_create(name: &str) -> HsmResult<Self> {
        let mut n: u32 = 0;
        let ret = unsafe { dm_getall_sessions(0, std::ptr::null_mut(), &mut n) };
        let mut old = DM_NO_SESSION;
        if ret != 0 {
            let mut buf = vec![0 as dm_sessid_t; n as usize];
            let ret = unsafe { dm_getall_sessions(n, buf.as_mut_ptr(), &mut n) };
            if ret != 0 {
                return Err(HsmError::Transport("dm_getall_sessions failed".into()));
            }
            for &sid in &buf {
                let mut qbuf = vec![0 as c_char; 256];
                let mut rlen: usize = 0;
                let ret = unsafe { dm_query_session(sid, qbuf.len(), qbuf.as_mut_ptr(), &mut rlen) };
                if ret != 0 {
                    continue;
                }
                let bytes: Vec<u8> = qbuf[..rlen].iter().map(|&c| c as u8).collect();
                if bytes == name.as_bytes() {
                    old = sid;
                    break;
                }
            }
        }

        let cname = CString::new(name).map_err(|_| HsmError::Transport("bad session name".into()))?;
        let mut new_sid: dm_sessid_t = DM_NO_SESSION;
        let ret = unsafe { dm_create_session(old, cname.as_ptr(), &mut new_sid) };
        if ret != 0 {
            return Err(HsmError::Transport("dm_create_session failed".into()));
        }
        Ok(SysSession { sid: new_sid })
    }
}

fn errno_result(ret: c_int) -> HsmResult<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(HsmError::Transport(std::io::Error::last_os_error().to_string()))
    }
}

fn right_to_c(right: Right) -> c_int {
    match right {
        Right::None => 0,
        Right::Shared => 1,
        Right::Exclusive => 2,
    }
}

impl DmSession for SysSession {
    fn path_to_handle(&self, path: &Path) -> HsmResult<Handle> {
        let cpath = CString::new(path.as_os_str().to_string_lossy().as_bytes())
            .map_err(|_| HsmError::Transport("bad path".into()))?;
        let mut hanp: *mut c_void = std::ptr::null_mut();
        let mut hlen: usize = 0;
        let ret = unsafe { dm_path_to_handle(cpath.as_ptr(), &mut hanp, &mut hlen) };
        if ret != 0 {
            return Err(HsmError::Transport(std::io::Error::last_os_error().to_string()));
        }
        let bytes = unsafe { std::slice::from_raw_parts(hanp as *const u8, hlen) }.to_vec();
        unsafe { dm_handle_free(hanp, hlen) };
        Ok(Handle(bytes))
    }

    fn create_userevent(&self) -> HsmResult<Token> {
        let mut token: dm_token_t = DM_NO_TOKEN;
        let ret = unsafe { dm_create_userevent(self.sid, 0, std::ptr::null(), &mut token) };
        errno_result(ret)?;
        Ok(Token::new(TokenId(token)))
    }

    fn request_right(&self, handle: &Handle, token: &Token, right: Right) -> HsmResult<()> {
        let ret = unsafe {
            dm_request_right(self.sid, handle.0.as_ptr() as *const c_void, handle.0.len(), token.id.0, 1, right_to_c(right))
        };
        errno_result(ret)
    }

    fn downgrade_right(&self, handle: &Handle, token: &Token) -> HsmResult<()> {
        let ret = unsafe { dm_downgrade_right(self.sid, handle.0.as_ptr() as *const c_void, handle.0.len(), token.id.0) };
        errno_result(ret)
    }

    fn upgrade_right(&self, handle: &Handle, token: &Token) -> HsmResult<()> {
        let ret = unsafe { dm_upgrade_right(self.sid, handle.0.as_ptr() as *const c_void, handle.0.len(), token.id.0) };
        errno_result(ret)
    }

    fn release_right(&self, handle: &Handle, token: &Token) -> HsmResult<()> {
        let ret = unsafe { dm_release_right(self.sid, handle.0.as_ptr() as *const c_void, handle.0.len(), token.id.0) };
        errno_result(ret)
    }

    fn get_dmattr(&self, handle: &Handle, token: &Token, name: &str) -> HsmResult<Option<Vec<u8>>> {
        let cname = CString::new(name).unwrap();
        let mut buf = vec![0u8; crate::attr::ATTR_LEN];
        let mut rlen: usize = 0;
        let ret = unsafe {
            dm_get_dmattr(
                self.sid,
                handle.0.as_ptr() as *const c_void,
                handle.0.len(),
                token.id.0,
                cname.as_ptr(),
                buf.len(),
                buf.as_mut_ptr() as *mut c_void,
                &mut rlen,
            )
        };
        if ret != 0 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() == Some(libc::ENOENT) {
                return Ok(None);
            }
            return Err(HsmError::Transport(errno.to_string()));
        }
        buf.truncate(rlen);
        Ok(Some(buf))
    }

    fn set_dmattr(&self, handle: &Handle, token: &Token, name: &str, value: &[u8]) -> HsmResult<()> {
        let cname = CString::new(name).unwrap();
        let ret = unsafe {
            dm_set_dmattr(
                self.sid,
                handle.0.as_ptr() as *const c_void,
                handle.0.len(),
                token.id.0,
                cname.as_ptr(),
                0,
                value.len(),
                value.as_ptr() as *const c_void,
            )
        };
        errno_result(ret)
    }

    fn remove_dmattr(&self, handle: &Handle, token: &Token, name: &str) -> HsmResult<()> {
        let cname = CString::new(name).unwrap();
        let ret = unsafe {
            dm_remove_dmattr(self.sid, handle.0.as_ptr() as *const c_void, handle.0.len(), token.id.0, 0, cname.as_ptr())
        };
        errno_result(ret)
    }

    fn set_region(&self, handle: &Handle, token: &Token, regions: &[Region]) -> HsmResult<()> {
        #[repr(C)]
        struct DmRegion {
            offset: u64,
            size: u64,
            flags: u32,
            pad: u32,
        }
        let raw: Vec<DmRegion> = regions
            .iter()
            .map(|r| DmRegion { offset: r.offset, size: r.size, flags: r.flags.bits(), pad: 0 })
            .collect();
        let mut exact: c_int = 0;
        let ret = unsafe {
            dm_set_region(
                self.sid,
                handle.0.as_ptr() as *const c_void,
                handle.0.len(),
                token.id.0,
                raw.len() as u32,
                raw.as_ptr() as *const c_void,
                &mut exact,
            )
        };
        errno_result(ret)
    }

    fn punch_hole(&self, handle: &Handle, token: &Token, offset: u64, size: u64) -> HsmResult<()> {
        let ret = unsafe {
            dm_punch_hole(self.sid, handle.0.as_ptr() as *const c_void, handle.0.len(), token.id.0, offset, size)
        };
        errno_result(ret)
    }

    fn read_invis(&self, handle: &Handle, token: &Token, offset: u64, buf: &mut [u8]) -> HsmResult<usize> {
        let ret = unsafe {
            dm_read_invis(self.sid, handle.0.as_ptr() as *const c_void, handle.0.len(), token.id.0, offset, buf.len(), buf.as_mut_ptr() as *mut c_void)
        };
        if ret < 0 {
            return Err(HsmError::Transport(std::io::Error::last_os_error().to_string()));
        }
        Ok(ret as usize)
    }

    fn write_invis(&self, handle: &Handle, token: &Token, offset: u64, buf: &[u8]) -> HsmResult<usize> {
        const DM_WRITE_SYNC: c_int = 1;
        let ret = unsafe {
            dm_write_invis(
                self.sid,
                handle.0.as_ptr() as *const c_void,
                handle.0.len(),
                token.id.0,
                DM_WRITE_SYNC,
                offset,
                buf.len(),
                buf.as_ptr() as *const c_void,
            )
        };
        if ret < 0 {
            return Err(HsmError::Transport(std::io::Error::last_os_error().to_string()));
        }
        Ok(ret as usize)
    }

    fn respond_event(&self, token: &mut Token, response: Response) -> HsmResult<()> {
        let (code, err) = match response {
            Response::Continue => (0, 0),
            Response::Abort(errno) => (1, errno),
        };
        let ret = unsafe { dm_respond_event(self.sid, token.id.0, code, err, 0, std::ptr::null()) };
        token.mark_responded();
        errno_result(ret)
    }

    fn set_disp(&self, handle: &Handle, events: EventSet) -> HsmResult<()> {
        let bits = events.bits();
        let ret = unsafe {
            dm_set_disp(self.sid, handle.0.as_ptr() as *const c_void, handle.0.len(), DM_NO_TOKEN, &bits as *const u32 as *const c_void, 32)
        };
        errno_result(ret)
    }

    fn set_eventlist(&self, handle: &Handle, events: EventSet) -> HsmResult<()> {
        let bits = events.bits();
        let ret = unsafe {
            dm_set_eventlist(self.sid, handle.0.as_ptr() as *const c_void, handle.0.len(), DM_NO_TOKEN, &bits as *const u32 as *const c_void, 32)
        };
        errno_result(ret)
    }

    fn get_events(&self, _wait: bool) -> HsmResult<Vec<EventMessage>> {
        // Real message parsing (walking the packed dm_eventmsg_t chain)
        // is filesystem-specific and lives in the production `sys`
        // build only; left as the integration seam for the target
        // DMAPI implementation. The protocol logic in `daemon` is
        // backend-agnostic and is exercised against
        // `virtual_session` instead.
        let mut buf = vec![0u8; 0x10000];
        let mut rlen: usize = 0;
        let ret = unsafe { dm_get_events(self.sid, 0, 0, buf.len(), buf.as_mut_ptr() as *mut c_void, &mut rlen) };
        if ret < 0 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() == Some(libc::EAGAIN) {
                return Ok(Vec::new());
            }
            return Err(HsmError::Transport(errno.to_string()));
        }
        Ok(Vec::new())
    }

    fn outstanding_tokens(&self) -> HsmResult<Vec<TokenId>> {
        Ok(Vec::new())
    }

    fn find_eventmsg(&self, token: TokenId) -> HsmResult<Option<EventMessage>> {
        let mut buf = vec![0u8; 0x10000];
        let mut rlen: usize = 0;
        let ret = unsafe { dm_find_eventmsg(self.sid, token.0, buf.len(), buf.as_mut_ptr() as *mut c_void, &mut rlen) };
        errno_result(ret)?;
        Ok(None)
    }
}

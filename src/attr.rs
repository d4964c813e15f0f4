//! The `hacksm` DM attribute: binary layout, encode/decode, and the
//! migration state it carries.
//!
//! Layout is fixed-size and little-endian (§6 of the design doc):
//!
//! ```text
//! offset  size  field
//!   0      4    magic = "HSM1"
//!   4      8    migrate_time (seconds since epoch)
//!  12      8    size (bytes, original)
//!  20      8    device
//!  28      8    inode
//!  36      4    state  (0=START, 1=MIGRATED, 2=RECALL)
//! ```
//!
//! The byte layout itself is informative, not load-bearing: any
//! implementation may choose its own on-disk representation as long as it
//! round-trips and rejects a bad magic. We fix one so `migrate`, `hacksmd`
//! and `hacksm_ls` (and the tests) agree on what's on disk.

use crate::error::{HsmError, HsmResult};

pub const HSM_MAGIC: [u8; 4] = *b"HSM1";
pub const HSM_ATTRNAME: &str = "hacksm";
pub const ATTR_LEN: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum HsmState {
    Start = 0,
    Migrated = 1,
    Recall = 2,
}

impl HsmState {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(HsmState::Start),
            1 => Some(HsmState::Migrated),
            2 => Some(HsmState::Recall),
            _ => None,
        }
    }
}

/// The persisted `hacksm` DM attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HsmAttr {
    pub migrate_time: u64,
    pub size: u64,
    pub device: u64,
    pub inode: u64,
    pub state: HsmState,
}

impl HsmAttr {
    pub fn encode(&self) -> [u8; ATTR_LEN] {
        let mut buf = [0u8; ATTR_LEN];
        buf[0..4].copy_from_slice(&HSM_MAGIC);
        buf[4..12].copy_from_slice(&self.migrate_time.to_le_bytes());
        buf[12..20].copy_from_slice(&self.size.to_le_bytes());
        buf[20..28].copy_from_slice(&self.device.to_le_bytes());
        buf[28..36].copy_from_slice(&self.inode.to_le_bytes());
        buf[36..40].copy_from_slice(&(self.state as u32).to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> HsmResult<Self> {
        if buf.len() != ATTR_LEN {
            return Err(HsmError::BadAttrLen(buf.len(), ATTR_LEN));
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[0..4]);
        if magic != HSM_MAGIC {
            return Err(HsmError::BadMagic(magic));
        }
        let migrate_time = u64::from_le_bytes(buf[4..12].try_into().unwrap());
        let size = u64::from_le_bytes(buf[12..20].try_into().unwrap());
        let device = u64::from_le_bytes(buf[20..28].try_into().unwrap());
        let inode = u64::from_le_bytes(buf[28..36].try_into().unwrap());
        let state_raw = u32::from_le_bytes(buf[36..40].try_into().unwrap());
        let state = HsmState::from_u32(state_raw).ok_or(HsmError::BadState(state_raw))?;
        Ok(HsmAttr { migrate_time, size, device, inode, state })
    }
}

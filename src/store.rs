//! The flat, content-addressed-by-`(device, inode)` side store (§4.5).
//!
//! No locking lives in here: concurrent migration of the same file is
//! prevented upstream by the EXCL-right handshake (§5), so two store
//! handles for the same key are never open for writing at once.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{HsmError, HsmResult};

/// A handle on an open store object.
pub struct StoreHandle {
    file: File,
    readonly: bool,
}

impl StoreHandle {
    pub fn read(&mut self, buf: &mut [u8]) -> HsmResult<usize> {
        self.file.read(buf).map_err(HsmError::StoreIo)
    }

    pub fn write_all(&mut self, buf: &[u8]) -> HsmResult<()> {
        let wrote = self.file.write(buf).map_err(HsmError::StoreIo)?;
        if wrote != buf.len() {
            return Err(HsmError::ShortWrite { wrote, requested: buf.len() });
        }
        Ok(())
    }

    /// `fsync` if writable, then drop (closing the fd).
    pub fn close(self) -> HsmResult<()> {
        if !self.readonly {
            self.file.sync_all().map_err(HsmError::StoreIo)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Store {
    basepath: PathBuf,
}

impl Store {
    /// Validate `basepath` is a directory. Failure to stat it is fatal
    /// (§4.5 `init()`): the daemon and migrator cannot make progress
    /// without a place to put migrated data.
    pub fn init(basepath: impl Into<PathBuf>) -> HsmResult<Self> {
        let basepath = basepath.into();
        let meta = std::fs::metadata(&basepath).map_err(HsmError::StoreIo)?;
        if !meta.is_dir() {
            return Err(HsmError::StoreIo(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{:?} is not a directory", basepath),
            )));
        }
        Ok(Store { basepath })
    }

    /// `<basepath>/0x<device_hex>:0x<inode_hex>`, lower-case hex, no
    /// zero-padding (§6).
    pub fn path_for(&self, device: u64, inode: u64) -> PathBuf {
        self.basepath.join(format!("0x{:x}:0x{:x}", device, inode))
    }

    pub fn open(&self, device: u64, inode: u64, readonly: bool) -> HsmResult<StoreHandle> {
        let path = self.path_for(device, inode);
        let file = if readonly {
            OpenOptions::new().read(true).open(&path)
        } else {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode_or_default()
                .open(&path)
        }
        .map_err(HsmError::StoreIo)?;
        Ok(StoreHandle { file, readonly })
    }

    /// Unlink; ENOENT is success (idempotent).
    pub fn remove(&self, device: u64, inode: u64) -> HsmResult<()> {
        let path = self.path_for(device, inode);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(HsmError::StoreIo(e)),
        }
    }

    pub fn exists(&self, device: u64, inode: u64) -> bool {
        self.path_for(device, inode).exists()
    }

    pub fn basepath(&self) -> &Path {
        &self.basepath
    }
}

trait OpenOptionsExt {
    fn mode_or_default(&mut self) -> &mut Self;
}

impl OpenOptionsExt for OpenOptions {
    #[cfg(unix)]
    fn mode_or_default(&mut self) -> &mut Self {
        use std::os::unix::fs::OpenOptionsExt;
        self.mode(0o600)
    }

    #[cfg(not(unix))]
    fn mode_or_default(&mut self) -> &mut Self {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_format_is_unpadded_lowercase_hex() {
        let store = Store::init(tempfile::tempdir().unwrap().keep()).unwrap();
        let path = store.path_for(0xAB, 0x1);
        assert!(path.to_str().unwrap().ends_with("0xab:0x1"));
    }

    #[test]
    fn write_read_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::init(dir.path()).unwrap();
        assert!(!store.exists(1, 2));

        let mut h = store.open(1, 2, false).unwrap();
        h.write_all(b"hello world").unwrap();
        h.close().unwrap();
        assert!(store.exists(1, 2));

        let mut h = store.open(1, 2, true).unwrap();
        let mut buf = [0u8; 11];
        let n = h.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello world");

        store.remove(1, 2).unwrap();
        assert!(!store.exists(1, 2));
        // idempotent
        store.remove(1, 2).unwrap();
    }

    #[test]
    fn init_rejects_non_directory() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(Store::init(file.path()).is_err());
    }
}

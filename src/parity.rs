// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Parity files, one per level.
//!
//! A parity file is a flat array of block-sized records indexed
//! by parity position.  Handles are opened before a pass and
//! closed after it; a missing parity file is tolerated by the
//! read-only passes, which simply skip that level.

use std::fs;
use std::io;
use std::os::fd::IntoRawFd;
use std::os::unix::fs::FileExt;

use crate::disk::BlockPos;
use crate::result::{Error, Result};

/// Display name of a parity level.
pub fn lev_name(level: usize) -> &'static str {
    match level {
        0 => "parity",
        _ => "q-parity",
    }
}

/// Configuration key of a parity level.
pub fn lev_config_name(level: usize) -> &'static str {
    match level {
        0 => "parity",
        _ => "q_parity",
    }
}

/// An open parity file.
pub struct ParityHandle {
    f: fs::File,
    path: String,
    pub level: usize,
}

impl ParityHandle {
    /// Opens an existing parity file read-only.
    pub fn open(level: usize, path: &str) -> Result<ParityHandle> {
        let f = fs::File::open(path)
            .map_err(|e| Error::Open(path.to_string(), e))?;
        Ok(ParityHandle { f, path: path.to_string(), level })
    }

    /// Opens a parity file for writing, creating it if missing
    /// and bringing it to exactly `size` bytes.
    pub fn create(level: usize, path: &str, size: u64) -> Result<ParityHandle> {
        let f = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::Open(path.to_string(), e))?;
        let st = f.metadata().map_err(|e| Error::Open(path.to_string(), e))?;
        if st.len() < size {
            preallocate(&f, path, size)?;
        } else if st.len() > size {
            f.set_len(size).map_err(|e| Error::Grow(path.to_string(), e))?;
        }
        Ok(ParityHandle { f, path: path.to_string(), level })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Reads the record at `pos`.
    pub fn read(&self, pos: BlockPos, block_size: u32, buf: &mut [u8]) -> Result<()> {
        let off = u64::from(pos) * u64::from(block_size);
        self.f.read_exact_at(buf, off).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::ShortIo(self.path.clone())
            } else {
                Error::Read(self.path.clone(), e)
            }
        })
    }

    /// Writes the record at `pos`.
    pub fn write(&self, pos: BlockPos, block_size: u32, buf: &[u8]) -> Result<()> {
        let off = u64::from(pos) * u64::from(block_size);
        self.f
            .write_all_at(buf, off)
            .map_err(|e| Error::Write(self.path.clone(), e))
    }

    /// Closes the handle, surfacing the close(2) result.
    pub fn close(self) -> Result<()> {
        let fd = self.f.into_raw_fd();
        let ret = unsafe { libc::close(fd) };
        if ret != 0 {
            return Err(Error::Close(self.path, io::Error::last_os_error()));
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn preallocate(f: &fs::File, path: &str, size: u64) -> Result<()> {
    use std::os::fd::AsRawFd;
    let ret = unsafe { libc::posix_fallocate(f.as_raw_fd(), 0, size as libc::off_t) };
    if ret != 0 {
        let err = io::Error::from_raw_os_error(ret);
        return Err(Error::Grow(path.to_string(), err));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn preallocate(f: &fs::File, path: &str, size: u64) -> Result<()> {
    f.set_len(size).map_err(|e| Error::Grow(path.to_string(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names() {
        assert_eq!(lev_name(0), "parity");
        assert_eq!(lev_name(1), "q-parity");
        assert_eq!(lev_config_name(1), "q_parity");
    }

    #[test]
    fn create_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = format!("{}/parity", dir.path().display());
        let h = ParityHandle::create(0, &path, 16).unwrap();
        h.write(1, 4, b"wxyz").unwrap();
        let mut buf = [0u8; 4];
        h.read(1, 4, &mut buf).unwrap();
        assert_eq!(&buf, b"wxyz");
        h.close().unwrap();
        // Reopen read-only and shrink on the next create.
        assert!(ParityHandle::open(0, &path).is_ok());
        let h = ParityHandle::create(0, &path, 8).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 8);
        h.close().unwrap();
    }

    #[test]
    fn open_missing_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = format!("{}/absent", dir.path().display());
        assert!(matches!(ParityHandle::open(0, &path), Err(Error::Open(..))));
    }
}

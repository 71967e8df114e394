//! Byte-range advisory locks.
//!
//! Two regions of the file serve as locks: the header region serialises
//! open and transaction begin, and the data region (the first bytes of the
//! DUMMY sentinel) is the transaction lock — shared for readers, exclusive
//! for the single writer. Acquisition is two-phase: header first, then
//! data, then the header lock is dropped. A new opener can therefore
//! validate the file while a long transaction holds the data lock, and the
//! classic fcntl starvation pattern is avoided.
//!
//! `fcntl` range locks are per-process; in-process sharing is handled by
//! the registry's lock table, not here.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

use crate::error::{Error, Result};

/// The header lock region: bytes 0..16.
pub(crate) const HEADER_LOCK: LockRange = LockRange { start: 0, len: 16 };
/// The data (transaction) lock region: the first 248 bytes of the DUMMY.
pub(crate) const DATA_LOCK: LockRange = LockRange { start: 96, len: 248 };

#[derive(Debug, Clone, Copy)]
pub(crate) struct LockRange {
    pub start: i64,
    pub len: i64,
}

fn fcntl_lock(file: &File, range: LockRange, kind: libc::c_short, block: bool) -> Result<()> {
    let op = if block { libc::F_SETLKW } else { libc::F_SETLK };
    let fl = libc::flock {
        l_type: kind,
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: range.start,
        l_len: range.len,
        l_pid: 0,
    };
    loop {
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), op, &fl) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EACCES) | Some(libc::EAGAIN) | Some(libc::EDEADLK) => {
                return Err(Error::Locked)
            }
            _ => return Err(err.into()),
        }
    }
}

/// Acquires `range` shared or exclusive. With `block` false a busy region
/// fails immediately with [`Error::Locked`].
pub(crate) fn lock(file: &File, range: LockRange, exclusive: bool, block: bool) -> Result<()> {
    let kind = if exclusive {
        libc::F_WRLCK
    } else {
        libc::F_RDLCK
    } as libc::c_short;
    fcntl_lock(file, range, kind, block)
}

pub(crate) fn unlock(file: &File, range: LockRange) -> Result<()> {
    fcntl_lock(file, range, libc::F_UNLCK as libc::c_short, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_same_process_succeeds() {
        // fcntl locks do not conflict within one process; this only checks
        // the calls are well-formed.
        let dir = tempfile::tempdir().unwrap();
        let f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.path().join("l.db"))
            .unwrap();
        lock(&f, HEADER_LOCK, true, true).unwrap();
        lock(&f, DATA_LOCK, false, false).unwrap();
        unlock(&f, HEADER_LOCK).unwrap();
        unlock(&f, DATA_LOCK).unwrap();
    }
}

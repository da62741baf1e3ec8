//! Byte-range advisory locks over the cache file.
//!
//! Each bucket (and the file header) is guarded by a blocking exclusive
//! `fcntl(F_SETLKW)` lock on its byte range. The lock is handed out as an
//! RAII guard so it is released on every exit path, including unwinds out
//! of user callbacks.
//!
//! Classic POSIX byte-range locks are owned by the process, not the file
//! handle: they exclude other processes, not other threads holding their
//! own handle to the same file.

use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

/// Acquire a blocking exclusive lock on `len` bytes at `offset`.
pub fn exclusive(file: &File, offset: u64, len: u64) -> io::Result<LockGuard<'_>> {
    set_lock(file.as_raw_fd(), libc::F_WRLCK, offset, len)?;
    Ok(LockGuard { file })
}

/// Issue one `F_SETLKW`, retrying on `EINTR`.
fn set_lock(fd: RawFd, kind: i32, offset: u64, len: u64) -> io::Result<()> {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = kind as i16;
    fl.l_whence = libc::SEEK_SET as i16;
    fl.l_start = offset as libc::off_t;
    fl.l_len = len as libc::off_t;

    loop {
        let rc = unsafe { libc::fcntl(fd, libc::F_SETLKW, &fl) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Holds a byte-range lock until dropped.
#[must_use = "the byte range stays locked only while the guard lives"]
pub struct LockGuard<'a> {
    file: &'a File,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        // Length 0 from offset 0 releases every lock this process holds on
        // the file; an operation holds at most one.
        let _ = set_lock(self.file.as_raw_fd(), libc::F_UNLCK, 0, 0);
    }
}

//! # OS Byte-Range Lock Primitive
//!
//! Thin wrapper over POSIX advisory record locks (`fcntl` with `F_SETLK` /
//! `F_SETLKW`). Each lock covers exactly one byte, at offset `word * 4` of
//! the coordination file, so every 32-bit word doubles as an independent
//! lock anchor.
//!
//! Byte-range locks are used only for liveness and initialization
//! arbitration, never for page locking:
//!
//! - the DMS word distinguishes "first to connect, must initialize" from
//!   "joining an existing cohort";
//! - a live client holds a shared lock on its own client-slot byte, so a
//!   peer that obtains an exclusive lock on that byte has proven the owner
//!   process is dead.
//!
//! POSIX record locks are per-process: requests from the same process never
//! conflict with each other, which is exactly what the slot-reclamation
//! protocol relies on the kernel for across processes.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

use crate::config::WORD_SIZE;
use crate::error::{HmaError, Result};

/// Requested lock level for a single lock anchor byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Release any lock held on the byte.
    None,
    /// Shared (read) lock; compatible with other shared holders.
    Shared,
    /// Exclusive (write) lock; compatible with nothing.
    Exclusive,
}

impl LockMode {
    fn as_fcntl_type(self) -> libc::c_short {
        match self {
            Self::None => libc::F_UNLCK as libc::c_short,
            Self::Shared => libc::F_RDLCK as libc::c_short,
            Self::Exclusive => libc::F_WRLCK as libc::c_short,
        }
    }
}

/// Apply `mode` to the one-byte range anchoring `word`.
///
/// A blocking request that the kernel recognizes as a deadlock between
/// processes fails with [`HmaError::BusyDeadlock`]; any other conflict
/// (including a non-blocking request that cannot be granted immediately)
/// fails with [`HmaError::Busy`].
pub fn byte_range_lock(file: &File, word: usize, mode: LockMode, blocking: bool) -> Result<()> {
    // SAFETY: flock is a plain-old-data struct; an all-zero value is a
    // valid initial state with every field then set explicitly.
    let mut request: libc::flock = unsafe { std::mem::zeroed() };
    request.l_type = mode.as_fcntl_type();
    request.l_whence = libc::SEEK_SET as libc::c_short;
    request.l_start = (word * WORD_SIZE) as libc::off_t;
    request.l_len = 1;

    let cmd = if blocking { libc::F_SETLKW } else { libc::F_SETLK };

    // SAFETY: the fd is owned by `file` and stays open for the duration of
    // the call; `request` is a fully-initialized flock on this stack frame.
    let res = unsafe { libc::fcntl(file.as_raw_fd(), cmd, &request) };
    if res == 0 {
        return Ok(());
    }

    let errno = io::Error::last_os_error();
    if blocking && errno.raw_os_error() == Some(libc::EDEADLK) {
        return Err(HmaError::BusyDeadlock);
    }
    Err(HmaError::Busy)
}

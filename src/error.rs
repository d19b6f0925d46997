//! Error taxonomy for the lock manager.
//!
//! Lock-outcome variants (`Busy`, `BusyDeadlock`, `NoMem`) are plain values
//! the caller is expected to match on and react to; file and initialization
//! failures carry an [`eyre::Report`] so the full cause chain (operation,
//! path, OS error) survives to the caller.

use std::fmt;

/// Errors surfaced by connect, disconnect and the lock engine.
#[derive(Debug)]
pub enum HmaError {
    /// Non-blocking contention that is not a detected deadlock: every
    /// client slot is taken, or a byte-range lock request conflicted.
    Busy,
    /// The kernel reported `EDEADLK` on a blocking byte-range lock, or the
    /// conflicting page lock is held by a live client and cannot be
    /// overcome.
    BusyDeadlock,
    /// stat/open/ftruncate/mmap failure on the coordination file.
    CantOpen(eyre::Report),
    /// Allocation failure; no shared state was modified.
    NoMem,
    /// Any other mapping or initialization failure, including errors
    /// propagated from the pager's journal rollback.
    Other(eyre::Report),
}

pub type Result<T> = std::result::Result<T, HmaError>;

impl fmt::Display for HmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => f.write_str("resource busy"),
            Self::BusyDeadlock => f.write_str("deadlock between clients"),
            Self::CantOpen(report) => write!(f, "cannot open coordination file: {report}"),
            Self::NoMem => f.write_str("out of memory"),
            Self::Other(report) => write!(f, "{report}"),
        }
    }
}

impl std::error::Error for HmaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CantOpen(report) | Self::Other(report) => Some(report.as_ref()),
            _ => None,
        }
    }
}

impl HmaError {
    /// True for the two contention outcomes a caller can retry after
    /// backing off or aborting its transaction.
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::Busy | Self::BusyDeadlock)
    }
}

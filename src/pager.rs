//! The pager seam.
//!
//! The lock manager never touches database pages, journals or the main
//! database file itself; those belong to the embedding storage engine. This
//! trait is the entire surface the engine must provide.

use std::path::Path;

use crate::error::Result;

/// Collaborator interface to the embedding storage engine's pager.
///
/// Implementations must be callable from any thread: journal rollback for a
/// crashed peer can be triggered from whichever client first trips over the
/// peer's stale locks.
pub trait Pager: Send + Sync {
    /// Path of the main database file. The coordination file lives next to
    /// it, named by appending [`HMA_SUFFIX`](crate::config::HMA_SUFFIX).
    fn filename(&self) -> &Path;

    /// Replay or discard the rollback journal left behind by `client_id`.
    ///
    /// Called once per slot when the coordination file is first
    /// initialized, and again whenever a crashed client's slot is
    /// reclaimed. Must be idempotent: a slot with no journal is a no-op.
    fn rollback_journal(&self, client_id: usize) -> Result<()>;

    /// Attempt a non-blocking exclusive lock on the main database file.
    ///
    /// Consulted only when the last local client disconnects, to decide
    /// whether the coordination file can be unlinked. Returning `true`
    /// asserts no other process is connected to the database.
    fn try_exclusive_db_lock(&self) -> bool;
}

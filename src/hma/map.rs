//! # Coordination-File Mapper
//!
//! `HmaMap` owns one process's view of a database's coordination file: the
//! open file descriptor, the shared memory mapping, and typed access to the
//! 32-bit words inside it.
//!
//! ## First-Client Initialization
//!
//! Whoever can take a non-blocking **exclusive** byte-range lock on the DMS
//! word is the first client of a new cohort. It sizes the file, zeroes the
//! mapping, and runs the pager's journal rollback once per client slot to
//! clean up anything a previous cohort left behind. Everyone else finds the
//! DMS exclusively locked and simply maps the file. Both paths end by
//! taking a **shared** DMS lock (blocking), which is held for the life of
//! the mapping; the blocking wait is what parks joiners until the
//! initializer has finished.
//!
//! ## Why `MmapRaw`
//!
//! The mapping is mutated concurrently by every connected process, so it
//! must never be exposed as `&mut [u8]`: two processes holding aliased
//! exclusive references would be undefined behavior. Instead the raw base
//! pointer is reinterpreted word-by-word as [`AtomicU32`], and every access
//! goes through atomic loads, stores and compare-exchange.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU32;

use memmap2::{MmapOptions, MmapRaw};
use tracing::error;

use crate::config::{CLIENT_SLOTS, DMS_WORD, HMA_FILE_SIZE, HMA_SUFFIX, PAGELOCK_SLOTS};
use crate::error::{HmaError, Result};
use crate::hma::layout;
use crate::oslock::{byte_range_lock, LockMode};
use crate::pager::Pager;

const WORD_COUNT: usize = 1 + CLIENT_SLOTS + PAGELOCK_SLOTS;

fn cant_open(err: io::Error, operation: &str, path: &Path) -> HmaError {
    error!(%operation, path = %path.display(), "coordination file error");
    HmaError::CantOpen(
        eyre::Report::new(err).wrap_err(format!("failed to {operation} '{}'", path.display())),
    )
}

/// One process's handle on a database's coordination file.
///
/// Shared between every local client of the same database through an `Arc`
/// held by the registry. All word access is atomic; `HmaMap` itself is
/// immutable after construction.
#[derive(Debug)]
pub(crate) struct HmaMap {
    path: PathBuf,
    file: File,
    map: MmapRaw,
}

impl HmaMap {
    /// Open or create the coordination file for the database at `db_path`,
    /// initializing it if this process is the first of a cohort.
    pub(crate) fn open(db_path: &Path, pager: &dyn Pager) -> Result<Self> {
        let mut name = db_path.as_os_str().to_owned();
        name.push(HMA_SUFFIX);
        let path = PathBuf::from(name);

        let file = {
            use std::os::unix::fs::OpenOptionsExt;
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .mode(0o644)
                .open(&path)
                .map_err(|e| cant_open(e, "open", &path))?
        };

        // Exclusive DMS lock == nobody else is connected: initialize.
        let initializer =
            byte_range_lock(&file, DMS_WORD, LockMode::Exclusive, false).is_ok();

        if initializer {
            file.set_len(HMA_FILE_SIZE as u64)
                .map_err(|e| cant_open(e, "resize", &path))?;
        }

        let map = MmapOptions::new()
            .len(HMA_FILE_SIZE)
            .map_raw(&file)
            .map_err(|e| cant_open(e, "memory-map", &path))?;

        assert_eq!(
            map.as_mut_ptr() as usize % std::mem::align_of::<AtomicU32>(),
            0,
            "mapping of '{}' is not word-aligned",
            path.display()
        );

        if initializer {
            // SAFETY: the region spans exactly HMA_FILE_SIZE mapped bytes
            // and no other process can be connected while we hold the
            // exclusive DMS lock, so nothing observes the partial zeroing.
            unsafe { std::ptr::write_bytes(map.as_mut_ptr(), 0, HMA_FILE_SIZE) };

            // A previous cohort may have died with journals on disk; scrub
            // every slot before anyone starts handing them out again.
            for client_id in 0..CLIENT_SLOTS {
                pager.rollback_journal(client_id)?;
            }
        }

        // Downgrade (or, for joiners, wait) to the shared DMS lock held for
        // the life of this mapping.
        byte_range_lock(&file, DMS_WORD, LockMode::Shared, true)?;

        Ok(Self { path, file, map })
    }

    /// Path of the coordination file (for unlink at last disconnect).
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// The open descriptor, used as the byte-range lock anchor.
    pub(crate) fn file(&self) -> &File {
        &self.file
    }

    /// Atomic view of the word at `index`.
    pub(crate) fn word(&self, index: usize) -> &AtomicU32 {
        debug_assert!(index < WORD_COUNT, "word index {index} out of range");
        // SAFETY: the mapping is live for the lifetime of `self`, the
        // offset stays inside its HMA_FILE_SIZE bounds, the base pointer is
        // word-aligned (asserted at map time), and all mutation anywhere in
        // the system goes through atomic operations on these words.
        unsafe {
            &*(self
                .map
                .as_mut_ptr()
                .add(index * crate::config::WORD_SIZE)
                .cast::<AtomicU32>())
        }
    }

    /// The client-slot word for `client`.
    pub(crate) fn client_word(&self, client: usize) -> &AtomicU32 {
        debug_assert!(client < CLIENT_SLOTS);
        self.word(layout::client_word_index(client))
    }

    /// The page-lock word coordinating `pgno`.
    pub(crate) fn page_word(&self, pgno: u32) -> &AtomicU32 {
        self.word(layout::page_word_index(pgno))
    }
}

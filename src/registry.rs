//! # Client Registry
//!
//! Process-global bookkeeping for coordination-file handles and the client
//! slots owned by this process.
//!
//! ## Structure
//!
//! One `HmaEntry` per distinct coordination file this process is connected
//! to, de-duplicated by the `(device, inode)` identity of the *database*
//! file so that two paths naming the same database share one handle and
//! therefore one file descriptor. POSIX byte-range locks are per-process,
//! so a second descriptor would fight the first for its own slots.
//!
//! ## Locking Discipline
//!
//! A single process-global mutex guards every registry mutation: handle
//! creation and teardown, client-slot allocation, and the cross-client
//! crash arbitration in [`resolve_conflict`]. Page-lock words are never
//! touched while waiting for this mutex from the CAS loops; the engine
//! calls in here only after it has already observed a conflicting word
//! value.
//!
//! ## Slot Allocation
//!
//! A free slot is claimed by winning a non-blocking exclusive byte-range
//! lock on the slot's anchor byte. Because live owners keep a shared lock
//! on their own anchor, winning the exclusive lock proves the previous
//! owner (if the slot word is non-zero) is dead, and its journal is rolled
//! back before the slot is reused.

use std::fs;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

use crate::config::CLIENT_SLOTS;
use crate::error::{HmaError, Result};
use crate::hma::{layout, HmaMap};
use crate::oslock::{byte_range_lock, LockMode};
use crate::pager::Pager;
use crate::server::{self, Server};

struct HmaEntry {
    dev: u64,
    ino: u64,
    map: Arc<HmaMap>,
    /// Live local clients on this handle.
    clients: usize,
    /// Which slots are owned by clients in this process. The weak
    /// back-reference from slot id to local client; cleared on disconnect.
    local: [bool; CLIENT_SLOTS],
}

static REGISTRY: Mutex<Vec<HmaEntry>> = Mutex::new(Vec::new());

/// Connect to the database served by `pager`: open or join its
/// coordination file and claim a client slot.
///
/// Returns [`HmaError::Busy`] when all client slots are taken, and
/// [`HmaError::CantOpen`] when the database file cannot be identified or
/// the coordination file cannot be created or mapped.
pub fn connect(pager: Arc<dyn Pager>) -> Result<Server> {
    use std::os::unix::fs::MetadataExt;

    let db_path = pager.filename().to_owned();
    let mut registry = REGISTRY.lock();

    let meta = fs::metadata(&db_path).map_err(|e| {
        error!(path = %db_path.display(), "failed to stat database file");
        HmaError::CantOpen(
            eyre::Report::new(e).wrap_err(format!("failed to stat '{}'", db_path.display())),
        )
    })?;
    let (dev, ino) = (meta.dev(), meta.ino());

    let index = match registry.iter().position(|e| e.dev == dev && e.ino == ino) {
        Some(index) => {
            registry[index].clients += 1;
            index
        }
        None => {
            let map = HmaMap::open(&db_path, pager.as_ref())?;
            registry.push(HmaEntry {
                dev,
                ino,
                map: Arc::new(map),
                clients: 1,
                local: [false; CLIENT_SLOTS],
            });
            registry.len() - 1
        }
    };

    match claim_slot(&mut registry[index], pager.as_ref()) {
        Ok(client_id) => Ok(Server::new(
            Arc::clone(&registry[index].map),
            client_id,
            pager,
        )),
        Err(err) => {
            let entry = &mut registry[index];
            entry.clients -= 1;
            if entry.clients == 0 {
                // Failed connects never unlink: another process may be
                // mid-connect on the same file.
                registry.remove(index);
            }
            Err(err)
        }
    }
}

fn claim_slot(entry: &mut HmaEntry, pager: &dyn Pager) -> Result<usize> {
    for client_id in 0..CLIENT_SLOTS {
        if entry.local[client_id] {
            continue;
        }
        let anchor = layout::client_word_index(client_id);
        if byte_range_lock(entry.map.file(), anchor, LockMode::Exclusive, false).is_err() {
            // Slot owned by a live client in another process.
            continue;
        }

        // The anchor is ours. A non-zero slot word means the previous
        // owner died mid-transaction; recover it before taking over.
        if entry.map.client_word(client_id).load(Ordering::SeqCst) != 0 {
            if let Err(err) = server::rollback_client(&entry.map, pager, client_id) {
                let _ = byte_range_lock(entry.map.file(), anchor, LockMode::None, false);
                return Err(err);
            }
        }

        // Downgrade to the shared liveness lock held until disconnect.
        let _ = byte_range_lock(entry.map.file(), anchor, LockMode::Shared, false);
        entry.map.client_word(client_id).store(1, Ordering::SeqCst);
        entry.local[client_id] = true;
        return Ok(client_id);
    }
    Err(HmaError::Busy)
}

/// Tear down one client: free its slot, and on last-out (when the pager
/// can prove exclusivity on the database file) unlink the coordination
/// file. Called from [`Server`]'s drop.
pub(crate) fn disconnect(hma: &Arc<HmaMap>, client_id: usize, pager: &dyn Pager) {
    let mut registry = REGISTRY.lock();
    let Some(index) = registry.iter().position(|e| Arc::ptr_eq(&e.map, hma)) else {
        return;
    };

    let entry = &mut registry[index];
    entry.map.client_word(client_id).store(0, Ordering::SeqCst);
    entry.local[client_id] = false;
    let _ = byte_range_lock(
        entry.map.file(),
        layout::client_word_index(client_id),
        LockMode::None,
        false,
    );

    if entry.clients == 1 && pager.try_exclusive_db_lock() {
        let _ = fs::remove_file(entry.map.path());
    }

    entry.clients -= 1;
    if entry.clients == 0 {
        registry.remove(index);
    }
}

/// Arbitrate a page-lock conflict against the client blocking `me` in
/// `word`.
///
/// Returns `Ok(true)` when the caller should re-read the page word and
/// retry (the blocker was dead and has been rolled back, or the blocker's
/// transaction ended while we waited on its liveness lock), `Ok(false)`
/// when the conflict is with a live client we must not wait for (same
/// process, or non-blocking mode), in which case the caller reports the
/// deadlock.
pub(crate) fn resolve_conflict(
    hma: &Arc<HmaMap>,
    pager: &dyn Pager,
    me: usize,
    word: u32,
    blocking: bool,
) -> Result<bool> {
    // Prefer the writer; otherwise the lowest-numbered foreign reader.
    let blocker = match layout::write_holder(word) {
        Some(holder) if holder != me => holder,
        _ => {
            match (0..CLIENT_SLOTS).find(|&id| id != me && word & layout::read_bit(id) != 0) {
                Some(id) => id,
                None => return Ok(false),
            }
        }
    };
    let anchor = layout::client_word_index(blocker);

    let registry = REGISTRY.lock();
    let Some(entry) = registry.iter().find(|e| Arc::ptr_eq(&e.map, hma)) else {
        return Ok(false);
    };

    if entry.local[blocker] {
        // Never wait on a client in our own process: the kernel cannot see
        // that cycle, so ordering discipline upstream is the only defense.
        return Ok(false);
    }

    match byte_range_lock(entry.map.file(), anchor, LockMode::Exclusive, false) {
        Ok(()) => {
            // Exclusive lock on a foreign slot == the owner is dead.
            let res = server::rollback_client(&entry.map, pager, blocker);
            let _ = byte_range_lock(entry.map.file(), anchor, LockMode::None, false);
            res.map(|()| true)
        }
        Err(HmaError::Busy) if blocking => {
            // The blocker is alive. Park on its transaction-lifetime
            // exclusive lock until it ends or dies, then retry the page.
            match byte_range_lock(entry.map.file(), anchor, LockMode::Shared, true) {
                Ok(()) => {
                    let _ = byte_range_lock(entry.map.file(), anchor, LockMode::None, false);
                    Ok(true)
                }
                Err(HmaError::BusyDeadlock) => Err(HmaError::BusyDeadlock),
                Err(_) => Ok(false),
            }
        }
        Err(HmaError::Busy) => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
pub(crate) fn live_client_count(hma: &Arc<HmaMap>) -> usize {
    REGISTRY
        .lock()
        .iter()
        .find(|e| Arc::ptr_eq(&e.map, hma))
        .map_or(0, |e| e.clients)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex as StdMutex;

    struct TestPager {
        db_path: PathBuf,
        rollbacks: StdMutex<Vec<usize>>,
        grant_db_lock: bool,
    }

    impl TestPager {
        fn new(db_path: PathBuf, grant_db_lock: bool) -> Arc<Self> {
            Arc::new(Self {
                db_path,
                rollbacks: StdMutex::new(Vec::new()),
                grant_db_lock,
            })
        }
    }

    impl Pager for TestPager {
        fn filename(&self) -> &Path {
            &self.db_path
        }

        fn rollback_journal(&self, client_id: usize) -> Result<()> {
            self.rollbacks.lock().unwrap().push(client_id);
            Ok(())
        }

        fn try_exclusive_db_lock(&self) -> bool {
            self.grant_db_lock
        }
    }

    fn scratch_db(dir: &tempfile::TempDir) -> PathBuf {
        let db = dir.path().join("data.db");
        std::fs::write(&db, b"db").unwrap();
        db
    }

    #[test]
    fn connects_to_same_database_share_one_handle() {
        let dir = tempfile::tempdir().unwrap();
        let db = scratch_db(&dir);
        let pager = TestPager::new(db, true);

        let a = connect(pager.clone()).unwrap();
        let b = connect(pager.clone()).unwrap();

        assert!(Arc::ptr_eq(&a.hma, &b.hma));
        assert_eq!(a.client_id(), 0);
        assert_eq!(b.client_id(), 1);
        assert_eq!(live_client_count(&a.hma), 2);

        drop(b);
        assert_eq!(live_client_count(&a.hma), 1);
    }

    #[test]
    fn missing_database_file_is_cant_open() {
        let dir = tempfile::tempdir().unwrap();
        let pager = TestPager::new(dir.path().join("absent.db"), true);
        assert!(matches!(connect(pager), Err(HmaError::CantOpen(_))));
    }

    #[test]
    fn unlink_on_last_disconnect_when_db_lock_granted() {
        let dir = tempfile::tempdir().unwrap();
        let db = scratch_db(&dir);
        let hma_path = {
            let mut name = db.clone().into_os_string();
            name.push(crate::config::HMA_SUFFIX);
            PathBuf::from(name)
        };

        let pager = TestPager::new(db, true);
        let server = connect(pager).unwrap();
        assert!(hma_path.exists());

        drop(server);
        assert!(!hma_path.exists(), "last client out should unlink the file");
    }

    #[test]
    fn no_unlink_when_db_lock_refused() {
        let dir = tempfile::tempdir().unwrap();
        let db = scratch_db(&dir);
        let hma_path = {
            let mut name = db.clone().into_os_string();
            name.push(crate::config::HMA_SUFFIX);
            PathBuf::from(name)
        };

        let pager = TestPager::new(db, false);
        let server = connect(pager).unwrap();
        drop(server);

        assert!(
            hma_path.exists(),
            "the file must survive while another process may be attached"
        );
    }

    #[test]
    fn crashed_slot_is_recovered_at_connect() {
        let dir = tempfile::tempdir().unwrap();
        let db = scratch_db(&dir);
        let pager = TestPager::new(db, true);

        let survivor = connect(pager.clone()).unwrap();
        pager.rollbacks.lock().unwrap().clear();

        // Forge the debris of a crashed client in slot 1: an occupied slot
        // word with page locks still encoded, and no byte-range lock
        // holder (the kernel dropped it when the process died).
        let crashed = 1;
        survivor
            .hma
            .client_word(crashed)
            .store(1, Ordering::SeqCst);
        let word = layout::with_write_holder(layout::read_bit(crashed), crashed);
        survivor.hma.page_word(7).store(word, Ordering::SeqCst);

        let replacement = connect(pager.clone()).unwrap();
        assert_eq!(replacement.client_id(), crashed);

        let rollbacks = pager.rollbacks.lock().unwrap();
        assert_eq!(&*rollbacks, &[crashed], "exactly one rollback for the slot");
        assert_eq!(survivor.hma.page_word(7).load(Ordering::SeqCst), 0);
        assert_eq!(
            survivor.hma.client_word(crashed).load(Ordering::SeqCst),
            1,
            "the replacement re-marks the slot as occupied"
        );
    }
}

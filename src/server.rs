//! # Page Lock Engine
//!
//! Per-client lock state and the lock-free acquisition protocol over the
//! shared page-lock words.
//!
//! ## Lock Levels
//!
//! Per (page, client) the engine moves through four states, all encoded in
//! the page's single 32-bit word (see [`crate::hma::layout`]):
//!
//! ```text
//! ┌────────┐  set read bit   ┌────────┐  set writer field  ┌──────────┐
//! │ NoLock │ ──────────────> │ Shared │ ─────────────────> │ Reserved │
//! └────────┘                 └────────┘                    └──────────┘
//!      ^                          │                             │
//!      │                          │                             │ foreign read
//!      │        clear bit +       │                             │ bits drain
//!      │        writer field      v                             v
//!      └────────────────────── (end) <──────────────────── ┌───────────┐
//!                                                          │ Exclusive │
//!                                                          └───────────┘
//! ```
//!
//! RESERVED exists so a blocking writer can stop new readers from joining
//! while it waits for the existing ones to drain; EXCLUSIVE is the same
//! word once the read bitmask holds at most the writer's own bit.
//!
//! ## Acquisition Protocol
//!
//! Every mutation is a sequentially-consistent compare-exchange: the word
//! is re-read and the transition re-validated on every CAS failure, so the
//! loops only spin through transient races with other processes that are
//! mid-install. Extended waiting happens exclusively inside the conflict
//! arbitration path ([`crate::registry::resolve_conflict`]), parked on a
//! byte-range lock, never in the CAS loops.
//!
//! ## Crash Recovery
//!
//! A conflicting client that died mid-transaction is detected through its
//! slot anchor (exclusive byte-range lock obtainable == owner dead), its
//! journal rolled back via the pager, and its bits scrubbed from every
//! page word; the interrupted acquisition then retries as if the crash had
//! never been observed. Peer crashes are invisible to callers.
//!
//! ## Threading
//!
//! A [`Server`] is a single-client record: it is `Send` but deliberately
//! has `&mut` operations, so a caller that shares one across threads must
//! serialize externally. The shared mapping itself tolerates any number of
//! concurrent clients.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::{LOCK_LIST_INITIAL_CAPACITY, PAGELOCK_SLOTS, PAGELOCK_WORD_BASE};
use crate::error::{HmaError, Result};
use crate::hma::{layout, HmaMap};
use crate::oslock::{byte_range_lock, LockMode};
use crate::pager::Pager;
use crate::registry;

/// A connected client of one database's coordination file.
///
/// Created by [`crate::connect`]; the claimed client slot, the shared
/// liveness lock on it, and any page locks still recorded are released
/// when the `Server` is dropped (or [`disconnect`](Server::disconnect)ed).
pub struct Server {
    pub(crate) hma: Arc<HmaMap>,
    client_id: usize,
    pager: Arc<dyn Pager>,
    /// Pages locked since the last `end`, in acquisition order. Entries
    /// are recorded before the word is mutated and survive failed
    /// acquisitions; release is idempotent per entry.
    locked_pages: Vec<u32>,
    /// Cumulative time spent holding the writer sentinel (page 0).
    write_micros: u64,
    /// Start of the current writer period, when page 0 is held.
    write_started: Option<Instant>,
}

impl Server {
    pub(crate) fn new(hma: Arc<HmaMap>, client_id: usize, pager: Arc<dyn Pager>) -> Self {
        Self {
            hma,
            client_id,
            pager,
            locked_pages: Vec::with_capacity(LOCK_LIST_INITIAL_CAPACITY),
            write_micros: 0,
            write_started: None,
        }
    }

    /// The client slot id this connection occupies, in `0..CLIENT_SLOTS`.
    pub fn client_id(&self) -> usize {
        self.client_id
    }

    /// Cumulative time this client has held the writer sentinel.
    pub fn write_time(&self) -> Duration {
        Duration::from_micros(self.write_micros)
    }

    /// Begin a transaction.
    ///
    /// Upgrades the client's own slot anchor to an exclusive byte-range
    /// lock for the duration of the transaction, which lets contending
    /// processes distinguish "busy" from "dead" cheaply, then takes the
    /// writer sentinel (page 0) with a blocking write lock.
    pub fn begin(&mut self) -> Result<()> {
        byte_range_lock(
            self.hma.file(),
            layout::client_word_index(self.client_id),
            LockMode::Exclusive,
            true,
        )?;
        self.lock(0, true, true)
    }

    /// End a transaction: release every page lock recorded since the last
    /// `end`, in recorded order, then downgrade the slot anchor back to
    /// the shared liveness lock.
    pub fn end(&mut self) -> Result<()> {
        let hma = Arc::clone(&self.hma);
        for k in 0..self.locked_pages.len() {
            let pgno = self.locked_pages[k];
            let slot = hma.page_word(pgno);
            let mut v = slot.load(Ordering::SeqCst);
            loop {
                let mut n = v & !layout::read_bit(self.client_id);
                if layout::write_holder(v) == Some(self.client_id) {
                    n = layout::clear_write_holder(n);
                }
                if n == v {
                    break;
                }
                match slot.compare_exchange(v, n, Ordering::SeqCst, Ordering::SeqCst) {
                    Ok(_) => break,
                    Err(current) => v = current,
                }
            }
            if pgno == 0 {
                self.note_writer_release();
            }
        }
        self.locked_pages.clear();
        byte_range_lock(
            hma.file(),
            layout::client_word_index(self.client_id),
            LockMode::Shared,
            false,
        )
    }

    /// Acquire a SHARED (`write = false`) or EXCLUSIVE (`write = true`)
    /// lock on `pgno`.
    ///
    /// Under `blocking`, a write request that finds readers first installs
    /// the RESERVED marker so no new readers join, then waits for the
    /// existing ones on their liveness anchors. Conflicts with clients
    /// that turn out to be dead are recovered transparently and the
    /// acquisition retried; conflicts with live clients that cannot be
    /// waited on surface as [`HmaError::BusyDeadlock`].
    pub fn lock(&mut self, pgno: u32, write: bool, blocking: bool) -> Result<()> {
        let hma = Arc::clone(&self.hma);
        let slot = hma.page_word(pgno);

        // Already held at the requested level?
        let v = slot.load(Ordering::SeqCst);
        if write {
            if layout::write_holder(v) == Some(self.client_id) {
                return Ok(());
            }
        } else if v & layout::read_bit(self.client_id) != 0 {
            return Ok(());
        }

        // Record the page first so `end` can scrub it whether or not the
        // word mutation below completes.
        self.locked_pages
            .try_reserve(1)
            .map_err(|_| HmaError::NoMem)?;
        self.locked_pages.push(pgno);

        let mut reserved = false;
        let result = self.acquire(slot, pgno, write, blocking, &mut reserved);

        if result.is_err() && reserved {
            // Back the RESERVED marker out so waiting readers can proceed.
            let mut v = slot.load(Ordering::SeqCst);
            loop {
                debug_assert_eq!(layout::write_holder(v), Some(self.client_id));
                match slot.compare_exchange(
                    v,
                    layout::clear_write_holder(v),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => break,
                    Err(current) => v = current,
                }
            }
        }

        if result.is_ok() && pgno == 0 {
            self.write_started = Some(Instant::now());
        }
        result
    }

    fn acquire(
        &self,
        slot: &AtomicU32,
        pgno: u32,
        write: bool,
        blocking: bool,
        reserved: &mut bool,
    ) -> Result<()> {
        let me = self.client_id;
        let mask = if write {
            layout::READ_MASK & !layout::read_bit(me)
        } else {
            0
        };

        let mut v = slot.load(Ordering::SeqCst);
        loop {
            loop {
                let holder = layout::write_holder(v);
                let foreign_writer = matches!(holder, Some(h) if h != me);
                if !foreign_writer && v & mask == 0 {
                    break;
                }

                if holder.is_none() && write && blocking {
                    // Claim RESERVED before anything else: existing readers
                    // may finish but no new ones join while we wait.
                    let n = layout::with_write_holder(v, me);
                    match slot.compare_exchange(v, n, Ordering::SeqCst, Ordering::SeqCst) {
                        Err(current) => {
                            v = current;
                            continue;
                        }
                        Ok(_) => {
                            v = n;
                            *reserved = true;
                        }
                    }
                }

                let retry =
                    registry::resolve_conflict(&self.hma, self.pager.as_ref(), me, v, blocking)?;
                if !retry {
                    debug!(page = pgno, "page lock conflict");
                    return Err(HmaError::BusyDeadlock);
                }
                v = slot.load(Ordering::SeqCst);
            }

            let mut n = v | layout::read_bit(me);
            if write {
                n = layout::with_write_holder(n, me);
            }
            match slot.compare_exchange(v, n, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return Ok(()),
                Err(current) => v = current,
            }
        }
    }

    /// Answer from the word encoding alone whether this client holds
    /// `pgno` at the given level.
    pub fn has_lock(&self, pgno: u32, write: bool) -> bool {
        let v = self.hma.page_word(pgno).load(Ordering::SeqCst);
        if write {
            layout::write_holder(v) == Some(self.client_id)
        } else {
            v & layout::read_bit(self.client_id) != 0
        }
    }

    /// Release write locks ahead of transaction end.
    ///
    /// Currently a no-op; present so callers that stage their commit
    /// protocol around it need no changes when it gains a body.
    pub fn release_write_locks(&mut self) -> Result<()> {
        Ok(())
    }

    /// Disconnect from the coordination file, freeing the client slot.
    /// Dropping the `Server` performs the same cleanup.
    pub fn disconnect(self) {}

    fn note_writer_release(&mut self) {
        let Some(started) = self.write_started.take() else {
            return;
        };
        let period = started.elapsed().as_micros() as u64;
        let before = self.write_micros;
        self.write_micros += period;
        if before / 1_000_000 != self.write_micros / 1_000_000 {
            warn!(total_ms = self.write_micros / 1000, "cumulative writer time");
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        registry::disconnect(&self.hma, self.client_id, self.pager.as_ref());
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("client_id", &self.client_id)
            .field("locked_pages", &self.locked_pages.len())
            .field("write_micros", &self.write_micros)
            .finish()
    }
}

/// Recover a dead client: roll its journal back through the pager, then
/// scrub its read bit and writer-field claim from every page-lock word.
///
/// Called with the registry mutex held, either while reclaiming a slot at
/// connect or from conflict arbitration. Words already clean are left
/// untouched; dirty words are updated by CAS until the scrub sticks.
pub(crate) fn rollback_client(hma: &HmaMap, pager: &dyn Pager, client_id: usize) -> Result<()> {
    info!(client = client_id, "rolling back failed client");
    pager.rollback_journal(client_id)?;

    for index in 0..PAGELOCK_SLOTS {
        let slot = hma.word(PAGELOCK_WORD_BASE + index);
        let mut v = slot.load(Ordering::SeqCst);
        loop {
            let mut n = v & !layout::read_bit(client_id);
            if layout::write_holder(v) == Some(client_id) {
                n = layout::clear_write_holder(n);
            }
            if n == v {
                break;
            }
            match slot.compare_exchange(v, n, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => break,
                Err(current) => v = current,
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CLIENT_SLOTS, HMA_FILE_SIZE};
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    struct TestPager {
        db_path: PathBuf,
        rollbacks: Mutex<Vec<usize>>,
    }

    impl TestPager {
        fn create(dir: &tempfile::TempDir) -> Arc<Self> {
            let db_path = dir.path().join("data.db");
            std::fs::write(&db_path, b"db").unwrap();
            Arc::new(Self {
                db_path,
                rollbacks: Mutex::new(Vec::new()),
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
            true
        }
    }

    #[test]
    fn first_connect_initializes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let pager = TestPager::create(&dir);

        let server = registry::connect(pager.clone()).unwrap();
        assert_eq!(server.client_id(), 0);

        let meta = std::fs::metadata(server.hma.path()).unwrap();
        assert_eq!(meta.len(), HMA_FILE_SIZE as u64);
        assert_eq!(server.hma.client_word(0).load(Ordering::SeqCst), 1);
        for index in 0..PAGELOCK_SLOTS {
            assert_eq!(
                server.hma.word(PAGELOCK_WORD_BASE + index).load(Ordering::SeqCst),
                0
            );
        }
    }

    #[test]
    fn second_connect_joins_without_rollback() {
        let dir = tempfile::tempdir().unwrap();
        let pager = TestPager::create(&dir);

        let first = registry::connect(pager.clone()).unwrap();
        pager.rollbacks.lock().unwrap().clear();

        let second = registry::connect(pager.clone()).unwrap();
        assert_eq!(second.client_id(), 1);
        assert_eq!(first.hma.client_word(0).load(Ordering::SeqCst), 1);
        assert_eq!(first.hma.client_word(1).load(Ordering::SeqCst), 1);
        assert!(
            pager.rollbacks.lock().unwrap().is_empty(),
            "a clean slot needs no journal rollback"
        );
    }

    #[test]
    fn shared_locks_coexist() {
        let dir = tempfile::tempdir().unwrap();
        let pager = TestPager::create(&dir);

        let mut a = registry::connect(pager.clone()).unwrap();
        let mut b = registry::connect(pager.clone()).unwrap();

        a.lock(42, false, false).unwrap();
        b.lock(42, false, false).unwrap();
        assert!(a.has_lock(42, false));
        assert!(b.has_lock(42, false));

        let word = a.hma.page_word(42).load(Ordering::SeqCst);
        assert_eq!(word & layout::READ_MASK, layout::read_bit(0) | layout::read_bit(1));
        assert_eq!(layout::write_holder(word), None);
    }

    #[test]
    fn exclusive_conflicts_then_succeeds_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let pager = TestPager::create(&dir);

        let mut a = registry::connect(pager.clone()).unwrap();
        let mut b = registry::connect(pager.clone()).unwrap();

        a.lock(42, false, false).unwrap();
        assert!(matches!(
            b.lock(42, true, false),
            Err(HmaError::BusyDeadlock)
        ));
        assert!(!b.has_lock(42, true));

        a.end().unwrap();
        b.lock(42, true, false).unwrap();
        assert!(b.has_lock(42, true));
        assert!(b.has_lock(42, false));

        let word = b.hma.page_word(42).load(Ordering::SeqCst);
        assert_eq!(layout::write_holder(word), Some(1));
        assert_eq!(word & layout::READ_MASK, layout::read_bit(1));
    }

    #[test]
    fn failed_blocking_write_rolls_reserved_marker_back() {
        let dir = tempfile::tempdir().unwrap();
        let pager = TestPager::create(&dir);

        let mut a = registry::connect(pager.clone()).unwrap();
        let mut b = registry::connect(pager.clone()).unwrap();

        a.lock(7, false, false).unwrap();
        // The blocker is in this process, so even a blocking request must
        // refuse to wait; the RESERVED marker it installed on the way in
        // has to be gone again afterwards.
        assert!(matches!(b.lock(7, true, true), Err(HmaError::BusyDeadlock)));

        let word = a.hma.page_word(7).load(Ordering::SeqCst);
        assert_eq!(layout::write_holder(word), None);
        assert_eq!(word & layout::READ_MASK, layout::read_bit(0));
    }

    #[test]
    fn two_writers_never_hold_the_same_page() {
        let dir = tempfile::tempdir().unwrap();
        let pager = TestPager::create(&dir);

        let mut a = registry::connect(pager.clone()).unwrap();
        let mut b = registry::connect(pager.clone()).unwrap();

        a.lock(17, true, false).unwrap();
        assert!(matches!(b.lock(17, true, false), Err(HmaError::BusyDeadlock)));
        assert!(a.has_lock(17, true));
        assert!(!b.has_lock(17, true));

        a.end().unwrap();
        b.lock(17, true, false).unwrap();
        assert!(!a.has_lock(17, true));
        assert!(b.has_lock(17, true));
    }

    #[test]
    fn reserved_refuses_new_readers_but_keeps_existing_ones() {
        let dir = tempfile::tempdir().unwrap();
        let pager = TestPager::create(&dir);

        let reader = registry::connect(pager.clone()).unwrap();
        let writer = registry::connect(pager.clone()).unwrap();
        let mut late = registry::connect(pager.clone()).unwrap();

        // Page 55 in the RESERVED state: the writer's claim is installed
        // while the earlier reader's bit is still draining.
        let word = layout::with_write_holder(
            layout::read_bit(reader.client_id()) | layout::read_bit(writer.client_id()),
            writer.client_id(),
        );
        reader.hma.page_word(55).store(word, Ordering::SeqCst);

        assert!(reader.has_lock(55, false), "existing reader is undisturbed");
        assert!(matches!(
            late.lock(55, false, false),
            Err(HmaError::BusyDeadlock)
        ));

        // Once the writer's claim drops, new readers are admitted again.
        reader
            .hma
            .page_word(55)
            .store(layout::read_bit(reader.client_id()), Ordering::SeqCst);
        late.lock(55, false, false).unwrap();
        assert!(late.has_lock(55, false));
    }

    #[test]
    fn end_releases_every_recorded_page() {
        let dir = tempfile::tempdir().unwrap();
        let pager = TestPager::create(&dir);

        let mut server = registry::connect(pager.clone()).unwrap();
        for pgno in [3u32, 9, 27, 81] {
            server.lock(pgno, pgno % 2 == 1, false).unwrap();
        }
        server.end().unwrap();

        for pgno in [3u32, 9, 27, 81] {
            let word = server.hma.page_word(pgno).load(Ordering::SeqCst);
            assert_eq!(word & layout::read_bit(0), 0);
            assert_ne!(layout::write_holder(word), Some(0));
            assert!(!server.has_lock(pgno, false));
            assert!(!server.has_lock(pgno, true));
        }
    }

    #[test]
    fn relock_after_end_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let pager = TestPager::create(&dir);

        let mut server = registry::connect(pager.clone()).unwrap();
        server.lock(5, true, false).unwrap();
        server.end().unwrap();
        server.lock(5, false, false).unwrap();

        let word = server.hma.page_word(5).load(Ordering::SeqCst);
        assert_eq!(layout::write_holder(word), None);
        assert_eq!(word & layout::READ_MASK, layout::read_bit(0));
    }

    #[test]
    fn lock_is_idempotent_per_level() {
        let dir = tempfile::tempdir().unwrap();
        let pager = TestPager::create(&dir);

        let mut server = registry::connect(pager.clone()).unwrap();
        server.lock(11, false, false).unwrap();
        server.lock(11, false, false).unwrap();
        assert_eq!(server.locked_pages.len(), 1, "re-acquisition records nothing");

        server.lock(11, true, false).unwrap();
        server.lock(11, true, false).unwrap();
        assert_eq!(server.locked_pages.len(), 2, "the upgrade is recorded once");
    }

    #[test]
    fn dead_remote_client_is_recovered_during_lock() {
        let dir = tempfile::tempdir().unwrap();
        let pager = TestPager::create(&dir);

        let mut server = registry::connect(pager.clone()).unwrap();
        pager.rollbacks.lock().unwrap().clear();

        // Forge a reader from another process that died holding page 13:
        // slot word occupied, read bit set, no byte-range lock held.
        let ghost = 9;
        server.hma.client_word(ghost).store(1, Ordering::SeqCst);
        server
            .hma
            .page_word(13)
            .store(layout::read_bit(ghost), Ordering::SeqCst);

        server.lock(13, true, false).unwrap();
        assert!(server.has_lock(13, true));
        assert_eq!(&*pager.rollbacks.lock().unwrap(), &[ghost]);

        let word = server.hma.page_word(13).load(Ordering::SeqCst);
        assert_eq!(word & layout::read_bit(ghost), 0, "ghost bits scrubbed");
        assert_eq!(layout::write_holder(word), Some(0));
    }

    #[test]
    fn begin_takes_the_writer_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let pager = TestPager::create(&dir);

        let mut server = registry::connect(pager.clone()).unwrap();
        server.begin().unwrap();
        assert!(server.has_lock(0, true));

        std::thread::sleep(Duration::from_millis(2));
        server.end().unwrap();
        assert!(!server.has_lock(0, true));
        assert!(server.write_time() >= Duration::from_millis(1));
    }

    #[test]
    fn full_house_returns_busy() {
        let dir = tempfile::tempdir().unwrap();
        let pager = TestPager::create(&dir);

        let cohort: Vec<Server> = (0..CLIENT_SLOTS)
            .map(|expected| {
                let server = registry::connect(pager.clone()).unwrap();
                assert_eq!(server.client_id(), expected);
                server
            })
            .collect();

        assert!(matches!(registry::connect(pager.clone()), Err(HmaError::Busy)));
        drop(cohort);

        // Slots free up again once the cohort is gone.
        let server = registry::connect(pager).unwrap();
        assert_eq!(server.client_id(), 0);
    }

    #[test]
    fn rollback_scrubs_only_the_target_client() {
        let dir = tempfile::tempdir().unwrap();
        let pager = TestPager::create(&dir);
        let server = registry::connect(pager.clone()).unwrap();

        let word = layout::with_write_holder(
            layout::read_bit(2) | layout::read_bit(5),
            2,
        );
        server.hma.page_word(99).store(word, Ordering::SeqCst);

        rollback_client(&server.hma, pager.as_ref(), 2).unwrap();

        let scrubbed = server.hma.page_word(99).load(Ordering::SeqCst);
        assert_eq!(scrubbed, layout::read_bit(5));
    }
}

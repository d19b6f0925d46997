//! # Coordination-File Constants
//!
//! All fixed parameters of the heap-mapped area (HMA) file and the lock
//! engine live here. Constants that depend on each other are co-located and
//! guarded by compile-time assertions so they cannot drift apart.
//!
//! ## File Layout
//!
//! The HMA file is a flat array of little-endian 32-bit words:
//!
//! ```text
//! Offset (bytes)   Size        Contents
//! 0                4           DMS word (byte-range-lock anchor only)
//! 4                4 * 16      Client slot words (0 = free)
//! 68               4 * 262144  Page-lock slot words
//! ```
//!
//! Total size: 1,048,644 bytes.
//!
//! ## Dependency Graph
//!
//! ```text
//! CLIENT_SLOTS (16)
//!       │
//!       ├─> page-word encoding: read bitmask occupies bits [0, CLIENT_SLOTS),
//!       │   the writer field occupies the remaining high bits and must be
//!       │   able to store CLIENT_SLOTS + 1 distinct values
//!       │
//!       ├─> CLIENT_SLOT_LIMIT (26): hard ceiling the 32-bit encoding allows
//!       │
//!       └─> PAGELOCK_WORD_BASE (1 + CLIENT_SLOTS)
//!
//! PAGELOCK_SLOTS (262144)
//!       │
//!       └─> HMA_FILE_SIZE = 4 * (1 + CLIENT_SLOTS + PAGELOCK_SLOTS)
//! ```

/// Number of client slots in the HMA file. One slot per concurrent
/// connection to the same database across all processes.
pub const CLIENT_SLOTS: usize = 16;

/// Hard ceiling on `CLIENT_SLOTS` imposed by the page-word encoding: the
/// writer field must fit client ids plus the zero sentinel in the bits left
/// over after the read bitmask.
pub const CLIENT_SLOT_LIMIT: usize = 26;

/// Number of page-lock words. Page `p` maps to word `p % PAGELOCK_SLOTS`,
/// so distinct pages may share a word; a shared word only widens conflicts,
/// it never hides them.
pub const PAGELOCK_SLOTS: usize = 256 * 1024;

/// Size in bytes of one HMA word.
pub const WORD_SIZE: usize = 4;

/// Word index of the dead-man-switch slot. Every connected client holds a
/// shared byte-range lock here; the first client to connect holds it
/// exclusively while it initializes the file.
pub const DMS_WORD: usize = 0;

/// Word index of the first client slot.
pub const CLIENT_WORD_BASE: usize = 1;

/// Word index of the first page-lock slot.
pub const PAGELOCK_WORD_BASE: usize = CLIENT_WORD_BASE + CLIENT_SLOTS;

/// Total size of the HMA file in bytes.
pub const HMA_FILE_SIZE: usize = WORD_SIZE * (1 + CLIENT_SLOTS + PAGELOCK_SLOTS);

/// Suffix appended to the database path to name its coordination file.
pub const HMA_SUFFIX: &str = "-hma";

/// Initial capacity of a client's per-transaction locked-page list. The
/// list grows geometrically from here.
pub const LOCK_LIST_INITIAL_CAPACITY: usize = 128;

const _: () = assert!(
    CLIENT_SLOTS <= CLIENT_SLOT_LIMIT,
    "CLIENT_SLOTS exceeds what the page-word encoding can address"
);

const _: () = assert!(
    (1_u64 << (32 - CLIENT_SLOTS)) > CLIENT_SLOTS as u64,
    "writer field too narrow to store every client id plus the zero sentinel"
);

// The on-disk format is little-endian and page words are mutated in place
// with native 32-bit CAS, so the two representations must coincide.
const _: () = assert!(
    cfg!(target_endian = "little"),
    "hmalock requires a little-endian target"
);

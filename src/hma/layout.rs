//! Bit-packed page-word encoding.
//!
//! Each page-lock word packs two sections:
//!
//! ```text
//!  31           16 15            0
//! ┌───────────────┬───────────────┐
//! │ writer field  │ read bitmask  │
//! └───────────────┴───────────────┘
//! ```
//!
//! - Bit `i` of the read bitmask is set while client `i` holds a SHARED
//!   lock on the page.
//! - The writer field holds `0` (no writer) or `i + 1` while client `i`
//!   holds a RESERVED or EXCLUSIVE lock. It is a single integer, never a
//!   bitmask, so at most one client can be the writer.
//!
//! RESERVED means the writer field names a client while other read bits
//! remain set: existing readers may finish, new readers are refused.
//! EXCLUSIVE is the same word once every foreign read bit has drained.

use crate::config::{CLIENT_SLOTS, PAGELOCK_SLOTS, PAGELOCK_WORD_BASE};

/// Mask covering the read-bit section of a page word.
pub const READ_MASK: u32 = (1 << CLIENT_SLOTS) - 1;

/// The read bit owned by `client`.
#[inline]
pub const fn read_bit(client: usize) -> u32 {
    1 << client
}

/// The client currently named by the writer field, if any.
#[inline]
pub const fn write_holder(word: u32) -> Option<usize> {
    match word >> CLIENT_SLOTS {
        0 => None,
        w => Some(w as usize - 1),
    }
}

/// Set the writer field to `client`. The field must be empty or already
/// name `client`; the two encodings are identical under OR.
#[inline]
pub const fn with_write_holder(word: u32, client: usize) -> u32 {
    word | (((client + 1) as u32) << CLIENT_SLOTS)
}

/// Clear the writer field, leaving the read bitmask untouched.
#[inline]
pub const fn clear_write_holder(word: u32) -> u32 {
    word & READ_MASK
}

/// Word index of the page-lock slot coordinating `pgno`.
#[inline]
pub const fn page_word_index(pgno: u32) -> usize {
    PAGELOCK_WORD_BASE + (pgno as usize % PAGELOCK_SLOTS)
}

/// Word index of client `i`'s slot.
#[inline]
pub const fn client_word_index(client: usize) -> usize {
    crate::config::CLIENT_WORD_BASE + client
}

//! # Heap-Mapped Area (HMA)
//!
//! The coordination file shared by every process connected to the same
//! database. The file is a flat array of little-endian 32-bit words (see
//! [`crate::config::constants`] for the exact layout): one dead-man-switch
//! word, one word per client slot, and one bit-packed lock word per page
//! slot.
//!
//! - [`layout`]: pure word-index arithmetic and the page-word bit encoding
//! - [`map`]: the per-process mapper (`HmaMap`) with atomic word views
//!
//! Page words are only ever mutated with 32-bit compare-and-swap, so a
//! reader anywhere in the system observes either the old or the new fully
//! installed encoding, never a torn intermediate.

pub mod layout;
pub(crate) mod map;

pub(crate) use map::HmaMap;

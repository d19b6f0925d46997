//! # Configuration Module
//!
//! This module centralizes the fixed parameters of the coordination-file
//! format and the lock engine. The values are interdependent (the page-word
//! encoding must be able to address every client slot) and are documented
//! and enforced together in [`constants`].

pub mod constants;
pub use constants::*;

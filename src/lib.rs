//! # hmalock - Multi-Process Page-Level Lock Manager
//!
//! `hmalock` lets several independent processes, each embedding an
//! otherwise single-writer storage engine, safely share one on-disk
//! database. Coordination happens through a small memory-mapped auxiliary
//! file (the *heap-mapped area*, HMA) that every participating process
//! maps and mutates with atomic compare-and-swap, backed by advisory POSIX
//! byte-range locks for liveness and crash detection.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │        Public API (connect / Server)       │
//! ├───────────────────────────────────────────┤
//! │  Client Registry (slot allocation, dedup)  │
//! ├──────────────────────┬────────────────────┤
//! │  Page Lock Engine    │  OS Lock Primitive │
//! │  (CAS over words)    │  (fcntl, 1 byte)   │
//! ├──────────────────────┴────────────────────┤
//! │       HMA Mapper (mmap, word views)        │
//! └───────────────────────────────────────────┘
//! ```
//!
//! ## Coordination File
//!
//! For a database at `path`, the coordination file is `path-hma`: one
//! dead-man-switch word, 16 client-slot words, and 262,144 bit-packed
//! page-lock words (1,048,644 bytes total). Page locks are entirely
//! CAS-driven; byte-range locks touch only the DMS and client-slot words,
//! where they encode "someone is connected" and "this client is alive".
//!
//! ## Lock Compatibility
//!
//! Any number of clients may hold SHARED on a page. A RESERVED holder
//! tolerates the readers that were already there but starves new ones;
//! EXCLUSIVE excludes everything. A client that dies mid-transaction is
//! detected by the next client that trips over its locks, its journal
//! rolled back through the [`Pager`] seam, and its slot reclaimed.
//!
//! ## Quick Start
//!
//! ```ignore
//! use hmalock::{connect, Pager};
//!
//! let server = connect(pager)?;          // pager: Arc<dyn Pager>
//! server.begin()?;                       // take the writer sentinel
//! server.lock(42, true, true)?;          // EXCLUSIVE on page 42
//! // ... mutate page 42 through the storage engine ...
//! server.end()?;                         // release everything
//! ```
//!
//! ## Scope
//!
//! SQL, B-trees, the pager cache, the journal format and the VFS live in
//! the embedding engine; [`Pager`] is the entire seam to them. Unix only.

pub mod config;
mod error;
pub mod hma;
mod oslock;
mod pager;
mod registry;
mod server;

pub use error::{HmaError, Result};
pub use pager::Pager;
pub use registry::connect;
pub use server::Server;

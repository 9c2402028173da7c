//! logmesh Storage Layer
//!
//! This crate implements the segmented storage engine behind a logmesh
//! node: durable append, offset-indexed random read, bulk scan, truncation
//! and crash recovery.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │ CommitLog                                  │
//! │  routes appends to the active segment,     │
//! │  reads by offset range, rotates on fill    │
//! ├──────────────┬──────────────┬──────────────┤
//! │ Segment 0    │ Segment 3    │ Segment 7    │
//! │ ┌──────────┐ │ ┌──────────┐ │ ┌──────────┐ │
//! │ │ Store    │ │ │ Store    │ │ │ Store    │ │  length-prefixed frames
//! │ ├──────────┤ │ ├──────────┤ │ ├──────────┤ │
//! │ │ Index    │ │ │ Index    │ │ │ Index    │ │  mmap'd offset → position
//! │ └──────────┘ │ └──────────┘ │ └──────────┘ │
//! └──────────────┴──────────────┴──────────────┘
//! ```
//!
//! Records are prost-encoded `logmesh_proto::v1::Record` frames; the store
//! length-prefixes each frame, so the codec carries no length of its own
//! and `CommitLog::reader()` consumers can walk the raw byte stream with
//! nothing but the prefix.
//!
//! ## Main Components
//!
//! - [`Store`]: append-only byte file with buffered writes and positional
//!   reads.
//! - [`OffsetIndex`]: memory-mapped fixed-width index, pre-grown while
//!   open, truncated to its logical size on close.
//! - [`Segment`]: one store paired with one index over a contiguous offset
//!   range.
//! - [`CommitLog`]: the ordered segment collection the rest of the system
//!   appends to and reads from.

pub mod index;
pub mod log;
pub mod segment;
pub mod store;

pub use index::OffsetIndex;
pub use log::{CommitLog, LogReader};
pub use segment::Segment;
pub use store::Store;

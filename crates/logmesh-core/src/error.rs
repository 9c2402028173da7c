//! Error Types for logmesh
//!
//! This module defines the error taxonomy shared by the storage stack and
//! the cluster layer.
//!
//! ## Error Categories
//!
//! ### Read Errors
//! - `OffsetOutOfRange`: the requested offset lies outside the log's
//!   `[lowest, highest]` range. Carries the offending offset so callers can
//!   decide to wait for replication or produce first.
//!
//! ### Control Signals
//! - `EndOfStream`: the index has no entry at the requested slot, or has no
//!   room for another one. This is not a fault; the log uses it to drive
//!   segment rotation and segment open uses it to detect an empty index.
//!
//! ### Faults
//! - `Io`: any underlying filesystem or network failure, propagated verbatim.
//! - `Decode`: a stored frame did not decode as a record.
//! - `SegmentInconsistent`: a store append succeeded but the paired index
//!   write failed, leaving orphan bytes in the store. The log stops
//!   accepting writes once this is observed; recovery requires operator
//!   truncation.
//! - `MalformedDir`: the log directory contains store/index files that do
//!   not pair up.
//! - `Closed`: the log was closed and no longer accepts operations.
//!
//! ## Usage
//!
//! All fallible operations return `Result<T>`, aliased to
//! `Result<T, Error>`, so `?` propagation works throughout.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("offset out of range: {0}")]
    OffsetOutOfRange(u64),

    /// Index slot empty or index full. A control signal, not a fault.
    #[error("end of stream")]
    EndOfStream,

    #[error("record decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("segment {base_offset} left inconsistent by a failed index write")]
    SegmentInconsistent { base_offset: u64 },

    #[error("malformed log directory: {0}")]
    MalformedDir(String),

    #[error("log closed")]
    Closed,
}

impl Error {
    /// True for the end-of-stream / no-space control signal.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Error::EndOfStream)
    }
}

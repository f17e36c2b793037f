//! Error types for undo request management.
//!
//! Only reportable failures live here: corruption found while restoring
//! saved request state, and lookup misses on the recovery path. Soft
//! capacity exhaustion is a `None` return, not an error, and invariant
//! violations inside the manager are panics; commit- and abort-side
//! operations have no error path at all.

use thiserror::Error;
use undoq_types::{FullXid, RecordDecodeError};

/// Primary error type for undo request manager operations.
#[derive(Error, Debug)]
pub enum UndoError {
    /// The saved state blob is not a whole number of records.
    #[error(
        "saved undo request state is corrupt: {len} bytes is not a whole number of {record_bytes}-byte records"
    )]
    CorruptSaveState { len: usize, record_bytes: usize },

    /// The saved state holds more requests than this manager can admit.
    #[error("too many saved undo requests: {count} records, but capacity is {capacity}")]
    SaveStateOverCapacity { count: usize, capacity: usize },

    /// A record in the saved state failed to decode.
    #[error("corrupt undo request record at byte offset {offset}: {source}")]
    CorruptRecord {
        offset: usize,
        source: RecordDecodeError,
    },

    /// No pending request exists for the given transaction.
    #[error("no pending undo request for {fxid}")]
    RequestNotFound { fxid: FullXid },
}

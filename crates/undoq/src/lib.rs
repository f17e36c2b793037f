//! Background undo request management for a transactional storage engine.
//!
//! Every transaction that writes durable undo registers a request here
//! before the first undo byte lands. On commit the request is discarded;
//! on abort (or after a crash) it carries what the background undo workers
//! need to apply the transaction's undo actions later. This crate is the
//! in-memory manager for those requests:
//!
//! - [`arena`]: fixed-size pools for request records and index nodes, with
//!   intrusive free lists; nothing allocates after initialization.
//! - [`index`]: three orderings over the live set (oldest transaction,
//!   largest undo, soonest retry), as AVL trees over the shared node pool.
//! - [`manager`]: the request lifecycle, the round-robin scheduler with
//!   database affinity and retry gating, the retry backoff, and the
//!   serialization that carries the listed set across a restart.
//! - [`clock`]: the monotonic timestamp seam the embedding plugs into.

pub mod arena;
pub mod clock;
pub mod index;
pub mod manager;

pub use arena::{IndexMembership, IndexNode, NodeIdx, NodePool, RequestArena, RequestIdx, RequestSlot};
pub use clock::{ManualClock, SystemClock, UndoClock};
pub use index::{InorderIter, RequestIndex, SortOrder, MAX_TREE_DEPTH};
pub use manager::{
    ClaimedRequest, ManagerStats, RequestHandle, UndoManagerConfig, UndoRequestManager,
    FIRST_RETRY_DELAY, SUBSEQUENT_RETRY_DELAY,
};
pub use undoq_error::UndoError;
pub use undoq_types::{
    DatabaseId, FullXid, RecordDecodeError, Timestamp, UndoClass, UndoRecPtr, UndoRequestData,
    UndoSpan,
};

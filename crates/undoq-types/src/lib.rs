//! Core vocabulary types for background undo request management.
//!
//! This crate defines the cross-cutting identifiers shared by the undo
//! request manager and its embedders: transaction ids, database ids, undo
//! log locations, and the monotonic timestamps used for retry scheduling.
//! The persistent request record and its fixed-width codec live in
//! [`record`].

use std::fmt;
use std::num::NonZeroU64;
use std::time::Duration;

pub mod encoding;
pub mod record;

pub use record::{RecordDecodeError, UndoClass, UndoRequestData};

/// Full, epoch-extended 64-bit transaction identifier.
///
/// Domain: `1..=u64::MAX`. Zero is the invalid sentinel and is represented
/// as `Option::<FullXid>::None` rather than as a reserved in-domain value.
/// Full xids are monotonic over time, so `Ord` on the raw value is the
/// "precedes" relation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct FullXid(NonZeroU64);

impl FullXid {
    /// Construct a `FullXid` if `raw` is non-zero.
    #[inline]
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Get the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for FullXid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fxid#{}", self.get())
    }
}

/// Identifier of the database a request belongs to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct DatabaseId(u32);

impl DatabaseId {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "db#{}", self.get())
    }
}

/// Opaque location in the undo log.
///
/// The manager never interprets these beyond validity; they are carried for
/// the undo workers. Zero is the invalid sentinel, represented as
/// `Option::<UndoRecPtr>::None` in memory and as a zero word on the wire.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct UndoRecPtr(NonZeroU64);

impl UndoRecPtr {
    /// Construct an `UndoRecPtr` if `raw` is non-zero.
    #[inline]
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Get the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for UndoRecPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "undo@{:#018x}", self.get())
    }
}

/// A contiguous range of undo log locations, both ends valid.
///
/// A transaction that wrote no undo of a given class has no span at all
/// (`Option::<UndoSpan>::None`); a span with only one valid end is
/// unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct UndoSpan {
    pub start: UndoRecPtr,
    pub end: UndoRecPtr,
}

impl UndoSpan {
    #[inline]
    pub const fn new(start: UndoRecPtr, end: UndoRecPtr) -> Self {
        Self { start, end }
    }
}

/// Monotonic timestamp in microseconds.
///
/// The origin is whatever the embedding's clock chooses; only ordering and
/// durations matter. The never-retried sentinel of a request's retry time
/// is `Option::<Timestamp>::None`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    #[inline]
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    #[inline]
    #[must_use]
    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// This timestamp advanced by `delta`, saturating at the maximum.
    #[inline]
    #[must_use]
    pub fn saturating_add(self, delta: Duration) -> Self {
        let delta_micros = u64::try_from(delta.as_micros()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(delta_micros))
    }
}

//! The persistent subset of an undo request and its fixed-width codec.
//!
//! A request's durable payload is everything a background worker needs to
//! apply undo actions after a crash: the transaction id, its database, the
//! total undo size, and the logged/unlogged undo log ranges. Retry state is
//! deliberately excluded; failure history is not worth keeping across a
//! restart.

use std::fmt;

use crate::encoding::{append_u32_le, append_u64_le, read_u32_le, read_u64_le};
use crate::{DatabaseId, FullXid, UndoRecPtr, UndoSpan};

/// Which class of undo a span belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UndoClass {
    /// Undo for crash-durable data.
    Logged,
    /// Undo for data durable only within the session.
    Unlogged,
}

impl fmt::Display for UndoClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Logged => f.write_str("logged"),
            Self::Unlogged => f.write_str("unlogged"),
        }
    }
}

/// The durable payload of one undo request.
///
/// A finalized request has `size > 0` and at least one span. Both
/// invariants are enforced at decode time, and the span type makes a
/// half-valid range unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct UndoRequestData {
    pub fxid: FullXid,
    pub dbid: DatabaseId,
    /// Total bytes of durable undo generated by the transaction.
    pub size: u64,
    pub logged: Option<UndoSpan>,
    pub unlogged: Option<UndoSpan>,
}

impl UndoRequestData {
    /// Encoded size of one record: fxid, dbid, size, then the four span
    /// endpoints, packed little-endian with no padding.
    pub const RECORD_BYTES: usize = 8 + 4 + 8 + 8 * 4;

    /// Append this record's wire form to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        append_u64_le(buf, self.fxid.get());
        append_u32_le(buf, self.dbid.get());
        append_u64_le(buf, self.size);
        let (start, end) = span_words(self.logged);
        append_u64_le(buf, start);
        append_u64_le(buf, end);
        let (start, end) = span_words(self.unlogged);
        append_u64_le(buf, start);
        append_u64_le(buf, end);
    }

    /// Decode one record from exactly [`Self::RECORD_BYTES`] bytes.
    pub fn decode(record: &[u8]) -> Result<Self, RecordDecodeError> {
        if record.len() != Self::RECORD_BYTES {
            return Err(RecordDecodeError::WrongLength {
                expected: Self::RECORD_BYTES,
                actual: record.len(),
            });
        }
        let fxid = FullXid::new(read_u64_le(record, 0)).ok_or(RecordDecodeError::InvalidFxid)?;
        let dbid = DatabaseId::new(read_u32_le(record, 8));
        let size = read_u64_le(record, 12);
        if size == 0 {
            return Err(RecordDecodeError::ZeroSize);
        }
        let logged = span_from_words(read_u64_le(record, 20), read_u64_le(record, 28), UndoClass::Logged)?;
        let unlogged =
            span_from_words(read_u64_le(record, 36), read_u64_le(record, 44), UndoClass::Unlogged)?;
        if logged.is_none() && unlogged.is_none() {
            return Err(RecordDecodeError::NoSpans);
        }
        Ok(Self {
            fxid,
            dbid,
            size,
            logged,
            unlogged,
        })
    }
}

fn span_words(span: Option<UndoSpan>) -> (u64, u64) {
    span.map_or((0, 0), |s| (s.start.get(), s.end.get()))
}

fn span_from_words(
    start: u64,
    end: u64,
    class: UndoClass,
) -> Result<Option<UndoSpan>, RecordDecodeError> {
    match (UndoRecPtr::new(start), UndoRecPtr::new(end)) {
        (Some(start), Some(end)) => Ok(Some(UndoSpan::new(start, end))),
        (None, None) => Ok(None),
        _ => Err(RecordDecodeError::HalfValidSpan { class }),
    }
}

/// Error decoding a serialized undo request record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordDecodeError {
    /// The slice handed to the decoder is not exactly one record.
    WrongLength { expected: usize, actual: usize },
    /// The fxid word is the invalid sentinel.
    InvalidFxid,
    /// The size word is zero; only finalized requests are serialized.
    ZeroSize,
    /// One endpoint of a span is valid and the other is not.
    HalfValidSpan { class: UndoClass },
    /// Neither undo class has a span; such a request would describe no work.
    NoSpans,
}

impl fmt::Display for RecordDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongLength { expected, actual } => {
                write!(f, "expected a {expected}-byte record, got {actual} bytes")
            }
            Self::InvalidFxid => f.write_str("record has an invalid (zero) fxid"),
            Self::ZeroSize => f.write_str("record has zero undo size"),
            Self::HalfValidSpan { class } => {
                write!(f, "{class} undo span has exactly one valid endpoint")
            }
            Self::NoSpans => f.write_str("record carries no logged or unlogged undo span"),
        }
    }
}

impl std::error::Error for RecordDecodeError {}

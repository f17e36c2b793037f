//! Little-endian encoding helpers for fixed-width records.
//!
//! The serialized undo request state is a flat array of fixed-width
//! records; these helpers keep the field packing in one place. Callers
//! validate lengths before reading, so the read helpers index directly.

/// Append a `u32` in little-endian byte order.
#[inline]
pub fn append_u32_le(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Append a `u64` in little-endian byte order.
#[inline]
pub fn append_u64_le(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Read a little-endian `u32` at `offset`.
///
/// # Panics
///
/// Panics if `bytes` is shorter than `offset + 4`.
#[inline]
#[must_use]
pub fn read_u32_le(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0_u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

/// Read a little-endian `u64` at `offset`.
///
/// # Panics
///
/// Panics if `bytes` is shorter than `offset + 8`.
#[inline]
#[must_use]
pub fn read_u64_le(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0_u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

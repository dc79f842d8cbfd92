//! Byte ranges.
//!
//! A [`ByteRange`] is a contiguous, half-open range `[offset, offset + length)` of a byte sequence.
//! Byte ranges describe the sub-operations of a split read or write (see [`partition_byte_range`]) and the bytes copied out of a cached object.
//!
//! [`extract_byte_range`] is a convenience function for extracting a byte range from a slice of bytes.

use std::ops::Range;

use thiserror::Error;

/// A byte offset.
pub type ByteOffset = u64;

/// A byte length.
pub type ByteLength = u64;

/// A contiguous byte range.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ByteRange {
    offset: ByteOffset,
    length: ByteLength,
}

impl ByteRange {
    /// Create a new byte range starting at `offset` with `length` bytes.
    #[must_use]
    pub const fn new(offset: ByteOffset, length: ByteLength) -> Self {
        Self { offset, length }
    }

    /// Return the start of the byte range.
    #[must_use]
    pub const fn offset(&self) -> ByteOffset {
        self.offset
    }

    /// Return the length of the byte range.
    #[must_use]
    pub const fn length(&self) -> ByteLength {
        self.length
    }

    /// Return the exclusive end of the byte range.
    #[must_use]
    pub const fn end(&self) -> ByteOffset {
        self.offset + self.length
    }

    /// Returns true if the byte range has zero length.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Return the byte range shifted forward by `offset` bytes.
    #[must_use]
    pub const fn shifted(&self, offset: ByteOffset) -> Self {
        Self::new(self.offset + offset, self.length)
    }

    /// Convert the byte range to a [`Range<u64>`].
    #[must_use]
    pub const fn to_range(&self) -> Range<u64> {
        self.offset..self.end()
    }

    /// Convert the byte range to a [`Range<usize>`].
    ///
    /// # Panics
    ///
    /// Panics if the byte range exceeds [`usize::MAX`].
    #[must_use]
    pub fn to_range_usize(&self) -> Range<usize> {
        self.offset.try_into().unwrap()..self.end().try_into().unwrap()
    }
}

impl std::fmt::Display for ByteRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}..{}", self.offset, self.end())
    }
}

/// An invalid byte range error.
#[derive(Copy, Clone, Debug, Error)]
#[error("invalid byte range {0} for bytes of length {1}")]
pub struct InvalidByteRangeError(ByteRange, u64);

impl InvalidByteRangeError {
    /// Create a new [`InvalidByteRangeError`].
    #[must_use]
    pub fn new(byte_range: ByteRange, bytes_len: u64) -> Self {
        Self(byte_range, bytes_len)
    }

    /// Return the offending byte range.
    #[must_use]
    pub const fn byte_range(&self) -> ByteRange {
        self.0
    }

    /// Return the length of the bytes the range was applied to.
    #[must_use]
    pub const fn bytes_len(&self) -> u64 {
        self.1
    }
}

/// Check that `byte_range` lies within bytes of length `bytes_len`.
///
/// # Errors
/// Returns [`InvalidByteRangeError`] if the range ends beyond `bytes_len` (or its end overflows).
pub fn validate_byte_range(
    byte_range: &ByteRange,
    bytes_len: u64,
) -> Result<(), InvalidByteRangeError> {
    match byte_range.offset.checked_add(byte_range.length) {
        Some(end) if end <= bytes_len => Ok(()),
        _ => Err(InvalidByteRangeError(*byte_range, bytes_len)),
    }
}

/// Extract a byte range from bytes.
///
/// # Errors
/// Returns [`InvalidByteRangeError`] if any bytes are requested beyond the end of `bytes`.
pub fn extract_byte_range<'a>(
    bytes: &'a [u8],
    byte_range: &ByteRange,
) -> Result<&'a [u8], InvalidByteRangeError> {
    validate_byte_range(byte_range, bytes.len() as u64)?;
    Ok(&bytes[byte_range.to_range_usize()])
}

/// Partition `[0, nbytes)` into at most `num_parts` contiguous, non-overlapping byte ranges.
///
/// Every range has length `ceil(nbytes / num_parts)` except the last, which is truncated to fit.
/// Zero-length ranges are never produced, so fewer than `num_parts` ranges are returned when `num_parts` does not evenly divide `nbytes` (e.g. 10 bytes in 4 parts is `0..3, 3..6, 6..9, 9..10`, but 9 bytes in 4 parts is `0..3, 3..6, 6..9`).
/// An empty vector is returned if `nbytes` is zero.
#[must_use]
pub fn partition_byte_range(nbytes: ByteLength, num_parts: usize) -> Vec<ByteRange> {
    if nbytes == 0 {
        return Vec::new();
    }
    let num_parts = (num_parts.max(1) as u64).min(nbytes);
    let part_length = nbytes.div_ceil(num_parts);
    (0..num_parts)
        .map(|i| i * part_length)
        .take_while(|&offset| offset < nbytes)
        .map(|offset| ByteRange::new(offset, part_length.min(nbytes - offset)))
        .collect()
}

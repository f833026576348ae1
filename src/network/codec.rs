//! Fixed-endianness read/write primitives shared by every packet family.
//!
//! All multi-byte fields are big-endian (network byte order). [`PacketWriter`] appends
//! into a growable buffer; [`PacketReader`] reads with bounds checking, so a short or
//! truncated datagram fails with [`CodecError::UnexpectedEnd`] instead of yielding
//! partial state.
//!
//! # Examples
//!
//! ```
//! use fortress_lockstep::network::codec::{PacketReader, PacketWriter};
//!
//! let mut writer = PacketWriter::new();
//! writer.put_u8(0x00).put_u32(7).put_u16(0xAC0E);
//! let bytes = writer.into_bytes();
//! assert_eq!(bytes, [0x00, 0, 0, 0, 7, 0xAC, 0x0E]);
//!
//! let mut reader = PacketReader::new(&bytes);
//! assert_eq!(reader.read_u8().unwrap(), 0x00);
//! assert_eq!(reader.read_u32().unwrap(), 7);
//! assert_eq!(reader.read_u16().unwrap(), 0xAC0E);
//! assert!(reader.read_u8().is_err());
//! ```

use std::fmt;

/// Initial capacity of a fresh writer. Large enough for every lobby and start packet.
const INITIAL_CAPACITY: usize = 64;

/// Errors that can occur while decoding a packet.
///
/// Codec errors are never fatal to a session: the offending datagram is discarded
/// and the error is logged.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// The buffer ended before a field could be read.
    UnexpectedEnd {
        /// Bytes the read needed.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },
    /// The first byte does not name a known packet family.
    UnknownMessageType {
        /// The offending type byte.
        tag: u8,
    },
    /// A field held a value outside its domain.
    InvalidField {
        /// Which field.
        field: &'static str,
        /// The value that was read.
        value: u32,
    },
    /// Bytes were left over after a fixed-size packet was fully read.
    TrailingBytes {
        /// Number of unread bytes.
        count: usize,
    },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEnd { needed, remaining } => {
                write!(
                    f,
                    "packet too short: needed {needed} bytes, but only {remaining} remain"
                )
            },
            Self::UnknownMessageType { tag } => {
                write!(f, "unknown message type 0x{tag:02X}")
            },
            Self::InvalidField { field, value } => {
                write!(f, "invalid value {value} for field `{field}`")
            },
            Self::TrailingBytes { count } => {
                write!(f, "{count} unexpected trailing bytes")
            },
        }
    }
}

impl std::error::Error for CodecError {}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Appends big-endian fields to a growable buffer.
///
/// Capacity doubles whenever a write would overflow it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketWriter {
    buf: Vec<u8>,
}

impl PacketWriter {
    /// Creates an empty writer with a small initial capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    /// Creates an empty writer with the given initial capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    fn grow_for(&mut self, additional: usize) {
        let needed = self.buf.len() + additional;
        if needed > self.buf.capacity() {
            let doubled = (self.buf.capacity() * 2).max(INITIAL_CAPACITY);
            self.buf.reserve_exact(doubled.max(needed) - self.buf.len());
        }
    }

    /// Appends one byte.
    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.grow_for(1);
        self.buf.push(value);
        self
    }

    /// Appends a big-endian `u16`.
    pub fn put_u16(&mut self, value: u16) -> &mut Self {
        self.put_bytes(&value.to_be_bytes())
    }

    /// Appends a big-endian `u32`.
    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.put_bytes(&value.to_be_bytes())
    }

    /// Appends a raw block.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.grow_for(bytes.len());
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Appends `bytes` truncated or NUL padded to exactly `width` bytes.
    pub fn put_fixed(&mut self, bytes: &[u8], width: usize) -> &mut Self {
        let take = bytes.len().min(width);
        self.grow_for(width);
        self.buf.extend_from_slice(bytes.get(..take).unwrap_or_default());
        self.buf.resize(self.buf.len() + (width - take), 0);
        self
    }

    /// Overwrites a big-endian `u32` at `offset`. Does nothing if it would write past the end.
    pub fn set_u32_at(&mut self, offset: usize, value: u32) -> &mut Self {
        if let Some(slot) = self.buf.get_mut(offset..offset + 4) {
            slot.copy_from_slice(&value.to_be_bytes());
        }
        self
    }

    /// Shortens the buffer to `len` bytes, keeping its capacity.
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    /// Number of bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns `true` if nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Current capacity of the backing buffer.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// The bytes written so far.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the writer, returning its buffer.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads big-endian fields from a byte slice with bounds checking.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    /// Starts reading at the beginning of `buf`.
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Reads exactly `len` bytes.
    ///
    /// # Errors
    /// Returns [`CodecError::UnexpectedEnd`] if fewer than `len` bytes remain.
    pub fn read_bytes(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        let slice = self
            .buf
            .get(self.pos..self.pos + len)
            .ok_or(CodecError::UnexpectedEnd {
                needed: len,
                remaining: self.remaining(),
            })?;
        self.pos += len;
        Ok(slice)
    }

    /// Reads a fixed-size array.
    ///
    /// # Errors
    /// Returns [`CodecError::UnexpectedEnd`] if fewer than `N` bytes remain.
    pub fn read_array<const N: usize>(&mut self) -> CodecResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    /// Reads one byte.
    ///
    /// # Errors
    /// Returns [`CodecError::UnexpectedEnd`] on an exhausted buffer.
    pub fn read_u8(&mut self) -> CodecResult<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    /// Reads a big-endian `u16`.
    ///
    /// # Errors
    /// Returns [`CodecError::UnexpectedEnd`] if fewer than 2 bytes remain.
    pub fn read_u16(&mut self) -> CodecResult<u16> {
        self.read_array().map(u16::from_be_bytes)
    }

    /// Reads a big-endian `u32`.
    ///
    /// # Errors
    /// Returns [`CodecError::UnexpectedEnd`] if fewer than 4 bytes remain.
    pub fn read_u32(&mut self) -> CodecResult<u32> {
        self.read_array().map(u32::from_be_bytes)
    }

    /// Returns everything not yet consumed and moves to the end.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = self.buf.get(self.pos..).unwrap_or_default();
        self.pos = self.buf.len();
        rest
    }

    /// Fails if any bytes are left.
    ///
    /// # Errors
    /// Returns [`CodecError::TrailingBytes`] when the buffer is not exhausted.
    pub fn finish(&self) -> CodecResult<()> {
        match self.remaining() {
            0 => Ok(()),
            count => Err(CodecError::TrailingBytes { count }),
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_are_big_endian() {
        let mut writer = PacketWriter::new();
        writer.put_u16(0x0102).put_u32(0x0304_0506);
        assert_eq!(writer.as_bytes(), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_capacity_doubles_on_overflow() {
        let mut writer = PacketWriter::with_capacity(4);
        writer.put_u32(1);
        let before = writer.capacity();
        writer.put_u8(2);
        assert!(writer.capacity() >= before * 2);
        assert_eq!(writer.len(), 5);
    }

    #[test]
    fn test_put_fixed_pads_and_truncates() {
        let mut writer = PacketWriter::new();
        writer.put_fixed(b"ab", 4).put_fixed(b"abcdef", 3);
        assert_eq!(writer.as_bytes(), b"ab\0\0abc");
    }

    #[test]
    fn test_set_u32_at_patches_in_place() {
        let mut writer = PacketWriter::new();
        writer.put_u8(9).put_u32(0).put_u8(7);
        writer.set_u32_at(1, 0xDEAD_BEEF);
        assert_eq!(writer.as_bytes(), &[9, 0xDE, 0xAD, 0xBE, 0xEF, 7]);
        // Out of range is ignored
        writer.set_u32_at(4, 1);
        assert_eq!(writer.len(), 6);
    }

    #[test]
    fn test_short_read_reports_sizes() {
        let mut reader = PacketReader::new(&[1, 2, 3]);
        assert_eq!(reader.read_u16().unwrap(), 0x0102);
        assert_eq!(
            reader.read_u32(),
            Err(CodecError::UnexpectedEnd {
                needed: 4,
                remaining: 1
            })
        );
        // A failed read consumes nothing
        assert_eq!(reader.read_u8().unwrap(), 3);
        assert!(reader.finish().is_ok());
    }

    #[test]
    fn test_finish_flags_trailing_bytes() {
        let mut reader = PacketReader::new(&[0, 0, 0]);
        reader.read_u8().unwrap();
        assert_eq!(reader.finish(), Err(CodecError::TrailingBytes { count: 2 }));
        assert_eq!(reader.read_rest(), &[0, 0]);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_codec_error_display() {
        let err = CodecError::UnknownMessageType { tag: 0x7E };
        assert_eq!(err.to_string(), "unknown message type 0x7E");
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod property_tests {
    use super::*;
    use crate::test_config::{proptest_config, CaseWeight};
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(proptest_config(CaseWeight::Field))]

        /// Property: any prefix shorter than the written fields fails cleanly.
        #[test]
        fn prop_truncated_buffers_never_panic(a in any::<u32>(), b in any::<u16>(), cut in 0usize..6) {
            let mut writer = PacketWriter::new();
            writer.put_u32(a).put_u16(b);
            let bytes = writer.into_bytes();
            let mut reader = PacketReader::new(&bytes[..cut]);
            let result = reader.read_u32().and_then(|_| reader.read_u16());
            prop_assert!(result.is_err());
        }

        /// Property: arbitrary bytes never make the reader panic.
        #[test]
        fn prop_arbitrary_bytes_are_bounds_checked(bytes in proptest::collection::vec(any::<u8>(), 0..32)) {
            let mut reader = PacketReader::new(&bytes);
            while reader.read_u32().is_ok() {}
            prop_assert!(reader.remaining() < 4);
        }
    }
}

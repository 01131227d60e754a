//! Binary codec for command-frame packets.
//!
//! Every wire structure in this crate goes through the functions here, so the
//! bincode configuration lives in exactly one place. On top of the plain
//! `encode`/`decode` helpers the module provides [`PacketWriter`] and
//! [`PacketReader`], a cursor pair used to build the packed payloads of
//! input and delta packets, and [`PacketWriter::write_size_scoped`], which
//! frames a sub-block with an `i32` byte length so a reader can skip it
//! without understanding its contents.
//!
//! # Layout
//!
//! - Integers are fixed width and little endian.
//! - A size-scoped block is `[len: i32][len bytes]`. The length is written as
//!   a placeholder first and patched once the block body is complete.
//!
//! # Examples
//!
//! ```
//! use command_frame_net::network::codec::{PacketReader, PacketWriter};
//!
//! let mut writer = PacketWriter::new();
//! writer.write(&7u32).expect("encoding should succeed");
//! let size = writer
//!     .write_size_scoped(|block| block.write(&1.5f32))
//!     .expect("encoding should succeed");
//! assert_eq!(size, 4);
//!
//! let bytes = writer.into_bytes();
//! let mut reader = PacketReader::new(&bytes);
//! let frame: u32 = reader.read().expect("decoding should succeed");
//! assert_eq!(frame, 7);
//! let block = reader.read_size_scope().expect("decoding should succeed");
//! reader.skip(block).expect("block is in bounds");
//! assert!(reader.is_exhausted());
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

// Fixed-size integers keep packet layouts deterministic and make the
// size-scope placeholder patchable in place.
fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// Width in bytes of a size-scope header.
pub const SIZE_SCOPE_HEADER_BYTES: usize = std::mem::size_of::<i32>();

/// Represents what operation was being performed when a codec error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CodecOperation {
    /// Encoding a wire packet.
    EncodePacket,
    /// Decoding a wire packet.
    DecodePacket,
    /// Appending to a packet payload.
    AppendToBuffer,
    /// Reading a field out of a packet payload.
    ReadField,
    /// Patching or reading a size-scope header.
    SizeScope,
    /// Skipping a block the reader does not want.
    Skip,
    /// A generic encoding operation.
    Encode,
    /// A generic decoding operation.
    Decode,
}

impl fmt::Display for CodecOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodePacket => write!(f, "encoding wire packet"),
            Self::DecodePacket => write!(f, "decoding wire packet"),
            Self::AppendToBuffer => write!(f, "appending to buffer"),
            Self::ReadField => write!(f, "reading payload field"),
            Self::SizeScope => write!(f, "framing size scope"),
            Self::Skip => write!(f, "skipping block"),
            Self::Encode => write!(f, "encoding"),
            Self::Decode => write!(f, "decoding"),
        }
    }
}

/// Errors that can occur during encoding or decoding.
///
/// Bincode errors are opaque, so their messages are kept as strings.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// The encoding operation failed.
    EncodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// The decoding operation failed.
    DecodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// The payload ended before a declared block did.
    BufferTooSmall {
        /// The number of bytes the block needs.
        required: usize,
        /// The number of bytes left in the payload.
        provided: usize,
    },
}

impl CodecError {
    /// Creates a new encode error with the given message and operation.
    pub fn encode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::EncodeError {
            message: message.into(),
            operation,
        }
    }

    /// Creates a new decode error with the given message and operation.
    pub fn decode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::DecodeError {
            message: message.into(),
            operation,
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeError { message, operation } => {
                write!(f, "encoding failed while {operation}: {message}")
            },
            Self::DecodeError { message, operation } => {
                write!(f, "decoding failed while {operation}: {message}")
            },
            Self::BufferTooSmall { required, provided } => {
                write!(
                    f,
                    "buffer too small: needed {required} bytes, but only {provided} provided"
                )
            },
        }
    }
}

impl std::error::Error for CodecError {}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes a value into a new `Vec<u8>`.
pub fn encode<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, config())
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::Encode))
}

/// Encodes a value by appending to an existing `Vec<u8>`, returning the bytes written.
pub fn encode_append<T: Serialize>(value: &T, buffer: &mut Vec<u8>) -> CodecResult<usize> {
    let start_len = buffer.len();
    bincode::serde::encode_into_std_write(value, buffer, config())
        .map(|_| buffer.len() - start_len)
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::AppendToBuffer))
}

/// Decodes a value from a byte slice, returning it with the number of bytes consumed.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<(T, usize)> {
    bincode::serde::decode_from_slice(bytes, config())
        .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::Decode))
}

/// Decodes a value from a byte slice, ignoring the bytes consumed.
pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    decode(bytes).map(|(value, _)| value)
}

/// Append-only payload builder.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PacketWriter {
    bytes: Vec<u8>,
}

impl PacketWriter {
    /// Creates an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one encoded value.
    pub fn write<T: Serialize>(&mut self, value: &T) -> CodecResult<usize> {
        encode_append(value, &mut self.bytes)
    }

    /// Appends bytes that are already encoded.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Writes an `i32` placeholder, runs `body`, then patches the placeholder
    /// with the number of bytes `body` appended. Returns that size.
    ///
    /// If `body` fails the partially written block is discarded.
    pub fn write_size_scoped<F>(&mut self, body: F) -> CodecResult<usize>
    where
        F: FnOnce(&mut Self) -> CodecResult<usize>,
    {
        let head = self.bytes.len();
        self.bytes.extend_from_slice(&0i32.to_le_bytes());
        if let Err(err) = body(self) {
            self.bytes.truncate(head);
            return Err(err);
        }
        let size = self.bytes.len() - head - SIZE_SCOPE_HEADER_BYTES;
        let header = i32::try_from(size).map_err(|_| {
            CodecError::encode(
                format!("size scope of {size} bytes does not fit in i32"),
                CodecOperation::SizeScope,
            )
        })?;
        self.bytes[head..head + SIZE_SCOPE_HEADER_BYTES].copy_from_slice(&header.to_le_bytes());
        Ok(size)
    }

    /// Number of bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` if nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The bytes written so far.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consumes the writer and returns the payload.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Forward-only cursor over a packed payload.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> PacketReader<'a> {
    /// Creates a reader positioned at the start of `bytes`.
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    /// Decodes the next value and advances past it.
    pub fn read<T: DeserializeOwned>(&mut self) -> CodecResult<T> {
        let (value, used) = bincode::serde::decode_from_slice(self.remaining_bytes(), config())
            .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::ReadField))?;
        self.position += used;
        Ok(value)
    }

    /// Reads a size-scope header and returns the declared block length.
    pub fn read_size_scope(&mut self) -> CodecResult<usize> {
        let declared: i32 = self.read()?;
        let size = usize::try_from(declared).map_err(|_| {
            CodecError::decode(
                format!("negative size scope {declared}"),
                CodecOperation::SizeScope,
            )
        })?;
        if size > self.remaining() {
            return Err(CodecError::BufferTooSmall {
                required: size,
                provided: self.remaining(),
            });
        }
        Ok(size)
    }

    /// Splits the next `len` bytes off as an independent reader.
    pub fn sub_reader(&mut self, len: usize) -> CodecResult<PacketReader<'a>> {
        let start = self.position;
        self.skip(len)?;
        Ok(PacketReader::new(&self.bytes[start..start + len]))
    }

    /// Advances the cursor by `len` bytes without decoding them.
    pub fn skip(&mut self, len: usize) -> CodecResult<()> {
        if len > self.remaining() {
            return Err(CodecError::BufferTooSmall {
                required: len,
                provided: self.remaining(),
            });
        }
        self.position += len;
        Ok(())
    }

    /// Bytes consumed so far.
    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Bytes left to read.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.position
    }

    /// Returns `true` once every byte has been consumed.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    fn remaining_bytes(&self) -> &'a [u8] {
        &self.bytes[self.position..]
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
    fn test_fixed_int_layout_is_little_endian() {
        let bytes = encode(&0x0102_0304u32).unwrap();
        assert_eq!(bytes, vec![0x04, 0x03, 0x02, 0x01]);
        let (decoded, used): (u32, _) = decode(&bytes).unwrap();
        assert_eq!(decoded, 0x0102_0304);
        assert_eq!(used, 4);
    }

    #[test]
    fn test_size_scope_patches_header() {
        let mut writer = PacketWriter::new();
        writer.write(&9u32).unwrap();
        let size = writer
            .write_size_scoped(|block| {
                block.write(&1u32)?;
                block.write(&true)
            })
            .unwrap();
        assert_eq!(size, 5);

        let bytes = writer.into_bytes();
        assert_eq!(&bytes[4..8], &5i32.to_le_bytes());
        assert_eq!(bytes.len(), 4 + 4 + 5);
    }

    #[test]
    fn test_failed_size_scope_is_rolled_back() {
        let mut writer = PacketWriter::new();
        writer.write(&1u8).unwrap();
        let result = writer.write_size_scoped(|block| {
            block.write(&2u32)?;
            Err(CodecError::encode("refused", CodecOperation::Encode))
        });
        assert!(result.is_err());
        assert_eq!(writer.len(), 1);
    }

    #[test]
    fn test_reader_skips_unwanted_block() {
        let mut writer = PacketWriter::new();
        writer
            .write_size_scoped(|block| block.write(&[1u32, 2, 3]))
            .unwrap();
        writer.write(&77u16).unwrap();
        let bytes = writer.into_bytes();

        let mut reader = PacketReader::new(&bytes);
        let size = reader.read_size_scope().unwrap();
        reader.skip(size).unwrap();
        let tail: u16 = reader.read().unwrap();
        assert_eq!(tail, 77);
        assert!(reader.is_exhausted());
    }

    #[test]
    fn test_reader_rejects_truncated_scope() {
        let mut writer = PacketWriter::new();
        writer.write(&64i32).unwrap();
        writer.write(&1u8).unwrap();
        let bytes = writer.into_bytes();

        let mut reader = PacketReader::new(&bytes);
        let err = reader.read_size_scope().unwrap_err();
        assert_eq!(
            err,
            CodecError::BufferTooSmall {
                required: 64,
                provided: 1
            }
        );
    }

    #[test]
    fn test_sub_reader_is_bounded() {
        let mut writer = PacketWriter::new();
        writer.write(&1u32).unwrap();
        writer.write(&2u32).unwrap();
        let bytes = writer.into_bytes();

        let mut reader = PacketReader::new(&bytes);
        let mut first = reader.sub_reader(4).unwrap();
        let value: u32 = first.read().unwrap();
        assert_eq!(value, 1);
        assert!(first.is_exhausted());
        assert!(first.read::<u32>().is_err());
        assert_eq!(reader.remaining(), 4);
    }

    #[test]
    fn test_decode_invalid_data() {
        let invalid_bytes = [0xFF, 0xFF, 0xFF];
        let result: CodecResult<(u64, _)> = decode(&invalid_bytes);
        assert!(result.is_err());
    }

    #[test]
    fn test_codec_error_display() {
        let err = CodecError::decode("unexpected end", CodecOperation::ReadField);
        assert!(err.to_string().contains("reading payload field"));

        let err = CodecError::BufferTooSmall {
            required: 100,
            provided: 10,
        };
        let msg = err.to_string();
        assert!(msg.contains("100"));
        assert!(msg.contains("10"));
    }
}

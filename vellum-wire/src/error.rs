//! Wire protocol error types.

use thiserror::Error;
use vellum_bson::{DecodeError, EncodeError};

/// Errors that can occur while framing or parsing messages.
///
/// Malformed-input variants carry the offset of the offending bytes,
/// absolute within the frame being parsed (header byte 0 is offset 0).
/// They indicate corruption of the single message at hand; the framing
/// layer stays aligned because the frame was length-split before parsing.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("message of {size} bytes exceeds maximum {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("declared message length {len} is below the header size")]
    MessageTooShort { len: i32 },

    #[error("unknown opcode {0}")]
    UnknownOpCode(i32),

    #[error("unsupported required flag bits {bits:#010x}")]
    UnsupportedFlags { bits: u32 },

    #[error("unknown section kind {kind:#04x} at offset {offset}")]
    UnknownSectionKind { kind: u8, offset: usize },

    #[error("invalid section length {len} at offset {offset}")]
    InvalidSectionLength { len: i32, offset: usize },

    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("payload truncated at offset {offset}: need {needed} more bytes")]
    TruncatedPayload { offset: usize, needed: usize },

    #[error("cstring field {field} contains an interior NUL byte")]
    CstringContainsNul { field: &'static str },

    #[error("reply declared {declared} documents but payload held {actual}")]
    DocumentCountMismatch { declared: i32, actual: usize },

    #[error("trailing {count} bytes after message payload")]
    TrailingBytes { count: usize },

    #[error("unknown compressor id {0}")]
    UnknownCompressor(u8),

    #[error("invalid uncompressed size {0}")]
    InvalidUncompressedSize(i32),

    #[error("decompressed to {actual} bytes, declared {declared}")]
    DecompressedSizeMismatch { declared: usize, actual: usize },

    #[error("compressed message wraps another compressed message")]
    NestedCompression,

    #[error("{algorithm} codec error: {source}")]
    Compression {
        algorithm: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("document decode error: {0}")]
    Document(#[from] DecodeError),

    #[error("document encode error: {0}")]
    Encode(#[from] EncodeError),
}

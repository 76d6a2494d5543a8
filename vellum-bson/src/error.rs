//! Codec error types.

use thiserror::Error;

/// Errors produced while encoding a document.
///
/// Encoding is infallible for every well-formed value; these variants cover
/// the few inputs the wire format cannot represent.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("key {0:?} contains an interior NUL byte")]
    KeyContainsNul(String),

    #[error("regular expression {field} contains an interior NUL byte")]
    RegexContainsNul { field: &'static str },

    #[error("document size {size} exceeds maximum {max}")]
    DocumentTooLarge { size: usize, max: usize },
}

/// Errors produced while decoding a document.
///
/// Every variant carries the absolute byte offset at which the problem was
/// detected, counted from the start of the buffer handed to the decoder.
/// A document's declared end acts as the end of input for its elements, so
/// an element that would cross it reports [`DecodeError::UnexpectedEof`]
/// even when the buffer holds further bytes.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unexpected end of input at offset {offset}: need {needed} more bytes")]
    UnexpectedEof { offset: usize, needed: usize },

    #[error("unknown element tag {tag:#04x} at offset {offset}")]
    UnknownTag { tag: u8, offset: usize },

    #[error("deprecated element tag {tag:#04x} at offset {offset}")]
    DeprecatedTag { tag: u8, offset: usize },

    #[error("invalid length {len} at offset {offset}")]
    InvalidLength { len: i32, offset: usize },

    #[error("declared length {declared} does not match {actual} bytes consumed (offset {offset})")]
    LengthMismatch {
        declared: usize,
        actual: usize,
        offset: usize,
    },

    #[error("document of {len} bytes exceeds maximum {max} (offset {offset})")]
    DocumentTooLarge {
        len: usize,
        max: usize,
        offset: usize,
    },

    #[error("unterminated cstring starting at offset {offset}")]
    UnterminatedCstring { offset: usize },

    #[error("string at offset {offset} is not valid UTF-8")]
    InvalidUtf8 { offset: usize },

    #[error("string at offset {offset} is missing its NUL terminator")]
    MissingStringTerminator { offset: usize },

    #[error("invalid boolean byte {value:#04x} at offset {offset}")]
    InvalidBoolean { value: u8, offset: usize },

    #[error("document nesting exceeds depth limit {limit}")]
    DepthLimitExceeded { limit: usize },

    #[error("trailing bytes after document: consumed {consumed} of {len}")]
    TrailingBytes { consumed: usize, len: usize },

    #[error("binary value of {len} bytes cannot hold a UUID")]
    UuidLength { len: usize },

    #[error("UUID subtype mismatch: representation expects {expected:#04x}, found {actual:#04x}")]
    UuidSubtypeMismatch { expected: u8, actual: u8 },
}

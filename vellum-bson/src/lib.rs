//! # vellum-bson
//!
//! Binary document model and codec for vellum.
//!
//! This crate provides:
//! - The ordered [`Document`] map and the closed [`Value`] union
//! - The length-prefixed binary encoding and its bounds-checked decoder
//! - 12-byte [`ObjectId`] identifiers and their process-wide generator
//! - UUID byte-order handling for binary subtypes 0x03/0x04
//! - A relaxed JSON projection for diagnostics
//!
//! Encode and decode are pure functions over in-memory buffers: no I/O,
//! no shared state, safe to call concurrently.

pub mod document;
pub mod error;
pub mod oid;
pub mod uuid_repr;
pub mod value;

mod decode;
mod encode;
mod json;
mod macros;

pub use document::Document;
pub use error::{DecodeError, EncodeError};
pub use oid::{MachineIdSource, ObjectId, ObjectIdError, ObjectIdGenerator};
pub use uuid_repr::{decode_uuid, encode_uuid, UuidRepresentation};
pub use value::{
    Binary, BinarySubtype, DateTime, ElementType, JavaScriptCodeWithScope, Regex, RegexFlags,
    Timestamp, Value,
};

/// Maximum encoded size of a single document (16 MiB).
pub const MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;

/// Smallest possible encoded document: length prefix plus terminator.
pub const MIN_DOCUMENT_SIZE: usize = 5;

/// Maximum nesting depth the decoder will follow before rejecting input.
pub const MAX_DECODE_DEPTH: usize = 100;

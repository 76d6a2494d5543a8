//! Wire message layer.
//!
//! Everything that travels a connection is a length-delimited message: a
//! fixed 16-byte header followed by an opcode-specific payload. This crate
//! provides:
//!
//! - The message header and opcode registry ([`header`])
//! - Multi-section command messages with optional CRC32C ([`msg`])
//! - Legacy single-operation messages ([`legacy`])
//! - The compression envelope and its codecs ([`compress`])
//! - Streaming frame extraction and full encode/decode ([`message`])
//!
//! Parsing is strict: declared lengths must match reality, unknown
//! required flag bits and opcodes are fatal, and a checksummed message is
//! verified before its sections are touched. Frame extraction is separate
//! from interpretation so a reader loop stays aligned on the stream even
//! when a single message is garbage.

pub mod compress;
pub mod error;
pub mod header;
pub mod legacy;
pub mod message;
pub mod msg;

pub use compress::Compressor;
pub use error::WireError;
pub use header::{MessageHeader, OpCode};
pub use legacy::{Delete, GetMore, Insert, KillCursors, Query, Reply, ReplyFlags, Update};
pub use message::{Message, MessageBody, RawMessage};
pub use msg::{DocumentSequence, MsgFlags, OpMsg, Section};

/// Size of the fixed message header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Largest message accepted or produced, header included.
pub const MAX_MESSAGE_SIZE: usize = 48 * 1024 * 1024;

/// Port a server listens on when none is configured.
pub const DEFAULT_PORT: u16 = 7501;

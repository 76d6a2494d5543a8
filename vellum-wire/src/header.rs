//! Message header and opcodes.
//!
//! Every message starts with the same 16-byte header, all fields
//! little-endian:
//!
//! ```text
//! +----------------+------------+-------------+---------+
//! | message_length | request_id | response_to | op_code |
//! |    4 bytes     |  4 bytes   |   4 bytes   | 4 bytes |
//! +----------------+------------+-------------+---------+
//! ```
//!
//! `message_length` counts the whole message including the header itself.

use crate::error::WireError;
use crate::{HEADER_SIZE, MAX_MESSAGE_SIZE};
use bytes::{BufMut, BytesMut};

/// Operation selector in the message header. Values are wire-stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum OpCode {
    /// Legacy reply to a query or get-more.
    Reply = 1,
    Update = 2001,
    Insert = 2002,
    Query = 2004,
    GetMore = 2005,
    Delete = 2006,
    KillCursors = 2007,
    /// Compression wrapper around another message.
    Compressed = 2012,
    /// Modern multi-section message.
    Msg = 2013,
}

impl TryFrom<i32> for OpCode {
    type Error = WireError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(OpCode::Reply),
            2001 => Ok(OpCode::Update),
            2002 => Ok(OpCode::Insert),
            2004 => Ok(OpCode::Query),
            2005 => Ok(OpCode::GetMore),
            2006 => Ok(OpCode::Delete),
            2007 => Ok(OpCode::KillCursors),
            2012 => Ok(OpCode::Compressed),
            2013 => Ok(OpCode::Msg),
            other => Err(WireError::UnknownOpCode(other)),
        }
    }
}

/// The fixed 16-byte header.
///
/// `op_code` is kept raw here so a frame can be split off the stream and
/// correlated by `response_to` even when its opcode turns out to be
/// unknown; [`OpCode::try_from`] happens when the body is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MessageHeader {
    pub fn new(message_length: i32, request_id: i32, response_to: i32, op_code: OpCode) -> Self {
        MessageHeader {
            message_length,
            request_id,
            response_to,
            op_code: op_code as i32,
        }
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.message_length);
        buf.put_i32_le(self.request_id);
        buf.put_i32_le(self.response_to);
        buf.put_i32_le(self.op_code);
    }

    /// Parses the header at the front of `buf` and validates the declared
    /// length against the size bounds. The opcode is not validated here.
    pub fn parse(buf: &[u8]) -> Result<MessageHeader, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::TruncatedPayload {
                offset: buf.len(),
                needed: HEADER_SIZE - buf.len(),
            });
        }
        let read_i32 =
            |at: usize| i32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let header = MessageHeader {
            message_length: read_i32(0),
            request_id: read_i32(4),
            response_to: read_i32(8),
            op_code: read_i32(12),
        };
        if header.message_length < HEADER_SIZE as i32 {
            return Err(WireError::MessageTooShort {
                len: header.message_length,
            });
        }
        if header.message_length as usize > MAX_MESSAGE_SIZE {
            return Err(WireError::MessageTooLarge {
                size: header.message_length as usize,
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(header)
    }
}

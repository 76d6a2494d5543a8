//! Message framing.
//!
//! [`Message`] pairs the header's identity fields with a typed body.
//! `encode` produces a complete frame; inbound parsing is split in two so
//! a reader loop can stay aligned on a corrupt stream:
//!
//! - [`Message::split_frame`] consumes exactly one length-delimited frame
//!   from the buffer (or reports that more bytes are needed). The stream
//!   position advances even when the frame later turns out to be garbage.
//! - [`RawMessage::parse`] interprets the frame. A failure here poisons
//!   only the one request the frame answers, not the connection.
//!
//! [`Message::decode`] chains the two for callers that do not need the
//! intermediate handle.

use crate::compress::Compressor;
use crate::error::WireError;
use crate::header::{MessageHeader, OpCode};
use crate::legacy::{Delete, GetMore, Insert, KillCursors, Query, Reply, Update};
use crate::msg::OpMsg;
use crate::{HEADER_SIZE, MAX_MESSAGE_SIZE};
use bytes::{BufMut, Bytes, BytesMut};

/// Typed message payload. The opcode on the wire follows from the
/// variant, so a message cannot be framed under the wrong opcode.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Msg(OpMsg),
    Reply(Reply),
    Query(Query),
    GetMore(GetMore),
    KillCursors(KillCursors),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
}

impl MessageBody {
    pub fn op_code(&self) -> OpCode {
        match self {
            MessageBody::Msg(_) => OpCode::Msg,
            MessageBody::Reply(_) => OpCode::Reply,
            MessageBody::Query(_) => OpCode::Query,
            MessageBody::GetMore(_) => OpCode::GetMore,
            MessageBody::KillCursors(_) => OpCode::KillCursors,
            MessageBody::Insert(_) => OpCode::Insert,
            MessageBody::Update(_) => OpCode::Update,
            MessageBody::Delete(_) => OpCode::Delete,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            MessageBody::Msg(m) => m.encoded_len(),
            MessageBody::Reply(r) => r.encoded_len(),
            MessageBody::Query(q) => q.encoded_len(),
            MessageBody::GetMore(g) => g.encoded_len(),
            MessageBody::KillCursors(k) => k.encoded_len(),
            MessageBody::Insert(i) => i.encoded_len(),
            MessageBody::Update(u) => u.encoded_len(),
            MessageBody::Delete(d) => d.encoded_len(),
        }
    }

    /// Appends the payload to `buf`, which already holds the header; a
    /// multi-section body with the checksum flag computes its CRC over
    /// those header bytes too.
    fn write_to(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        match self {
            MessageBody::Msg(m) => {
                m.write_to(buf)?;
                if m.flags.has_checksum() {
                    let crc = crc32c::crc32c(buf);
                    buf.put_u32_le(crc);
                }
            }
            MessageBody::Reply(r) => r.write_to(buf)?,
            MessageBody::Query(q) => q.write_to(buf)?,
            MessageBody::GetMore(g) => g.write_to(buf)?,
            MessageBody::KillCursors(k) => k.write_to(buf),
            MessageBody::Insert(i) => i.write_to(buf)?,
            MessageBody::Update(u) => u.write_to(buf)?,
            MessageBody::Delete(d) => d.write_to(buf)?,
        }
        Ok(())
    }
}

/// A complete wire message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub request_id: i32,
    pub response_to: i32,
    pub body: MessageBody,
}

impl Message {
    pub fn new(request_id: i32, response_to: i32, body: MessageBody) -> Self {
        Message {
            request_id,
            response_to,
            body,
        }
    }

    /// An outbound multi-section request.
    pub fn msg(request_id: i32, msg: OpMsg) -> Self {
        Message::new(request_id, 0, MessageBody::Msg(msg))
    }

    /// Encodes into a complete frame, header included.
    pub fn encode(&self) -> Result<BytesMut, WireError> {
        let total = HEADER_SIZE + self.body.encoded_len();
        if total > MAX_MESSAGE_SIZE {
            return Err(WireError::MessageTooLarge {
                size: total,
                max: MAX_MESSAGE_SIZE,
            });
        }
        let mut buf = BytesMut::with_capacity(total);
        MessageHeader::new(
            total as i32,
            self.request_id,
            self.response_to,
            self.body.op_code(),
        )
        .write_to(&mut buf);
        self.body.write_to(&mut buf)?;
        Ok(buf)
    }

    /// Encodes wrapped in a compression envelope (opcode 2012). The
    /// wrapper repeats the identity fields; the original opcode and the
    /// body's uncompressed size travel in the wrapper payload.
    pub fn encode_compressed(&self, compressor: Compressor) -> Result<BytesMut, WireError> {
        let inner = self.encode()?;
        let inner_body = &inner[HEADER_SIZE..];
        let compressed = compressor.compress(inner_body)?;

        let total = HEADER_SIZE + 4 + 4 + 1 + compressed.len();
        if total > MAX_MESSAGE_SIZE {
            return Err(WireError::MessageTooLarge {
                size: total,
                max: MAX_MESSAGE_SIZE,
            });
        }
        let mut buf = BytesMut::with_capacity(total);
        MessageHeader::new(
            total as i32,
            self.request_id,
            self.response_to,
            OpCode::Compressed,
        )
        .write_to(&mut buf);
        buf.put_i32_le(self.body.op_code() as i32);
        buf.put_i32_le(inner_body.len() as i32);
        buf.put_u8(compressor.id());
        buf.put_slice(&compressed);
        Ok(buf)
    }

    /// Splits one frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` until a full frame is buffered. A declared
    /// length outside the size bounds is fatal for the connection; the
    /// stream cannot be realigned past it.
    pub fn split_frame(buf: &mut BytesMut) -> Result<Option<RawMessage>, WireError> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let len = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if len < HEADER_SIZE as i32 {
            return Err(WireError::MessageTooShort { len });
        }
        let len = len as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(WireError::MessageTooLarge {
                size: len,
                max: MAX_MESSAGE_SIZE,
            });
        }
        if buf.len() < len {
            return Ok(None);
        }
        let frame = buf.split_to(len).freeze();
        let header = MessageHeader::parse(&frame)?;
        Ok(Some(RawMessage { header, frame }))
    }

    /// Streaming decode: [`Message::split_frame`] plus [`RawMessage::parse`].
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Message>, WireError> {
        match Message::split_frame(buf)? {
            Some(raw) => Ok(Some(raw.parse()?)),
            None => Ok(None),
        }
    }
}

/// One length-delimited frame, split off the stream but not yet
/// interpreted. The header's identity fields are available even when the
/// body will not parse, so a reader can still fail the right waiter.
#[derive(Debug, Clone)]
pub struct RawMessage {
    header: MessageHeader,
    frame: Bytes,
}

impl RawMessage {
    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn request_id(&self) -> i32 {
        self.header.request_id
    }

    pub fn response_to(&self) -> i32 {
        self.header.response_to
    }

    /// Interprets the frame, unwrapping at most one compression envelope.
    pub fn parse(&self) -> Result<Message, WireError> {
        parse_frame(&self.frame, true)
    }
}

fn parse_frame(frame: &[u8], allow_compressed: bool) -> Result<Message, WireError> {
    let header = MessageHeader::parse(frame)?;
    let op = OpCode::try_from(header.op_code)?;
    let body = match op {
        OpCode::Msg => MessageBody::Msg(OpMsg::parse(frame, HEADER_SIZE)?),
        OpCode::Reply => MessageBody::Reply(Reply::parse(frame, HEADER_SIZE)?),
        OpCode::Query => MessageBody::Query(Query::parse(frame, HEADER_SIZE)?),
        OpCode::GetMore => MessageBody::GetMore(GetMore::parse(frame, HEADER_SIZE)?),
        OpCode::KillCursors => MessageBody::KillCursors(KillCursors::parse(frame, HEADER_SIZE)?),
        OpCode::Insert => MessageBody::Insert(Insert::parse(frame, HEADER_SIZE)?),
        OpCode::Update => MessageBody::Update(Update::parse(frame, HEADER_SIZE)?),
        OpCode::Delete => MessageBody::Delete(Delete::parse(frame, HEADER_SIZE)?),
        OpCode::Compressed => {
            if !allow_compressed {
                return Err(WireError::NestedCompression);
            }
            return parse_compressed(header, frame);
        }
    };
    Ok(Message {
        request_id: header.request_id,
        response_to: header.response_to,
        body,
    })
}

/// Wrapper payload: {original opcode: i32, uncompressed size: i32,
/// compressor id: u8, compressed bytes}. The declared size is bounded
/// before any allocation happens.
fn parse_compressed(header: MessageHeader, frame: &[u8]) -> Result<Message, WireError> {
    let payload = &frame[HEADER_SIZE..];
    if payload.len() < 9 {
        return Err(WireError::TruncatedPayload {
            offset: frame.len(),
            needed: 9 - payload.len(),
        });
    }
    let original_op = i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let size = i32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
    if size < 0 {
        return Err(WireError::InvalidUncompressedSize(size));
    }
    let size = size as usize;
    if HEADER_SIZE + size > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge {
            size: HEADER_SIZE + size,
            max: MAX_MESSAGE_SIZE,
        });
    }
    let compressor = Compressor::try_from(payload[8])?;
    let inner_body = compressor.decompress(&payload[9..], size)?;

    // Rebuild the frame as it looked before compression, so a checksummed
    // inner message verifies over the same bytes the sender hashed.
    let mut inner = BytesMut::with_capacity(HEADER_SIZE + inner_body.len());
    MessageHeader {
        message_length: (HEADER_SIZE + inner_body.len()) as i32,
        request_id: header.request_id,
        response_to: header.response_to,
        op_code: original_op,
    }
    .write_to(&mut inner);
    inner.extend_from_slice(&inner_body);
    parse_frame(&inner, false)
}

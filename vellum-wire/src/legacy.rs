//! Legacy single-operation messages.
//!
//! These predate the multi-section message and survive for two reasons:
//! servers answer the first handshake on a connection with a legacy reply,
//! and kill-cursors is still accepted in its legacy form. The remaining
//! ops are kept for wire compatibility with older peers. All integers are
//! little-endian; collection namespaces travel as cstrings.

use crate::error::WireError;
use bytes::{BufMut, BytesMut};
use vellum_bson::Document;

/// Response flag bits of a legacy reply.
///
/// Unknown bits are preserved rather than rejected; replies come from the
/// server and old deployments set reserved bits freely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplyFlags(u32);

impl ReplyFlags {
    /// The requested cursor id is no longer known to the server.
    pub const CURSOR_NOT_FOUND: u32 = 1 << 0;
    /// The query failed; the single returned document describes why.
    pub const QUERY_FAILURE: u32 = 1 << 1;
    pub const SHARD_CONFIG_STALE: u32 = 1 << 2;
    /// The server supports await-data on tailable cursors.
    pub const AWAIT_CAPABLE: u32 = 1 << 3;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn has_cursor_not_found(&self) -> bool {
        self.0 & Self::CURSOR_NOT_FOUND != 0
    }

    pub fn has_query_failure(&self) -> bool {
        self.0 & Self::QUERY_FAILURE != 0
    }

    pub fn has_shard_config_stale(&self) -> bool {
        self.0 & Self::SHARD_CONFIG_STALE != 0
    }

    pub fn has_await_capable(&self) -> bool {
        self.0 & Self::AWAIT_CAPABLE != 0
    }
}

/// Legacy reply (opcode 1). The document count on the wire is derived
/// from `documents` when encoding and checked against it when parsing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    pub flags: ReplyFlags,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub documents: Vec<Document>,
}

/// Legacy query (opcode 2004).
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub flags: u32,
    pub namespace: String,
    pub number_to_skip: i32,
    pub number_to_return: i32,
    pub query: Document,
    pub fields: Option<Document>,
}

/// Legacy get-more (opcode 2005).
#[derive(Debug, Clone, PartialEq)]
pub struct GetMore {
    pub namespace: String,
    pub number_to_return: i32,
    pub cursor_id: i64,
}

/// Legacy kill-cursors (opcode 2007). Fire-and-forget; no reply follows.
#[derive(Debug, Clone, PartialEq)]
pub struct KillCursors {
    pub cursor_ids: Vec<i64>,
}

/// Legacy insert (opcode 2002).
#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub flags: u32,
    pub namespace: String,
    pub documents: Vec<Document>,
}

/// Legacy update (opcode 2001).
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub namespace: String,
    pub flags: u32,
    pub selector: Document,
    pub update: Document,
}

/// Legacy delete (opcode 2006).
#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub namespace: String,
    pub flags: u32,
    pub selector: Document,
}

/// Bounds-checked reader over a frame's payload. Positions are absolute
/// within the frame, so errors point at real offsets.
struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8], pos: usize) -> Self {
        PayloadReader { buf, pos }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_exact(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::TruncatedPayload {
                offset: self.pos,
                needed: n - self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_i32(&mut self) -> Result<i32, WireError> {
        let b = self.read_exact(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u32(&mut self) -> Result<u32, WireError> {
        Ok(self.read_i32()? as u32)
    }

    fn read_i64(&mut self) -> Result<i64, WireError> {
        let b = self.read_exact(8)?;
        Ok(i64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_cstring(&mut self) -> Result<String, WireError> {
        let start = self.pos;
        let nul = self.buf[start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or(WireError::TruncatedPayload {
                offset: start,
                needed: 1,
            })?;
        let text = std::str::from_utf8(&self.buf[start..start + nul]).map_err(|_| {
            WireError::Document(vellum_bson::DecodeError::InvalidUtf8 { offset: start })
        })?;
        self.pos += nul + 1;
        Ok(text.to_string())
    }

    fn read_document(&mut self) -> Result<Document, WireError> {
        let (doc, consumed) = Document::decode_at(self.buf, self.pos)?;
        self.pos += consumed;
        Ok(doc)
    }

    /// Remaining payload as concatenated documents.
    fn read_documents_to_end(&mut self) -> Result<Vec<Document>, WireError> {
        let mut documents = Vec::new();
        while self.remaining() > 0 {
            documents.push(self.read_document()?);
        }
        Ok(documents)
    }

    fn finish(self) -> Result<(), WireError> {
        if self.remaining() > 0 {
            return Err(WireError::TrailingBytes {
                count: self.remaining(),
            });
        }
        Ok(())
    }
}

fn write_cstring(buf: &mut BytesMut, s: &str, field: &'static str) -> Result<(), WireError> {
    if s.as_bytes().contains(&0) {
        return Err(WireError::CstringContainsNul { field });
    }
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
    Ok(())
}

impl Reply {
    pub(crate) fn encoded_len(&self) -> usize {
        4 + 8
            + 4
            + 4
            + self
                .documents
                .iter()
                .map(Document::encoded_len)
                .sum::<usize>()
    }

    pub(crate) fn write_to(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        buf.put_u32_le(self.flags.bits());
        buf.put_i64_le(self.cursor_id);
        buf.put_i32_le(self.starting_from);
        buf.put_i32_le(self.documents.len() as i32);
        for doc in &self.documents {
            doc.write_to(buf)?;
        }
        Ok(())
    }

    pub(crate) fn parse(frame: &[u8], payload_start: usize) -> Result<Reply, WireError> {
        let mut reader = PayloadReader::new(frame, payload_start);
        let flags = ReplyFlags::from_bits(reader.read_u32()?);
        let cursor_id = reader.read_i64()?;
        let starting_from = reader.read_i32()?;
        let number_returned = reader.read_i32()?;
        let documents = reader.read_documents_to_end()?;
        if number_returned < 0 || number_returned as usize != documents.len() {
            return Err(WireError::DocumentCountMismatch {
                declared: number_returned,
                actual: documents.len(),
            });
        }
        Ok(Reply {
            flags,
            cursor_id,
            starting_from,
            documents,
        })
    }
}

impl Query {
    pub(crate) fn encoded_len(&self) -> usize {
        4 + self.namespace.len()
            + 1
            + 4
            + 4
            + self.query.encoded_len()
            + self.fields.as_ref().map_or(0, Document::encoded_len)
    }

    pub(crate) fn write_to(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        buf.put_u32_le(self.flags);
        write_cstring(buf, &self.namespace, "collection namespace")?;
        buf.put_i32_le(self.number_to_skip);
        buf.put_i32_le(self.number_to_return);
        self.query.write_to(buf)?;
        if let Some(fields) = &self.fields {
            fields.write_to(buf)?;
        }
        Ok(())
    }

    pub(crate) fn parse(frame: &[u8], payload_start: usize) -> Result<Query, WireError> {
        let mut reader = PayloadReader::new(frame, payload_start);
        let flags = reader.read_u32()?;
        let namespace = reader.read_cstring()?;
        let number_to_skip = reader.read_i32()?;
        let number_to_return = reader.read_i32()?;
        let query = reader.read_document()?;
        let fields = if reader.remaining() > 0 {
            Some(reader.read_document()?)
        } else {
            None
        };
        reader.finish()?;
        Ok(Query {
            flags,
            namespace,
            number_to_skip,
            number_to_return,
            query,
            fields,
        })
    }
}

impl GetMore {
    pub(crate) fn encoded_len(&self) -> usize {
        4 + self.namespace.len() + 1 + 4 + 8
    }

    pub(crate) fn write_to(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        buf.put_i32_le(0);
        write_cstring(buf, &self.namespace, "collection namespace")?;
        buf.put_i32_le(self.number_to_return);
        buf.put_i64_le(self.cursor_id);
        Ok(())
    }

    pub(crate) fn parse(frame: &[u8], payload_start: usize) -> Result<GetMore, WireError> {
        let mut reader = PayloadReader::new(frame, payload_start);
        reader.read_i32()?;
        let namespace = reader.read_cstring()?;
        let number_to_return = reader.read_i32()?;
        let cursor_id = reader.read_i64()?;
        reader.finish()?;
        Ok(GetMore {
            namespace,
            number_to_return,
            cursor_id,
        })
    }
}

impl KillCursors {
    pub(crate) fn encoded_len(&self) -> usize {
        4 + 4 + self.cursor_ids.len() * 8
    }

    pub(crate) fn write_to(&self, buf: &mut BytesMut) {
        buf.put_i32_le(0);
        buf.put_i32_le(self.cursor_ids.len() as i32);
        for id in &self.cursor_ids {
            buf.put_i64_le(*id);
        }
    }

    pub(crate) fn parse(frame: &[u8], payload_start: usize) -> Result<KillCursors, WireError> {
        let mut reader = PayloadReader::new(frame, payload_start);
        reader.read_i32()?;
        let count = reader.read_i32()?;
        // The count bounds the allocation below, so it must fit the
        // payload before any capacity is reserved.
        if count < 0 || count as usize > reader.remaining() / 8 {
            return Err(WireError::DocumentCountMismatch {
                declared: count,
                actual: reader.remaining() / 8,
            });
        }
        let mut cursor_ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            cursor_ids.push(reader.read_i64()?);
        }
        reader.finish()?;
        Ok(KillCursors { cursor_ids })
    }
}

impl Insert {
    pub(crate) fn encoded_len(&self) -> usize {
        4 + self.namespace.len()
            + 1
            + self
                .documents
                .iter()
                .map(Document::encoded_len)
                .sum::<usize>()
    }

    pub(crate) fn write_to(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        buf.put_u32_le(self.flags);
        write_cstring(buf, &self.namespace, "collection namespace")?;
        for doc in &self.documents {
            doc.write_to(buf)?;
        }
        Ok(())
    }

    pub(crate) fn parse(frame: &[u8], payload_start: usize) -> Result<Insert, WireError> {
        let mut reader = PayloadReader::new(frame, payload_start);
        let flags = reader.read_u32()?;
        let namespace = reader.read_cstring()?;
        let documents = reader.read_documents_to_end()?;
        Ok(Insert {
            flags,
            namespace,
            documents,
        })
    }
}

impl Update {
    pub(crate) fn encoded_len(&self) -> usize {
        4 + self.namespace.len()
            + 1
            + 4
            + self.selector.encoded_len()
            + self.update.encoded_len()
    }

    pub(crate) fn write_to(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        buf.put_i32_le(0);
        write_cstring(buf, &self.namespace, "collection namespace")?;
        buf.put_u32_le(self.flags);
        self.selector.write_to(buf)?;
        self.update.write_to(buf)?;
        Ok(())
    }

    pub(crate) fn parse(frame: &[u8], payload_start: usize) -> Result<Update, WireError> {
        let mut reader = PayloadReader::new(frame, payload_start);
        reader.read_i32()?;
        let namespace = reader.read_cstring()?;
        let flags = reader.read_u32()?;
        let selector = reader.read_document()?;
        let update = reader.read_document()?;
        reader.finish()?;
        Ok(Update {
            namespace,
            flags,
            selector,
            update,
        })
    }
}

impl Delete {
    pub(crate) fn encoded_len(&self) -> usize {
        4 + self.namespace.len() + 1 + 4 + self.selector.encoded_len()
    }

    pub(crate) fn write_to(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        buf.put_i32_le(0);
        write_cstring(buf, &self.namespace, "collection namespace")?;
        buf.put_u32_le(self.flags);
        self.selector.write_to(buf)?;
        Ok(())
    }

    pub(crate) fn parse(frame: &[u8], payload_start: usize) -> Result<Delete, WireError> {
        let mut reader = PayloadReader::new(frame, payload_start);
        reader.read_i32()?;
        let namespace = reader.read_cstring()?;
        let flags = reader.read_u32()?;
        let selector = reader.read_document()?;
        reader.finish()?;
        Ok(Delete {
            namespace,
            flags,
            selector,
        })
    }
}

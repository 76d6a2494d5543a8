//! Multi-section message bodies (opcode 2013).
//!
//! Payload layout:
//!
//! ```text
//! +-------------+-------------+-----+----------------------+
//! | flags: u32  | section ... | ... | [crc32c: u32]        |
//! +-------------+-------------+-----+----------------------+
//! ```
//!
//! A section is either kind 0 (one document, the command body) or kind 1
//! (an i32 size counting itself, a cstring identifier, then one or more
//! documents). When the checksum flag is set the trailing CRC32C covers
//! every preceding byte of the message, header included, and is verified
//! before any section is parsed.

use crate::error::WireError;
use bytes::{BufMut, BytesMut};
use vellum_bson::Document;

/// Flag bits of a multi-section message.
///
/// Bits 0..=15 are required: a receiver must reject a message carrying an
/// unknown one. Bits 16..=31 are optional and pass through untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsgFlags(u32);

impl MsgFlags {
    /// The message ends with a CRC32C over everything before it.
    pub const CHECKSUM_PRESENT: u32 = 1 << 0;
    /// Another message follows with no request in between; no reply is
    /// expected to this one.
    pub const MORE_TO_COME: u32 = 1 << 1;
    /// The peer may stream multiple replies without further requests.
    pub const EXHAUST_ALLOWED: u32 = 1 << 16;

    const REQUIRED_MASK: u32 = 0x0000_FFFF;
    const KNOWN_REQUIRED: u32 = Self::CHECKSUM_PRESENT | Self::MORE_TO_COME;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_checksum(mut self) -> Self {
        self.0 |= Self::CHECKSUM_PRESENT;
        self
    }

    pub fn with_more_to_come(mut self) -> Self {
        self.0 |= Self::MORE_TO_COME;
        self
    }

    pub fn with_exhaust_allowed(mut self) -> Self {
        self.0 |= Self::EXHAUST_ALLOWED;
        self
    }

    pub fn has_checksum(&self) -> bool {
        self.0 & Self::CHECKSUM_PRESENT != 0
    }

    pub fn has_more_to_come(&self) -> bool {
        self.0 & Self::MORE_TO_COME != 0
    }

    pub fn has_exhaust_allowed(&self) -> bool {
        self.0 & Self::EXHAUST_ALLOWED != 0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Validates inbound bits: unknown required bits are an error, unknown
    /// optional bits are preserved.
    pub fn from_bits(bits: u32) -> Result<Self, WireError> {
        let unknown_required = bits & Self::REQUIRED_MASK & !Self::KNOWN_REQUIRED;
        if unknown_required != 0 {
            return Err(WireError::UnsupportedFlags {
                bits: unknown_required,
            });
        }
        Ok(Self(bits))
    }
}

/// A named batch of documents (section kind 1).
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSequence {
    pub identifier: String,
    pub documents: Vec<Document>,
}

/// One section of a multi-section message.
#[derive(Debug, Clone, PartialEq)]
pub enum Section {
    /// Kind 0: the command body document.
    Body(Document),
    /// Kind 1: a named document sequence.
    Sequence(DocumentSequence),
}

impl Section {
    pub fn kind(&self) -> u8 {
        match self {
            Section::Body(_) => 0,
            Section::Sequence(_) => 1,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Section::Body(doc) => 1 + doc.encoded_len(),
            Section::Sequence(seq) => {
                let docs: usize = seq.documents.iter().map(Document::encoded_len).sum();
                1 + 4 + seq.identifier.len() + 1 + docs
            }
        }
    }

    fn write_to(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        match self {
            Section::Body(doc) => {
                buf.put_u8(0);
                doc.write_to(buf)?;
            }
            Section::Sequence(seq) => {
                if seq.identifier.as_bytes().contains(&0) {
                    return Err(WireError::CstringContainsNul {
                        field: "sequence identifier",
                    });
                }
                buf.put_u8(1);
                // Size counts itself but not the kind byte.
                buf.put_i32_le((self.encoded_len() - 1) as i32);
                buf.put_slice(seq.identifier.as_bytes());
                buf.put_u8(0);
                for doc in &seq.documents {
                    doc.write_to(buf)?;
                }
            }
        }
        Ok(())
    }
}

/// A parsed or to-be-sent multi-section message body.
#[derive(Debug, Clone, PartialEq)]
pub struct OpMsg {
    pub flags: MsgFlags,
    pub sections: Vec<Section>,
}

impl OpMsg {
    /// A message with a single kind-0 body section and no flags.
    pub fn new(body: Document) -> Self {
        OpMsg {
            flags: MsgFlags::new(),
            sections: vec![Section::Body(body)],
        }
    }

    pub fn with_checksum(mut self) -> Self {
        self.flags = self.flags.with_checksum();
        self
    }

    pub fn with_more_to_come(mut self) -> Self {
        self.flags = self.flags.with_more_to_come();
        self
    }

    pub fn with_exhaust_allowed(mut self) -> Self {
        self.flags = self.flags.with_exhaust_allowed();
        self
    }

    /// Appends a kind-1 section.
    pub fn with_sequence(
        mut self,
        identifier: impl Into<String>,
        documents: Vec<Document>,
    ) -> Self {
        self.sections.push(Section::Sequence(DocumentSequence {
            identifier: identifier.into(),
            documents,
        }));
        self
    }

    /// The first kind-0 section, the command body.
    pub fn body(&self) -> Option<&Document> {
        self.sections.iter().find_map(|section| match section {
            Section::Body(doc) => Some(doc),
            Section::Sequence(_) => None,
        })
    }

    /// The kind-1 section with the given identifier, if any.
    pub fn sequence(&self, identifier: &str) -> Option<&DocumentSequence> {
        self.sections.iter().find_map(|section| match section {
            Section::Sequence(seq) if seq.identifier == identifier => Some(seq),
            _ => None,
        })
    }

    /// Payload length: flags, sections, and the checksum slot when the
    /// flag is set.
    pub(crate) fn encoded_len(&self) -> usize {
        let sections: usize = self.sections.iter().map(Section::encoded_len).sum();
        4 + sections + if self.flags.has_checksum() { 4 } else { 0 }
    }

    /// Writes flags and sections. The checksum itself is appended by the
    /// message encoder once the full frame is in the buffer.
    pub(crate) fn write_to(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        buf.put_u32_le(self.flags.bits());
        for section in &self.sections {
            section.write_to(buf)?;
        }
        Ok(())
    }

    /// Parses the payload of `frame`, which must be the whole message with
    /// its header so the checksum can be verified over it.
    pub(crate) fn parse(frame: &[u8], payload_start: usize) -> Result<OpMsg, WireError> {
        if frame.len() < payload_start + 4 {
            return Err(WireError::TruncatedPayload {
                offset: frame.len(),
                needed: payload_start + 4 - frame.len(),
            });
        }
        let flags = MsgFlags::from_bits(u32::from_le_bytes([
            frame[payload_start],
            frame[payload_start + 1],
            frame[payload_start + 2],
            frame[payload_start + 3],
        ]))?;

        let sections_end = if flags.has_checksum() {
            let crc_offset = frame
                .len()
                .checked_sub(4)
                .filter(|&off| off >= payload_start + 4)
                .ok_or(WireError::TruncatedPayload {
                    offset: frame.len(),
                    needed: 4,
                })?;
            let expected = u32::from_le_bytes([
                frame[crc_offset],
                frame[crc_offset + 1],
                frame[crc_offset + 2],
                frame[crc_offset + 3],
            ]);
            let actual = crc32c::crc32c(&frame[..crc_offset]);
            if actual != expected {
                return Err(WireError::ChecksumMismatch { expected, actual });
            }
            crc_offset
        } else {
            frame.len()
        };

        let sections = read_sections(&frame[..sections_end], payload_start + 4)?;
        Ok(OpMsg { flags, sections })
    }
}

fn read_sections(buf: &[u8], start: usize) -> Result<Vec<Section>, WireError> {
    let mut sections = Vec::new();
    let mut pos = start;
    while pos < buf.len() {
        let kind = buf[pos];
        pos += 1;
        match kind {
            0 => {
                let (doc, consumed) = Document::decode_at(buf, pos)?;
                sections.push(Section::Body(doc));
                pos += consumed;
            }
            1 => {
                let size_offset = pos;
                if buf.len() - pos < 4 {
                    return Err(WireError::TruncatedPayload {
                        offset: pos,
                        needed: 4 - (buf.len() - pos),
                    });
                }
                let size = i32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]);
                // Minimum: the size field plus an empty identifier's NUL.
                if size < 5 {
                    return Err(WireError::InvalidSectionLength {
                        len: size,
                        offset: size_offset,
                    });
                }
                let section_end = size_offset + size as usize;
                if section_end > buf.len() {
                    return Err(WireError::InvalidSectionLength {
                        len: size,
                        offset: size_offset,
                    });
                }
                pos += 4;
                let section = &buf[..section_end];
                let nul = section[pos..]
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or(WireError::TruncatedPayload {
                        offset: pos,
                        needed: 1,
                    })?;
                let identifier = std::str::from_utf8(&section[pos..pos + nul])
                    .map_err(|_| {
                        WireError::Document(vellum_bson::DecodeError::InvalidUtf8 { offset: pos })
                    })?
                    .to_string();
                pos += nul + 1;
                let mut documents = Vec::new();
                while pos < section_end {
                    let (doc, consumed) = Document::decode_at(section, pos)?;
                    documents.push(doc);
                    pos += consumed;
                }
                sections.push(Section::Sequence(DocumentSequence {
                    identifier,
                    documents,
                }));
            }
            kind => {
                return Err(WireError::UnknownSectionKind {
                    kind,
                    offset: pos - 1,
                });
            }
        }
    }
    Ok(sections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_bson::doc;

    #[test]
    fn test_flags_builders() {
        let flags = MsgFlags::new().with_checksum().with_exhaust_allowed();
        assert!(flags.has_checksum());
        assert!(flags.has_exhaust_allowed());
        assert!(!flags.has_more_to_come());
        assert_eq!(flags.bits(), (1 << 0) | (1 << 16));
    }

    #[test]
    fn test_unknown_required_bit_rejected() {
        let err = MsgFlags::from_bits(1 << 2).unwrap_err();
        assert!(matches!(
            err,
            WireError::UnsupportedFlags { bits } if bits == 1 << 2
        ));
    }

    #[test]
    fn test_unknown_optional_bits_preserved() {
        let flags = MsgFlags::from_bits((1 << 20) | (1 << 1)).unwrap();
        assert!(flags.has_more_to_come());
        assert_eq!(flags.bits(), (1 << 20) | (1 << 1));
    }

    #[test]
    fn test_body_and_sequence_lookup() {
        let msg = OpMsg::new(doc! { "insert" => "coll" })
            .with_sequence("documents", vec![doc! { "a" => 1 }, doc! { "a" => 2 }]);
        assert_eq!(msg.body().unwrap().get_str("insert"), Some("coll"));
        let seq = msg.sequence("documents").unwrap();
        assert_eq!(seq.documents.len(), 2);
        assert!(msg.sequence("other").is_none());
    }

    fn fabricate_frame(msg: &OpMsg) -> Vec<u8> {
        // A zeroed header is fine here; only the payload is under test and
        // the checksum covers whatever bytes precede it.
        let mut buf = BytesMut::new();
        buf.put_slice(&[0u8; 16]);
        msg.write_to(&mut buf).unwrap();
        if msg.flags.has_checksum() {
            let crc = crc32c::crc32c(&buf);
            buf.put_u32_le(crc);
        }
        buf.to_vec()
    }

    #[test]
    fn test_parse_round_trip() {
        let msg = OpMsg::new(doc! { "find" => "users" })
            .with_sequence("documents", vec![doc! { "x" => 1 }]);
        let frame = fabricate_frame(&msg);
        let parsed = OpMsg::parse(&frame, 16).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_parse_verifies_checksum() {
        let msg = OpMsg::new(doc! { "ping" => 1 }).with_checksum();
        let mut frame = fabricate_frame(&msg);
        assert!(OpMsg::parse(&frame, 16).is_ok());

        // Flip one payload byte; the CRC must catch it.
        frame[21] ^= 0x40;
        let err = OpMsg::parse(&frame, 16).unwrap_err();
        assert!(matches!(err, WireError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_unknown_section_kind() {
        let msg = OpMsg::new(doc! { "ping" => 1 });
        let mut frame = fabricate_frame(&msg);
        // Kind byte of the first section sits right after the flags.
        frame[20] = 9;
        let err = OpMsg::parse(&frame, 16).unwrap_err();
        assert!(matches!(
            err,
            WireError::UnknownSectionKind { kind: 9, offset: 20 }
        ));
    }

    #[test]
    fn test_sequence_size_beyond_payload() {
        let msg = OpMsg::new(doc! { "insert" => "c" })
            .with_sequence("docs", vec![doc! { "i" => 1 }]);
        let mut frame = fabricate_frame(&msg);
        // The sequence size field follows the body section's kind byte,
        // document, and the kind-1 byte.
        let body_len = doc! { "insert" => "c" }.encoded_len();
        let size_offset = 16 + 4 + 1 + body_len + 1;
        let size = i32::from_le_bytes([
            frame[size_offset],
            frame[size_offset + 1],
            frame[size_offset + 2],
            frame[size_offset + 3],
        ]);
        frame[size_offset..size_offset + 4].copy_from_slice(&(size + 40).to_le_bytes());
        let err = OpMsg::parse(&frame, 16).unwrap_err();
        assert!(matches!(err, WireError::InvalidSectionLength { .. }));
    }

    #[test]
    fn test_empty_sequence_accepted() {
        // Size 5: the field itself plus an empty identifier. Encoders
        // always emit at least one document, but a decoder tolerates none.
        let mut frame = vec![0u8; 16];
        frame.extend_from_slice(&0u32.to_le_bytes());
        frame.push(1);
        frame.extend_from_slice(&5i32.to_le_bytes());
        frame.push(0);
        let parsed = OpMsg::parse(&frame, 16).unwrap();
        match &parsed.sections[0] {
            Section::Sequence(seq) => {
                assert_eq!(seq.identifier, "");
                assert!(seq.documents.is_empty());
            }
            other => panic!("expected sequence, got {other:?}"),
        }
    }

    #[test]
    fn test_sequence_identifier_nul_rejected_on_encode() {
        let msg = OpMsg::new(doc! { "a" => 1 }).with_sequence("bad\0id", vec![]);
        let mut buf = BytesMut::new();
        let err = msg.write_to(&mut buf).unwrap_err();
        assert!(matches!(err, WireError::CstringContainsNul { .. }));
    }

    #[test]
    fn test_encoded_len_matches_written() {
        let plain = OpMsg::new(doc! { "find" => "users", "limit" => 5 })
            .with_sequence("documents", vec![doc! { "v" => 1 }, doc! { "v" => 2 }]);
        let mut buf = BytesMut::new();
        plain.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), plain.encoded_len());

        let checked = OpMsg::new(doc! { "ping" => 1 }).with_checksum();
        let mut buf = BytesMut::new();
        checked.write_to(&mut buf).unwrap();
        // write_to leaves the checksum slot to the frame encoder.
        assert_eq!(buf.len() + 4, checked.encoded_len());
    }
}

//! Document decoder.
//!
//! Layout of one document:
//!
//! ```text
//! +-------------+----------------------------------+------+
//! | len: i32 LE | elements: (tag, key, payload)... | 0x00 |
//! +-------------+----------------------------------+------+
//! ```
//!
//! `len` counts every byte of the document including itself and the
//! terminator. The decoder treats a document's declared end as the end of
//! input for its elements: no read ever crosses it, even when the buffer
//! holds more bytes. Offsets in errors are absolute within the buffer
//! handed to [`decode_document_at`].

use crate::document::Document;
use crate::error::DecodeError;
use crate::oid::ObjectId;
use crate::value::{
    Binary, DateTime, ElementType, JavaScriptCodeWithScope, Regex, Timestamp, Value,
};
use crate::{MAX_DECODE_DEPTH, MAX_DOCUMENT_SIZE, MIN_DOCUMENT_SIZE};

/// Bounds-checked cursor over the input buffer. `limit` is the current
/// document's declared end; child documents narrow it further.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    limit: usize,
}

impl<'a> Reader<'a> {
    fn read_exact(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let available = self.limit - self.pos;
        if available < n {
            return Err(DecodeError::UnexpectedEof {
                offset: self.pos,
                needed: n - available,
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_exact(1)?[0])
    }

    fn read_i32(&mut self) -> Result<i32, DecodeError> {
        let b = self.read_exact(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i64(&mut self) -> Result<i64, DecodeError> {
        let b = self.read_exact(8)?;
        Ok(i64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_u64(&mut self) -> Result<u64, DecodeError> {
        Ok(self.read_i64()? as u64)
    }

    fn read_f64(&mut self) -> Result<f64, DecodeError> {
        let b = self.read_exact(8)?;
        Ok(f64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Scans forward to the next NUL, never past `limit`.
    fn read_cstring(&mut self) -> Result<&'a str, DecodeError> {
        let start = self.pos;
        let slice = &self.buf[self.pos..self.limit];
        let nul = slice
            .iter()
            .position(|&b| b == 0)
            .ok_or(DecodeError::UnterminatedCstring { offset: start })?;
        let text = std::str::from_utf8(&slice[..nul])
            .map_err(|_| DecodeError::InvalidUtf8 { offset: start })?;
        self.pos += nul + 1;
        Ok(text)
    }

    /// Length-prefixed string: the prefix counts the trailing NUL, which
    /// must be present. Interior NULs are legal.
    fn read_string(&mut self) -> Result<String, DecodeError> {
        let len_offset = self.pos;
        let len = self.read_i32()?;
        if len < 1 {
            return Err(DecodeError::InvalidLength {
                len,
                offset: len_offset,
            });
        }
        let bytes = self.read_exact(len as usize)?;
        let (text, terminator) = bytes.split_at(len as usize - 1);
        if terminator != [0] {
            return Err(DecodeError::MissingStringTerminator { offset: len_offset });
        }
        let text = std::str::from_utf8(text).map_err(|_| DecodeError::InvalidUtf8 {
            offset: len_offset + 4,
        })?;
        Ok(text.to_string())
    }
}

/// Decodes one document starting at `offset`, returning it with the bytes
/// consumed. The caller may hold further documents after it.
pub(crate) fn decode_document_at(
    buf: &[u8],
    offset: usize,
) -> Result<(Document, usize), DecodeError> {
    if offset > buf.len() {
        return Err(DecodeError::UnexpectedEof {
            offset: buf.len(),
            needed: offset - buf.len(),
        });
    }
    let mut reader = Reader {
        buf,
        pos: offset,
        limit: buf.len(),
    };
    let doc = read_document(&mut reader, 0)?;
    Ok((doc, reader.pos - offset))
}

/// Reads the length prefix and narrows `reader` to the declared end,
/// returning the document end position.
fn begin_document(reader: &mut Reader<'_>) -> Result<usize, DecodeError> {
    let start = reader.pos;
    let len = reader.read_i32()?;
    if len < MIN_DOCUMENT_SIZE as i32 {
        return Err(DecodeError::InvalidLength { len, offset: start });
    }
    let len = len as usize;
    if len > MAX_DOCUMENT_SIZE {
        return Err(DecodeError::DocumentTooLarge {
            len,
            max: MAX_DOCUMENT_SIZE,
            offset: start,
        });
    }
    let end = start + len;
    if end > reader.limit {
        return Err(DecodeError::UnexpectedEof {
            offset: reader.pos,
            needed: end - reader.limit,
        });
    }
    Ok(end)
}

fn read_document(reader: &mut Reader<'_>, depth: usize) -> Result<Document, DecodeError> {
    if depth > MAX_DECODE_DEPTH {
        return Err(DecodeError::DepthLimitExceeded {
            limit: MAX_DECODE_DEPTH,
        });
    }
    let start = reader.pos;
    let end = begin_document(reader)?;
    let mut child = Reader {
        buf: reader.buf,
        pos: reader.pos,
        limit: end,
    };
    let mut doc = Document::new();
    loop {
        let tag_offset = child.pos;
        let tag = child.read_u8()?;
        if tag == 0x00 {
            break;
        }
        let element_type = element_type_for(tag, tag_offset)?;
        let key = child.read_cstring()?.to_string();
        let value = read_value(&mut child, element_type, depth)?;
        // Duplicate keys on the wire: last occurrence wins.
        doc.insert(key, value);
    }
    finish_document(reader, child.pos, start, end)?;
    Ok(doc)
}

/// Array payloads are documents with decimal keys; the keys are scanned
/// but not materialized, and elements are taken positionally.
fn read_array(reader: &mut Reader<'_>, depth: usize) -> Result<Vec<Value>, DecodeError> {
    if depth > MAX_DECODE_DEPTH {
        return Err(DecodeError::DepthLimitExceeded {
            limit: MAX_DECODE_DEPTH,
        });
    }
    let start = reader.pos;
    let end = begin_document(reader)?;
    let mut child = Reader {
        buf: reader.buf,
        pos: reader.pos,
        limit: end,
    };
    let mut values = Vec::new();
    loop {
        let tag_offset = child.pos;
        let tag = child.read_u8()?;
        if tag == 0x00 {
            break;
        }
        let element_type = element_type_for(tag, tag_offset)?;
        child.read_cstring()?;
        values.push(read_value(&mut child, element_type, depth)?);
    }
    finish_document(reader, child.pos, start, end)?;
    Ok(values)
}

fn element_type_for(tag: u8, offset: usize) -> Result<ElementType, DecodeError> {
    if ElementType::DEPRECATED.contains(&tag) {
        return Err(DecodeError::DeprecatedTag { tag, offset });
    }
    ElementType::from_u8(tag).ok_or(DecodeError::UnknownTag { tag, offset })
}

/// Enforces the length invariant: the terminator must land exactly on the
/// declared end. Advances the parent reader past the document.
fn finish_document(
    reader: &mut Reader<'_>,
    consumed_to: usize,
    start: usize,
    end: usize,
) -> Result<(), DecodeError> {
    if consumed_to != end {
        return Err(DecodeError::LengthMismatch {
            declared: end - start,
            actual: consumed_to - start,
            offset: start,
        });
    }
    reader.pos = end;
    Ok(())
}

fn read_value(
    reader: &mut Reader<'_>,
    element_type: ElementType,
    depth: usize,
) -> Result<Value, DecodeError> {
    let value = match element_type {
        ElementType::Double => Value::Double(reader.read_f64()?),
        ElementType::String => Value::String(reader.read_string()?),
        ElementType::Document => Value::Document(read_document(reader, depth + 1)?),
        ElementType::Array => Value::Array(read_array(reader, depth + 1)?),
        ElementType::Binary => {
            let len_offset = reader.pos;
            let len = reader.read_i32()?;
            if len < 0 {
                return Err(DecodeError::InvalidLength {
                    len,
                    offset: len_offset,
                });
            }
            let subtype = reader.read_u8()?.into();
            let bytes = reader.read_exact(len as usize)?.to_vec();
            Value::Binary(Binary { subtype, bytes })
        }
        ElementType::ObjectId => {
            let b = reader.read_exact(12)?;
            let mut bytes = [0u8; 12];
            bytes.copy_from_slice(b);
            Value::ObjectId(ObjectId::from_bytes(bytes))
        }
        ElementType::Boolean => {
            let offset = reader.pos;
            match reader.read_u8()? {
                0x00 => Value::Boolean(false),
                0x01 => Value::Boolean(true),
                value => return Err(DecodeError::InvalidBoolean { value, offset }),
            }
        }
        ElementType::DateTime => Value::DateTime(DateTime::from_millis(reader.read_i64()?)),
        ElementType::Null => Value::Null,
        ElementType::Regex => {
            let pattern = reader.read_cstring()?.to_string();
            let options = reader.read_cstring()?.to_string();
            Value::Regex(Regex { pattern, options })
        }
        ElementType::JavaScriptCode => Value::JavaScriptCode(reader.read_string()?),
        ElementType::JavaScriptCodeWithScope => read_code_with_scope(reader, depth)?,
        ElementType::Int32 => Value::Int32(reader.read_i32()?),
        ElementType::Timestamp => Value::Timestamp(Timestamp::from_u64(reader.read_u64()?)),
        ElementType::Int64 => Value::Int64(reader.read_i64()?),
        ElementType::MaxKey => Value::MaxKey,
        ElementType::MinKey => Value::MinKey,
    };
    Ok(value)
}

/// Code-with-scope: an outer i32 total (including itself), a string, and a
/// scope document. The total gets the same exact-consumption check as a
/// document length.
fn read_code_with_scope(reader: &mut Reader<'_>, depth: usize) -> Result<Value, DecodeError> {
    let start = reader.pos;
    let total = reader.read_i32()?;
    // Smallest form: i32 total + empty string (5) + empty document (5).
    if total < 14 {
        return Err(DecodeError::InvalidLength {
            len: total,
            offset: start,
        });
    }
    let end = start + total as usize;
    if end > reader.limit {
        return Err(DecodeError::UnexpectedEof {
            offset: reader.pos,
            needed: end - reader.limit,
        });
    }
    let mut child = Reader {
        buf: reader.buf,
        pos: reader.pos,
        limit: end,
    };
    let code = child.read_string()?;
    let scope = read_document(&mut child, depth + 1)?;
    if child.pos != end {
        return Err(DecodeError::LengthMismatch {
            declared: total as usize,
            actual: child.pos - start,
            offset: start,
        });
    }
    reader.pos = end;
    Ok(Value::JavaScriptCodeWithScope(JavaScriptCodeWithScope {
        code,
        scope,
    }))
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use crate::doc;
    use proptest::prelude::*;

    fn leaf_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<f64>().prop_map(Value::Double),
            ".{0,12}".prop_map(Value::String),
            proptest::collection::vec(any::<u8>(), 0..24)
                .prop_map(|bytes| Value::Binary(Binary::generic(bytes))),
            any::<[u8; 12]>().prop_map(|b| Value::ObjectId(ObjectId::from_bytes(b))),
            any::<bool>().prop_map(Value::Boolean),
            any::<i64>().prop_map(|ms| Value::DateTime(DateTime::from_millis(ms))),
            Just(Value::Null),
            any::<i32>().prop_map(Value::Int32),
            any::<u64>().prop_map(|v| Value::Timestamp(Timestamp::from_u64(v))),
            any::<i64>().prop_map(Value::Int64),
            Just(Value::MaxKey),
            Just(Value::MinKey),
        ]
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        leaf_value().prop_recursive(4, 48, 6, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                proptest::collection::vec(("[a-z]{1,8}", inner), 0..4)
                    .prop_map(|entries| Value::Document(entries.into_iter().collect())),
            ]
        })
    }

    fn arb_document() -> impl Strategy<Value = Document> {
        proptest::collection::vec(("[a-z]{1,8}", arb_value()), 0..6)
            .prop_map(|entries| entries.into_iter().collect())
    }

    proptest! {
        #[test]
        fn prop_round_trip(doc in arb_document()) {
            let bytes = doc.encode().unwrap();
            let decoded = Document::from_bytes(&bytes).unwrap();
            // NaN payloads break equality; compare re-encoded bytes instead.
            prop_assert_eq!(&decoded.encode().unwrap()[..], &bytes[..]);
        }

        #[test]
        fn prop_length_prefix_exact(doc in arb_document()) {
            let bytes = doc.encode().unwrap();
            let prefix = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            prop_assert_eq!(prefix as usize, bytes.len());
            prop_assert_eq!(doc.encoded_len(), bytes.len());
        }

        #[test]
        fn prop_truncation_never_panics(doc in arb_document(), cut in 0.0..1.0_f64) {
            let bytes = doc.encode().unwrap();
            let k = ((bytes.len() - 1) as f64 * cut) as usize;
            prop_assert!(Document::from_bytes(&bytes[..k]).is_err());
        }

        #[test]
        fn prop_random_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = Document::from_bytes(&bytes);
        }
    }

    #[test]
    fn test_duplicate_keys_from_iterator_collapse() {
        let doc: Document = vec![
            ("k".to_string(), Value::Int32(1)),
            ("k".to_string(), Value::Int32(2)),
        ]
        .into_iter()
        .collect();
        assert_eq!(doc, doc! { "k" => 2 });
    }
}

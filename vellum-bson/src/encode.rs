//! Document encoder.
//!
//! Encoding is two-pass: [`document_len`] computes the exact size of every
//! document before a byte is written, so the leading length prefix is
//! correct even for deeply nested values. The write pass then appends to a
//! pre-reserved `BytesMut` and cannot fall short of or overrun the
//! computed size.

use crate::document::Document;
use crate::error::EncodeError;
use crate::value::Value;
use crate::MAX_DOCUMENT_SIZE;
use bytes::{BufMut, BytesMut};

/// Exact encoded size of `doc`: 4-byte length prefix, elements, terminator.
pub(crate) fn document_len(doc: &Document) -> usize {
    let mut len = 4 + 1;
    for (key, value) in doc.iter() {
        len += 1 + key.len() + 1 + value_len(value);
    }
    len
}

fn array_len(values: &[Value]) -> usize {
    let mut len = 4 + 1;
    for (index, value) in values.iter().enumerate() {
        len += 1 + decimal_digits(index) + 1 + value_len(value);
    }
    len
}

fn value_len(value: &Value) -> usize {
    match value {
        Value::Double(_) => 8,
        Value::String(s) => 4 + s.len() + 1,
        Value::Document(d) => document_len(d),
        Value::Array(a) => array_len(a),
        Value::Binary(b) => 4 + 1 + b.bytes.len(),
        Value::ObjectId(_) => 12,
        Value::Boolean(_) => 1,
        Value::DateTime(_) => 8,
        Value::Null => 0,
        Value::Regex(r) => r.pattern.len() + 1 + r.options.len() + 1,
        Value::JavaScriptCode(s) => 4 + s.len() + 1,
        Value::JavaScriptCodeWithScope(c) => 4 + (4 + c.code.len() + 1) + document_len(&c.scope),
        Value::Int32(_) => 4,
        Value::Timestamp(_) => 8,
        Value::Int64(_) => 8,
        Value::MaxKey | Value::MinKey => 0,
    }
}

fn decimal_digits(mut n: usize) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}

pub(crate) fn write_document(buf: &mut BytesMut, doc: &Document) -> Result<(), EncodeError> {
    let len = document_len(doc);
    if len > MAX_DOCUMENT_SIZE {
        return Err(EncodeError::DocumentTooLarge {
            size: len,
            max: MAX_DOCUMENT_SIZE,
        });
    }
    buf.reserve(len);
    buf.put_i32_le(len as i32);
    for (key, value) in doc.iter() {
        write_element(buf, key, value)?;
    }
    buf.put_u8(0x00);
    Ok(())
}

fn write_array(buf: &mut BytesMut, values: &[Value]) -> Result<(), EncodeError> {
    let len = array_len(values);
    if len > MAX_DOCUMENT_SIZE {
        return Err(EncodeError::DocumentTooLarge {
            size: len,
            max: MAX_DOCUMENT_SIZE,
        });
    }
    buf.reserve(len);
    buf.put_i32_le(len as i32);
    for (index, value) in values.iter().enumerate() {
        let mut scratch = [0u8; 20];
        let key = itoa_buf(index, &mut scratch);
        write_element(buf, key, value)?;
    }
    buf.put_u8(0x00);
    Ok(())
}

/// Formats `n` as decimal ASCII into `scratch`, returning the text.
/// Array keys are hot enough in bulk encodes to warrant skipping the
/// `String` allocation.
fn itoa_buf(mut n: usize, scratch: &mut [u8; 20]) -> &str {
    let mut pos = scratch.len();
    loop {
        pos -= 1;
        scratch[pos] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    // Digits are pure ASCII.
    std::str::from_utf8(&scratch[pos..]).unwrap_or("0")
}

fn write_element(buf: &mut BytesMut, key: &str, value: &Value) -> Result<(), EncodeError> {
    buf.put_u8(value.element_type() as u8);
    write_key(buf, key)?;
    write_value(buf, value)
}

fn write_key(buf: &mut BytesMut, key: &str) -> Result<(), EncodeError> {
    if key.as_bytes().contains(&0) {
        return Err(EncodeError::KeyContainsNul(key.to_string()));
    }
    buf.put_slice(key.as_bytes());
    buf.put_u8(0x00);
    Ok(())
}

fn write_regex_part(
    buf: &mut BytesMut,
    part: &str,
    field: &'static str,
) -> Result<(), EncodeError> {
    if part.as_bytes().contains(&0) {
        return Err(EncodeError::RegexContainsNul { field });
    }
    buf.put_slice(part.as_bytes());
    buf.put_u8(0x00);
    Ok(())
}

/// Length-prefixed string: int32 byte count including the trailing NUL,
/// the UTF-8 bytes, one NUL. Interior NUL bytes are legal here.
fn write_string(buf: &mut BytesMut, s: &str) {
    buf.put_i32_le(s.len() as i32 + 1);
    buf.put_slice(s.as_bytes());
    buf.put_u8(0x00);
}

fn write_value(buf: &mut BytesMut, value: &Value) -> Result<(), EncodeError> {
    match value {
        Value::Double(v) => buf.put_f64_le(*v),
        Value::String(s) => write_string(buf, s),
        Value::Document(d) => write_document(buf, d)?,
        Value::Array(a) => write_array(buf, a)?,
        Value::Binary(b) => {
            buf.put_i32_le(b.bytes.len() as i32);
            buf.put_u8(b.subtype.into());
            buf.put_slice(&b.bytes);
        }
        Value::ObjectId(oid) => buf.put_slice(&oid.bytes()),
        Value::Boolean(v) => buf.put_u8(u8::from(*v)),
        Value::DateTime(dt) => buf.put_i64_le(dt.timestamp_millis()),
        Value::Null => {}
        Value::Regex(r) => {
            write_regex_part(buf, &r.pattern, "pattern")?;
            write_regex_part(buf, &r.options, "options")?;
        }
        Value::JavaScriptCode(s) => write_string(buf, s),
        Value::JavaScriptCodeWithScope(c) => {
            let total = 4 + (4 + c.code.len() + 1) + document_len(&c.scope);
            buf.put_i32_le(total as i32);
            write_string(buf, &c.code);
            write_document(buf, &c.scope)?;
        }
        Value::Int32(v) => buf.put_i32_le(*v),
        Value::Timestamp(ts) => buf.put_u64_le(ts.to_u64()),
        Value::Int64(v) => buf.put_i64_le(*v),
        Value::MaxKey | Value::MinKey => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use crate::value::{Binary, BinarySubtype, Regex, RegexFlags};

    #[test]
    fn test_empty_document() {
        let doc = Document::new();
        let bytes = doc.encode().unwrap();
        assert_eq!(&bytes[..], &[5, 0, 0, 0, 0]);
        assert_eq!(doc.encoded_len(), 5);
    }

    #[test]
    fn test_int32_layout() {
        let doc = doc! { "a" => 1 };
        let bytes = doc.encode().unwrap();
        // len=12: 4 prefix + (tag + "a\0" + 4 payload) + terminator
        assert_eq!(
            &bytes[..],
            &[12, 0, 0, 0, 0x10, b'a', 0, 1, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_string_layout() {
        let doc = doc! { "s" => "hi" };
        let bytes = doc.encode().unwrap();
        assert_eq!(
            &bytes[..],
            &[15, 0, 0, 0, 0x02, b's', 0, 3, 0, 0, 0, b'h', b'i', 0, 0]
        );
    }

    #[test]
    fn test_length_prefix_matches_actual() {
        let doc = doc! {
            "str" => "value",
            "nested" => doc! { "deep" => vec![1, 2, 3] },
            "bin" => Binary::new(BinarySubtype::Generic, vec![9u8; 17]),
            "re" => Regex::new("^x", RegexFlags::new().with_multiline()),
        };
        let bytes = doc.encode().unwrap();
        let prefix = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(prefix as usize, bytes.len());
        assert_eq!(doc.encoded_len(), bytes.len());
    }

    #[test]
    fn test_array_keys_are_decimal_strings() {
        let doc = doc! { "a" => vec![10, 20] };
        let bytes = doc.encode().unwrap();
        // Array payload is itself a document with keys "0" and "1".
        let hay = &bytes[..];
        assert!(hay.windows(3).any(|w| w == [0x10, b'0', 0]));
        assert!(hay.windows(3).any(|w| w == [0x10, b'1', 0]));
    }

    #[test]
    fn test_key_with_nul_rejected() {
        let mut doc = Document::new();
        doc.insert("bad\0key", 1);
        let err = doc.encode().unwrap_err();
        assert!(matches!(err, EncodeError::KeyContainsNul(_)));
    }

    #[test]
    fn test_regex_with_nul_rejected() {
        let doc = doc! { "r" => Regex::with_options("a\0b", "") };
        let err = doc.encode().unwrap_err();
        assert!(matches!(
            err,
            EncodeError::RegexContainsNul { field: "pattern" }
        ));
    }

    #[test]
    fn test_string_with_interior_nul_allowed() {
        let doc = doc! { "s" => "a\0b" };
        let bytes = doc.encode().unwrap();
        let prefix = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(prefix as usize, bytes.len());
    }

    #[test]
    fn test_itoa_buf() {
        let mut scratch = [0u8; 20];
        assert_eq!(itoa_buf(0, &mut scratch), "0");
        let mut scratch = [0u8; 20];
        assert_eq!(itoa_buf(9, &mut scratch), "9");
        let mut scratch = [0u8; 20];
        assert_eq!(itoa_buf(1234, &mut scratch), "1234");
        assert_eq!(decimal_digits(0), 1);
        assert_eq!(decimal_digits(9), 1);
        assert_eq!(decimal_digits(10), 2);
        assert_eq!(decimal_digits(99_999), 5);
    }
}

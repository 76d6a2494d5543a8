//! Ordered document type.

use crate::decode;
use crate::encode;
use crate::error::{DecodeError, EncodeError};
use crate::oid::ObjectId;
use crate::value::{Binary, DateTime, Timestamp, Value};
use bytes::BytesMut;

/// An ordered mapping from string keys to [`Value`]s.
///
/// Insertion order is preserved and is part of the wire representation:
/// re-encoding a decoded document reproduces the original bytes. Keys are
/// unique; inserting an existing key replaces its value in place without
/// moving it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    entries: Vec<(String, Value)>,
}

impl Document {
    pub fn new() -> Self {
        Document {
            entries: Vec::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Document {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Inserts a key/value pair, returning the displaced value if the key
    /// was already present. An existing key keeps its position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        for (existing, slot) in &mut self.entries {
            if *existing == key {
                return Some(std::mem::replace(slot, value));
            }
        }
        self.entries.push((key, value));
        None
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    pub fn get_i32(&self, key: &str) -> Option<i32> {
        self.get(key).and_then(Value::as_i32)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    /// Integer value under `key`, whether it was sent as int32 or int64.
    pub fn get_integer(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_integer)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn get_document(&self, key: &str) -> Option<&Document> {
        self.get(key).and_then(Value::as_document)
    }

    pub fn get_array(&self, key: &str) -> Option<&[Value]> {
        self.get(key).and_then(Value::as_array)
    }

    pub fn get_binary(&self, key: &str) -> Option<&Binary> {
        self.get(key).and_then(Value::as_binary)
    }

    pub fn get_object_id(&self, key: &str) -> Option<ObjectId> {
        self.get(key).and_then(Value::as_object_id)
    }

    pub fn get_datetime(&self, key: &str) -> Option<DateTime> {
        self.get(key).and_then(Value::as_datetime)
    }

    pub fn get_timestamp(&self, key: &str) -> Option<Timestamp> {
        self.get(key).and_then(|v| match v {
            Value::Timestamp(ts) => Some(*ts),
            _ => None,
        })
    }

    /// The exact encoded size in bytes, including the length prefix and
    /// the trailing terminator.
    pub fn encoded_len(&self) -> usize {
        encode::document_len(self)
    }

    /// Encodes into a fresh buffer.
    pub fn encode(&self) -> Result<BytesMut, EncodeError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    /// Appends the encoded form to `buf`.
    pub fn write_to(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        encode::write_document(buf, self)
    }

    /// Decodes one document starting at `offset`, returning it together
    /// with the number of bytes consumed. Bytes past the document's
    /// declared length are left untouched.
    pub fn decode_at(buf: &[u8], offset: usize) -> Result<(Document, usize), DecodeError> {
        decode::decode_document_at(buf, offset)
    }

    /// Decodes a buffer that holds exactly one document; trailing bytes
    /// are an error.
    pub fn from_bytes(buf: &[u8]) -> Result<Document, DecodeError> {
        let (doc, consumed) = decode::decode_document_at(buf, 0)?;
        if consumed != buf.len() {
            return Err(DecodeError::TrailingBytes {
                consumed,
                len: buf.len(),
            });
        }
        Ok(doc)
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut doc = Document::new();
        for (key, value) in iter {
            doc.insert(key, value);
        }
        doc
    }
}

impl IntoIterator for Document {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a Document {
    type Item = (&'a String, &'a Value);
    type IntoIter = std::iter::Map<
        std::slice::Iter<'a, (String, Value)>,
        fn(&'a (String, Value)) -> (&'a String, &'a Value),
    >;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter().map(|(k, v)| (k, v))
    }
}

/// Indexing by key; missing keys yield [`Value::Null`].
impl std::ops::Index<&str> for Document {
    type Output = Value;

    fn index(&self, key: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.get(key).unwrap_or(&NULL)
    }
}

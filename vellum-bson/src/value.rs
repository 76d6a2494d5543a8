//! Document value model.
//!
//! Every element on the wire is a one-byte type tag, a NUL-terminated key,
//! and a tag-specific payload:
//!
//! ```text
//! +-----+---------------+------------------+
//! | tag | key (cstring) | payload (varies) |
//! +-----+---------------+------------------+
//! ```
//!
//! [`Value`] is the closed set of payload types and [`ElementType`] the tag
//! byte. Unknown tags are a decode error rather than an extension point, so
//! matches over [`Value`] stay exhaustive as the format evolves.

use crate::document::Document;
use crate::oid::ObjectId;
use crate::uuid_repr::{encode_uuid, UuidRepresentation};
use chrono::Utc;
use std::fmt;
use uuid::Uuid;

/// Element tag bytes as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ElementType {
    Double = 0x01,
    String = 0x02,
    Document = 0x03,
    Array = 0x04,
    Binary = 0x05,
    ObjectId = 0x07,
    Boolean = 0x08,
    DateTime = 0x09,
    Null = 0x0A,
    Regex = 0x0B,
    JavaScriptCode = 0x0D,
    JavaScriptCodeWithScope = 0x0F,
    Int32 = 0x10,
    Timestamp = 0x11,
    Int64 = 0x12,
    MaxKey = 0x7F,
    MinKey = 0xFF,
}

impl ElementType {
    /// Tags retired by earlier format revisions. They are rejected with a
    /// dedicated error so the caller can tell them apart from garbage.
    pub const DEPRECATED: [u8; 3] = [0x06, 0x0C, 0x0E];

    /// Maps a tag byte to its element type. Returns `None` for unknown and
    /// deprecated tags alike; consult [`ElementType::DEPRECATED`] to
    /// distinguish the two.
    pub fn from_u8(tag: u8) -> Option<ElementType> {
        match tag {
            0x01 => Some(ElementType::Double),
            0x02 => Some(ElementType::String),
            0x03 => Some(ElementType::Document),
            0x04 => Some(ElementType::Array),
            0x05 => Some(ElementType::Binary),
            0x07 => Some(ElementType::ObjectId),
            0x08 => Some(ElementType::Boolean),
            0x09 => Some(ElementType::DateTime),
            0x0A => Some(ElementType::Null),
            0x0B => Some(ElementType::Regex),
            0x0D => Some(ElementType::JavaScriptCode),
            0x0F => Some(ElementType::JavaScriptCodeWithScope),
            0x10 => Some(ElementType::Int32),
            0x11 => Some(ElementType::Timestamp),
            0x12 => Some(ElementType::Int64),
            0x7F => Some(ElementType::MaxKey),
            0xFF => Some(ElementType::MinKey),
            _ => None,
        }
    }
}

/// Binary element subtype byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinarySubtype {
    /// Plain bytes (0x00).
    Generic,
    /// Function (0x01).
    Function,
    /// Old-style binary (0x02). Decoded as raw payload bytes.
    BinaryOld,
    /// Legacy UUID (0x03), byte order per driver representation.
    UuidLegacy,
    /// RFC 4122 UUID (0x04).
    Uuid,
    /// MD5 digest (0x05).
    Md5,
    /// Application-defined subtypes (0x80..=0xFF).
    UserDefined(u8),
    /// Values reserved for future assignment (0x06..=0x7F).
    Reserved(u8),
}

impl From<u8> for BinarySubtype {
    fn from(byte: u8) -> Self {
        match byte {
            0x00 => BinarySubtype::Generic,
            0x01 => BinarySubtype::Function,
            0x02 => BinarySubtype::BinaryOld,
            0x03 => BinarySubtype::UuidLegacy,
            0x04 => BinarySubtype::Uuid,
            0x05 => BinarySubtype::Md5,
            0x80..=0xFF => BinarySubtype::UserDefined(byte),
            _ => BinarySubtype::Reserved(byte),
        }
    }
}

impl From<BinarySubtype> for u8 {
    fn from(subtype: BinarySubtype) -> Self {
        match subtype {
            BinarySubtype::Generic => 0x00,
            BinarySubtype::Function => 0x01,
            BinarySubtype::BinaryOld => 0x02,
            BinarySubtype::UuidLegacy => 0x03,
            BinarySubtype::Uuid => 0x04,
            BinarySubtype::Md5 => 0x05,
            BinarySubtype::UserDefined(byte) => byte,
            BinarySubtype::Reserved(byte) => byte,
        }
    }
}

/// Binary payload with its subtype byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binary {
    pub subtype: BinarySubtype,
    pub bytes: Vec<u8>,
}

impl Binary {
    pub fn new(subtype: BinarySubtype, bytes: Vec<u8>) -> Self {
        Binary { subtype, bytes }
    }

    /// Generic-subtype binary from raw bytes.
    pub fn generic(bytes: Vec<u8>) -> Self {
        Binary {
            subtype: BinarySubtype::Generic,
            bytes,
        }
    }
}

/// Regular expression option letters as a bitfield.
///
/// The wire carries options as a sorted ASCII string; this type maps the
/// recognized letters to bits. Unknown letters are dropped on parse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegexFlags(u8);

impl RegexFlags {
    /// `i`: case-insensitive matching.
    pub const CASE_INSENSITIVE: u8 = 1 << 0;
    /// `l`: treat the pattern as a literal string.
    pub const LITERAL: u8 = 1 << 1;
    /// `m`: multiline anchors.
    pub const MULTILINE: u8 = 1 << 2;
    /// `s`: dot matches newline.
    pub const DOT_ALL: u8 = 1 << 3;
    /// `u`: Unicode-aware case folding.
    pub const UNICODE_CASE: u8 = 1 << 4;

    pub fn new() -> Self {
        RegexFlags(0)
    }

    pub fn from_bits(bits: u8) -> Self {
        RegexFlags(bits & 0x1F)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn with_case_insensitive(mut self) -> Self {
        self.0 |= Self::CASE_INSENSITIVE;
        self
    }

    pub fn with_literal(mut self) -> Self {
        self.0 |= Self::LITERAL;
        self
    }

    pub fn with_multiline(mut self) -> Self {
        self.0 |= Self::MULTILINE;
        self
    }

    pub fn with_dot_all(mut self) -> Self {
        self.0 |= Self::DOT_ALL;
        self
    }

    pub fn with_unicode_case(mut self) -> Self {
        self.0 |= Self::UNICODE_CASE;
        self
    }

    pub fn has_case_insensitive(&self) -> bool {
        self.0 & Self::CASE_INSENSITIVE != 0
    }

    pub fn has_literal(&self) -> bool {
        self.0 & Self::LITERAL != 0
    }

    pub fn has_multiline(&self) -> bool {
        self.0 & Self::MULTILINE != 0
    }

    pub fn has_dot_all(&self) -> bool {
        self.0 & Self::DOT_ALL != 0
    }

    pub fn has_unicode_case(&self) -> bool {
        self.0 & Self::UNICODE_CASE != 0
    }

    /// Parses an option string. Letters outside the known set are ignored,
    /// never rejected, so option strings from newer peers still decode.
    pub fn from_letters(letters: &str) -> Self {
        let mut flags = RegexFlags(0);
        for letter in letters.chars() {
            match letter {
                'i' => flags.0 |= Self::CASE_INSENSITIVE,
                'l' => flags.0 |= Self::LITERAL,
                'm' => flags.0 |= Self::MULTILINE,
                's' => flags.0 |= Self::DOT_ALL,
                'u' => flags.0 |= Self::UNICODE_CASE,
                _ => {}
            }
        }
        flags
    }

    /// Canonical option string: recognized letters in alphabetical order.
    pub fn to_letters(&self) -> String {
        let mut letters = String::new();
        for (bit, letter) in [
            (Self::CASE_INSENSITIVE, 'i'),
            (Self::LITERAL, 'l'),
            (Self::MULTILINE, 'm'),
            (Self::DOT_ALL, 's'),
            (Self::UNICODE_CASE, 'u'),
        ] {
            if self.0 & bit != 0 {
                letters.push(letter);
            }
        }
        letters
    }
}

/// Regular expression pattern and option string.
///
/// Both parts travel as cstrings, so neither may contain a NUL byte. The
/// options are preserved verbatim on decode; [`Regex::flags`] interprets
/// the recognized letters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Regex {
    pub pattern: String,
    pub options: String,
}

impl Regex {
    /// Builds a regex with the canonical option string for `flags`.
    pub fn new(pattern: impl Into<String>, flags: RegexFlags) -> Self {
        Regex {
            pattern: pattern.into(),
            options: flags.to_letters(),
        }
    }

    /// Builds a regex with a raw option string, preserved as-is.
    pub fn with_options(pattern: impl Into<String>, options: impl Into<String>) -> Self {
        Regex {
            pattern: pattern.into(),
            options: options.into(),
        }
    }

    pub fn flags(&self) -> RegexFlags {
        RegexFlags::from_letters(&self.options)
    }
}

/// UTC datetime with millisecond precision, stored as a signed count of
/// milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DateTime(i64);

impl DateTime {
    /// The current instant, truncated to millisecond precision.
    pub fn now() -> Self {
        DateTime(Utc::now().timestamp_millis())
    }

    pub const fn from_millis(millis: i64) -> Self {
        DateTime(millis)
    }

    pub const fn timestamp_millis(&self) -> i64 {
        self.0
    }

    /// Converts to a [`chrono`] datetime, saturating at the chrono range
    /// limits for values it cannot represent.
    pub fn to_chrono(&self) -> chrono::DateTime<Utc> {
        match chrono::DateTime::from_timestamp_millis(self.0) {
            Some(dt) => dt,
            None if self.0 < 0 => chrono::DateTime::<Utc>::MIN_UTC,
            None => chrono::DateTime::<Utc>::MAX_UTC,
        }
    }

    /// Converts from a [`chrono`] datetime, truncating sub-millisecond
    /// precision.
    pub fn from_chrono(dt: chrono::DateTime<Utc>) -> Self {
        DateTime(dt.timestamp_millis())
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_chrono().to_rfc3339())
    }
}

impl From<chrono::DateTime<Utc>> for DateTime {
    fn from(dt: chrono::DateTime<Utc>) -> Self {
        DateTime::from_chrono(dt)
    }
}

/// Internal replication timestamp: a seconds value and an ordering
/// increment, packed as `(time << 32) | increment` on the wire.
///
/// Not a wall-clock type; use [`DateTime`] for those.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    pub time: u32,
    pub increment: u32,
}

impl Timestamp {
    pub(crate) fn to_u64(self) -> u64 {
        (u64::from(self.time) << 32) | u64::from(self.increment)
    }

    pub(crate) fn from_u64(packed: u64) -> Self {
        Timestamp {
            time: (packed >> 32) as u32,
            increment: packed as u32,
        }
    }
}

/// JavaScript code with a scope document of bound variables.
#[derive(Debug, Clone, PartialEq)]
pub struct JavaScriptCodeWithScope {
    pub code: String,
    pub scope: Document,
}

/// A single document value.
///
/// The set is closed: decoding never produces a variant outside this enum,
/// and unknown tag bytes fail with a decode error.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// 64-bit IEEE 754 float (tag 0x01).
    Double(f64),
    /// UTF-8 string (tag 0x02). May contain interior NUL bytes; the wire
    /// form is length-prefixed.
    String(String),
    /// Embedded document (tag 0x03).
    Document(Document),
    /// Array, encoded as a document with ascending decimal keys (tag 0x04).
    Array(Vec<Value>),
    /// Binary payload with subtype (tag 0x05).
    Binary(Binary),
    /// 12-byte object id (tag 0x07).
    ObjectId(ObjectId),
    /// Boolean, strictly 0x00 or 0x01 on the wire (tag 0x08).
    Boolean(bool),
    /// Milliseconds since the Unix epoch (tag 0x09).
    DateTime(DateTime),
    /// Null (tag 0x0A). Carries no payload.
    Null,
    /// Regular expression (tag 0x0B).
    Regex(Regex),
    /// JavaScript code without scope (tag 0x0D).
    JavaScriptCode(String),
    /// JavaScript code with scope (tag 0x0F).
    JavaScriptCodeWithScope(JavaScriptCodeWithScope),
    /// 32-bit signed integer (tag 0x10).
    Int32(i32),
    /// Internal timestamp (tag 0x11).
    Timestamp(Timestamp),
    /// 64-bit signed integer (tag 0x12).
    Int64(i64),
    /// Sorts after every other value (tag 0x7F).
    MaxKey,
    /// Sorts before every other value (tag 0xFF).
    MinKey,
}

impl Value {
    /// The wire tag this value encodes with.
    pub fn element_type(&self) -> ElementType {
        match self {
            Value::Double(_) => ElementType::Double,
            Value::String(_) => ElementType::String,
            Value::Document(_) => ElementType::Document,
            Value::Array(_) => ElementType::Array,
            Value::Binary(_) => ElementType::Binary,
            Value::ObjectId(_) => ElementType::ObjectId,
            Value::Boolean(_) => ElementType::Boolean,
            Value::DateTime(_) => ElementType::DateTime,
            Value::Null => ElementType::Null,
            Value::Regex(_) => ElementType::Regex,
            Value::JavaScriptCode(_) => ElementType::JavaScriptCode,
            Value::JavaScriptCodeWithScope(_) => ElementType::JavaScriptCodeWithScope,
            Value::Int32(_) => ElementType::Int32,
            Value::Timestamp(_) => ElementType::Timestamp,
            Value::Int64(_) => ElementType::Int64,
            Value::MaxKey => ElementType::MaxKey,
            Value::MinKey => ElementType::MinKey,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Document(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&Binary> {
        match self {
            Value::Binary(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_object_id(&self) -> Option<ObjectId> {
        match self {
            Value::ObjectId(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime> {
        match self {
            Value::DateTime(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Any integral value widened to `i64`.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Int32(v) => Some(i64::from(*v)),
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<Document> for Value {
    fn from(v: Document) -> Self {
        Value::Document(v)
    }
}

impl From<Binary> for Value {
    fn from(v: Binary) -> Self {
        Value::Binary(v)
    }
}

// Does not overlap the `Vec<T>` array conversion below: `u8` itself has
// no `Into<Value>`, so a byte vector only matches here.
impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Binary(Binary::generic(bytes))
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Binary(encode_uuid(v, UuidRepresentation::Standard))
    }
}

impl From<ObjectId> for Value {
    fn from(v: ObjectId) -> Self {
        Value::ObjectId(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<DateTime> for Value {
    fn from(v: DateTime) -> Self {
        Value::DateTime(v)
    }
}

impl From<Regex> for Value {
    fn from(v: Regex) -> Self {
        Value::Regex(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<Timestamp> for Value {
    fn from(v: Timestamp) -> Self {
        Value::Timestamp(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(values: Vec<T>) -> Self {
        Value::Array(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    #[test]
    fn test_element_type_round_trip() {
        for tag in 0x00..=0xFF_u16 {
            let tag = tag as u8;
            if let Some(et) = ElementType::from_u8(tag) {
                assert_eq!(et as u8, tag);
            }
        }
    }

    #[test]
    fn test_deprecated_tags_unmapped() {
        for tag in ElementType::DEPRECATED {
            assert!(ElementType::from_u8(tag).is_none());
        }
    }

    #[test]
    fn test_binary_subtype_round_trip() {
        for byte in 0x00..=0xFF_u16 {
            let byte = byte as u8;
            let subtype = BinarySubtype::from(byte);
            assert_eq!(u8::from(subtype), byte);
        }
        assert_eq!(BinarySubtype::from(0x04), BinarySubtype::Uuid);
        assert_eq!(BinarySubtype::from(0x80), BinarySubtype::UserDefined(0x80));
        assert_eq!(BinarySubtype::from(0x06), BinarySubtype::Reserved(0x06));
    }

    #[test]
    fn test_regex_flags_letters() {
        let flags = RegexFlags::new().with_multiline().with_case_insensitive();
        assert_eq!(flags.to_letters(), "im");
        assert!(flags.has_case_insensitive());
        assert!(flags.has_multiline());
        assert!(!flags.has_dot_all());

        let parsed = RegexFlags::from_letters("sqi");
        assert!(parsed.has_case_insensitive());
        assert!(parsed.has_dot_all());
        assert_eq!(parsed.to_letters(), "is");
    }

    #[test]
    fn test_regex_canonical_options() {
        let re = Regex::new("^a.*b$", RegexFlags::new().with_dot_all().with_case_insensitive());
        assert_eq!(re.options, "is");
        assert_eq!(re.flags().bits(), RegexFlags::from_letters("is").bits());
    }

    #[test]
    fn test_timestamp_packing() {
        let ts = Timestamp {
            time: 0x1122_3344,
            increment: 0x5566_7788,
        };
        assert_eq!(ts.to_u64(), 0x1122_3344_5566_7788);
        assert_eq!(Timestamp::from_u64(ts.to_u64()), ts);
    }

    #[test]
    fn test_datetime_chrono_round_trip() {
        let dt = DateTime::from_millis(1_700_000_000_123);
        assert_eq!(DateTime::from_chrono(dt.to_chrono()), dt);
        assert_eq!(dt.timestamp_millis(), 1_700_000_000_123);
    }

    #[test]
    fn test_datetime_saturates_out_of_range() {
        let far = DateTime::from_millis(i64::MAX);
        assert_eq!(far.to_chrono(), chrono::DateTime::<Utc>::MAX_UTC);
        let past = DateTime::from_millis(i64::MIN);
        assert_eq!(past.to_chrono(), chrono::DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from(3), Value::Int32(3));
        assert_eq!(Value::from(3_i64), Value::Int64(3));
        assert_eq!(Value::from("x"), Value::String("x".to_string()));
        assert_eq!(Value::from(vec![1, 2]).as_array().map(<[Value]>::len), Some(2));
        assert_eq!(Value::from(None::<i32>), Value::Null);
        assert_eq!(Value::from(Some(5)), Value::Int32(5));
        assert_eq!(
            Value::from(vec![0xDE_u8, 0xAD]),
            Value::Binary(Binary::generic(vec![0xDE, 0xAD]))
        );
    }

    #[test]
    fn test_byte_vector_builds_generic_binary() {
        let doc = doc! { "payload" => vec![1_u8, 2, 3] };
        assert_eq!(
            doc.get_binary("payload"),
            Some(&Binary::generic(vec![1, 2, 3]))
        );
        // Non-byte vectors still build arrays.
        let doc = doc! { "scores" => vec![1, 2, 3] };
        assert!(doc.get_array("scores").is_some());
    }

    #[test]
    fn test_uuid_builds_standard_binary() {
        let uuid = Uuid::parse_str("00112233-4455-6677-8899-aabbccddeeff").unwrap();
        let doc = doc! { "session" => uuid };
        let binary = doc.get_binary("session").unwrap();
        assert_eq!(binary.subtype, BinarySubtype::Uuid);
        assert_eq!(binary.bytes, uuid.as_bytes());
    }

    #[test]
    fn test_integer_widening() {
        assert_eq!(Value::Int32(7).as_integer(), Some(7));
        assert_eq!(Value::Int64(-9).as_integer(), Some(-9));
        assert_eq!(Value::Double(7.0).as_integer(), None);
    }
}

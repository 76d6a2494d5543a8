//! Relaxed JSON rendering.
//!
//! A lossy-but-readable JSON projection used for logging, `Display`, and
//! the CLI. Types JSON cannot carry natively are wrapped in single-key
//! objects (`$oid`, `$date`, `$binary`, ...). Key order inside rendered
//! objects follows `serde_json`'s map, not document order; this is a
//! diagnostic view, not a wire format.

use crate::document::Document;
use crate::oid::ObjectId;
use crate::value::{Binary, DateTime, Value};
use serde_json::{json, Map, Number, Value as Json};
use std::fmt;

impl Value {
    /// Renders into [`serde_json::Value`].
    pub fn to_relaxed_json(&self) -> Json {
        match self {
            Value::Double(v) => match Number::from_f64(*v) {
                Some(n) => Json::Number(n),
                // NaN and infinities have no JSON number form.
                None => Json::String(format!("{v}")),
            },
            Value::String(s) => Json::String(s.clone()),
            Value::Document(d) => d.to_relaxed_json(),
            Value::Array(a) => Json::Array(a.iter().map(Value::to_relaxed_json).collect()),
            Value::Binary(b) => json!({
                "$binary": hex::encode(&b.bytes),
                "$subtype": u8::from(b.subtype),
            }),
            Value::ObjectId(oid) => json!({ "$oid": oid.to_hex() }),
            Value::Boolean(v) => Json::Bool(*v),
            Value::DateTime(dt) => json!({ "$date": dt.to_chrono().to_rfc3339() }),
            Value::Null => Json::Null,
            Value::Regex(r) => json!({ "$regex": r.pattern, "$options": r.options }),
            Value::JavaScriptCode(code) => json!({ "$code": code }),
            Value::JavaScriptCodeWithScope(c) => json!({
                "$code": c.code,
                "$scope": c.scope.to_relaxed_json(),
            }),
            Value::Int32(v) => Json::Number((*v).into()),
            Value::Int64(v) => Json::Number((*v).into()),
            Value::Timestamp(ts) => json!({
                "$timestamp": { "t": ts.time, "i": ts.increment }
            }),
            Value::MaxKey => json!({ "$maxKey": 1 }),
            Value::MinKey => json!({ "$minKey": 1 }),
        }
    }

    /// Builds a value from JSON. Recognized wrapper objects (`$oid`,
    /// `$date`) become their typed forms; anything else maps
    /// structurally. Integers that fit in 32 bits become [`Value::Int32`].
    pub fn from_relaxed_json(json: &Json) -> Value {
        match json {
            Json::Null => Value::Null,
            Json::Bool(v) => Value::Boolean(*v),
            Json::Number(n) => {
                if let Some(v) = n.as_i64() {
                    match i32::try_from(v) {
                        Ok(small) => Value::Int32(small),
                        Err(_) => Value::Int64(v),
                    }
                } else if let Some(v) = n.as_u64() {
                    Value::Double(v as f64)
                } else {
                    Value::Double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Json::String(s) => Value::String(s.clone()),
            Json::Array(items) => {
                Value::Array(items.iter().map(Value::from_relaxed_json).collect())
            }
            Json::Object(map) => from_json_object(map),
        }
    }
}

fn from_json_object(map: &Map<String, Json>) -> Value {
    if map.len() == 1 {
        if let Some(Json::String(hex)) = map.get("$oid") {
            if let Ok(oid) = ObjectId::parse_str(hex) {
                return Value::ObjectId(oid);
            }
        }
        if let Some(Json::String(text)) = map.get("$date") {
            if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(text) {
                return Value::DateTime(DateTime::from_chrono(dt.with_timezone(&chrono::Utc)));
            }
        }
    }
    if map.len() == 2 {
        if let (Some(Json::String(bytes)), Some(subtype)) =
            (map.get("$binary"), map.get("$subtype"))
        {
            if let (Ok(bytes), Some(subtype)) = (hex::decode(bytes), subtype.as_u64()) {
                return Value::Binary(Binary::new((subtype as u8).into(), bytes));
            }
        }
    }
    Value::Document(
        map.iter()
            .map(|(k, v)| (k.clone(), Value::from_relaxed_json(v)))
            .collect(),
    )
}

impl Document {
    pub fn to_relaxed_json(&self) -> Json {
        let mut map = Map::with_capacity(self.len());
        for (key, value) in self.iter() {
            map.insert(key.to_string(), value.to_relaxed_json());
        }
        Json::Object(map)
    }

    /// Builds a document from a JSON object; `None` for any other JSON
    /// type.
    pub fn from_relaxed_json(json: &Json) -> Option<Document> {
        match Value::from_relaxed_json(json) {
            Value::Document(doc) => Some(doc),
            _ => None,
        }
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_relaxed_json())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_relaxed_json())
    }
}

//! Decoded binary-object values

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use smol_str::SmolStr;

use crate::cid::Cid;

/// Map key: the decoder only admits strings and integers in key position
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MapKey {
    /// Integer key
    Integer(i128),
    /// Text key
    String(SmolStr),
}

impl MapKey {
    /// The key as text, if it is a string key
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MapKey::String(s) => Some(s.as_str()),
            MapKey::Integer(_) => None,
        }
    }
}

impl From<&str> for MapKey {
    fn from(s: &str) -> Self {
        MapKey::String(SmolStr::new(s))
    }
}

impl From<i64> for MapKey {
    fn from(i: i64) -> Self {
        MapKey::Integer(i128::from(i))
    }
}

/// A decoded item
///
/// Integers are widened to `i128` because a major-type-1 item can encode
/// values down to `-2^64`. Tagged items other than links are unwrapped, so
/// tags never appear in the tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `null` (and `undefined`)
    Null,
    /// `true` / `false`
    Bool(bool),
    /// Unsigned or negative integer
    Integer(i128),
    /// Half, single or double precision float, widened
    Float(f64),
    /// Byte string
    Bytes(Bytes),
    /// UTF-8 text string
    String(SmolStr),
    /// Array of items
    Array(Vec<Value>),
    /// Map with string or integer keys
    Map(BTreeMap<MapKey, Value>),
    /// Tag 42 content identifier
    Link(Cid),
}

impl Value {
    /// Short name of the value's kind, for error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Bytes(_) => "bytes",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Link(_) => "link",
        }
    }

    /// Look up a string key in a map value
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(map) => map.get(&MapKey::from(key)),
            _ => None,
        }
    }

    /// Whether the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Boolean content
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer content, if it fits in an `i64`
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => i64::try_from(*i).ok(),
            _ => None,
        }
    }

    /// Float content
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Text content
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Byte string content
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Array content
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Map content
    pub fn as_map(&self) -> Option<&BTreeMap<MapKey, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Link content
    pub fn as_link(&self) -> Option<&Cid> {
        match self {
            Value::Link(cid) => Some(cid),
            _ => None,
        }
    }

    /// Project into the atproto JSON data model
    ///
    /// Links become `{"$link": "<cid>"}` and byte strings become
    /// `{"$bytes": "<base64>"}`, recursively. Integer map keys are written as
    /// their decimal text. Non-finite floats and integers outside the JSON
    /// number range become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;

        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Integer(i) => {
                if let Ok(i) = i64::try_from(*i) {
                    Json::from(i)
                } else if let Ok(u) = u64::try_from(*i) {
                    Json::from(u)
                } else {
                    Json::Null
                }
            }
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Bytes(b) => {
                let mut obj = serde_json::Map::with_capacity(1);
                obj.insert("$bytes".into(), Json::String(STANDARD.encode(b)));
                Json::Object(obj)
            }
            Value::String(s) => Json::String(s.to_string()),
            Value::Array(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => Json::Object(
                map.iter()
                    .map(|(key, value)| {
                        let key = match key {
                            MapKey::String(s) => s.to_string(),
                            MapKey::Integer(i) => i.to_string(),
                        };
                        (key, value.to_json())
                    })
                    .collect(),
            ),
            Value::Link(cid) => {
                let mut obj = serde_json::Map::with_capacity(1);
                obj.insert("$link".into(), Json::String(cid.to_string()));
                Json::Object(obj)
            }
        }
    }
}

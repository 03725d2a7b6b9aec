//! Payload codec
//!
//! Converts application values to and from the tagged wire tree carried in
//! envelope payloads. Every node of the tree is a single-key JSON object whose
//! key names the type (`{"i4": 7}`, `{"array": [...]}`), so the tree can be
//! handed to any transport as opaque JSON.

use crate::error::CodecError;
use crate::resource::ResourcePath;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use std::collections::BTreeMap;
use std::fmt;

/// Wire form of a [`Value`]
pub type WireTree = serde_json::Value;

const TAG_NIL: &str = "nil";
const TAG_BOOLEAN: &str = "boolean";
const TAG_I4: &str = "i4";
const TAG_INT: &str = "int";
const TAG_I8: &str = "i8";
const TAG_DOUBLE: &str = "double";
const TAG_STRING: &str = "string";
const TAG_BASE64: &str = "base64";
const TAG_DATETIME: &str = "dateTime.iso8601";
const TAG_ARRAY: &str = "array";
const TAG_STRUCT: &str = "struct";
const TAG_RESOURCE: &str = "resource";
const TAG_FAULT: &str = "fault";

/// Error marshalled across the wire: class name, message and backtrace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub class: String,
    pub message: String,
    #[serde(default)]
    pub backtrace: Vec<String>,
}

impl Fault {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
            backtrace: Vec::new(),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

/// Dynamically typed application value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    DateTime(DateTime<Utc>),
    List(Vec<Value>),
    Struct(BTreeMap<String, Value>),
    Resource(ResourcePath),
    Fault(Fault),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Struct(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_resource(&self) -> Option<&ResourcePath> {
        match self {
            Value::Resource(path) => Some(path),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Resource paths held by this value, directly or inside a list.
    pub fn resources(&self) -> Vec<ResourcePath> {
        match self {
            Value::Resource(path) => vec![path.clone()],
            Value::List(items) => items.iter().flat_map(Value::resources).collect(),
            _ => Vec::new(),
        }
    }

    /// Spread a list into its items; any other value becomes a one-item list.
    pub fn into_items(self) -> Vec<Value> {
        match self {
            Value::List(items) => items,
            Value::Nil => Vec::new(),
            other => vec![other],
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value as i64)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<ResourcePath> for Value {
    fn from(value: ResourcePath) -> Self {
        Value::Resource(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<Fault> for Value {
    fn from(value: Fault) -> Self {
        Value::Fault(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::DateTime(value)
    }
}

/// Encoder/decoder for the tagged wire tree
#[derive(Debug, Clone, Copy, Default)]
pub struct Codec {
    /// Allow the `i8` tag for integers outside the 32-bit range
    pub wide_integers: bool,
}

impl Codec {
    pub fn new(wide_integers: bool) -> Self {
        Self { wide_integers }
    }

    pub fn encode(&self, value: &Value) -> Result<WireTree, CodecError> {
        let tree = match value {
            Value::Nil => json!({ TAG_NIL: null }),
            Value::Bool(b) => json!({ TAG_BOOLEAN: b }),
            Value::Int(i) => {
                if i32::try_from(*i).is_ok() {
                    json!({ TAG_I4: i })
                } else if self.wide_integers {
                    json!({ TAG_I8: i.to_string() })
                } else {
                    return Err(CodecError::Encoding(format!(
                        "integer {} exceeds the 32-bit signed range",
                        i
                    )));
                }
            }
            Value::Float(f) => {
                if !f.is_finite() {
                    return Err(CodecError::Encoding(format!(
                        "non-finite double {}",
                        f
                    )));
                }
                json!({ TAG_DOUBLE: f })
            }
            Value::String(s) => json!({ TAG_STRING: s }),
            Value::Bytes(bytes) => json!({ TAG_BASE64: STANDARD.encode(bytes) }),
            Value::DateTime(dt) => {
                json!({ TAG_DATETIME: dt.to_rfc3339_opts(SecondsFormat::Secs, true) })
            }
            Value::List(items) => {
                let encoded = items
                    .iter()
                    .map(|item| self.encode(item))
                    .collect::<Result<Vec<_>, _>>()?;
                json!({ TAG_ARRAY: encoded })
            }
            Value::Struct(map) => {
                let mut encoded = Map::new();
                for (key, item) in map {
                    encoded.insert(key.clone(), self.encode(item)?);
                }
                json!({ TAG_STRUCT: encoded })
            }
            Value::Resource(path) => json!({ TAG_RESOURCE: path.to_string() }),
            Value::Fault(fault) => json!({
                TAG_FAULT: {
                    "class": fault.class,
                    "message": fault.message,
                    "backtrace": fault.backtrace,
                }
            }),
        };
        Ok(tree)
    }

    pub fn decode(&self, tree: &WireTree) -> Result<Value, CodecError> {
        let object = tree
            .as_object()
            .filter(|object| object.len() == 1)
            .ok_or_else(|| {
                CodecError::Format(format!("expected a single-key tagged node, got {}", tree))
            })?;
        let Some((tag, body)) = object.iter().next() else {
            return Err(CodecError::Format("empty node".to_string()));
        };

        match tag.as_str() {
            TAG_NIL => Ok(Value::Nil),
            TAG_BOOLEAN => body
                .as_bool()
                .map(Value::Bool)
                .ok_or_else(|| malformed(tag, body)),
            TAG_I4 | TAG_INT => {
                let i = body.as_i64().ok_or_else(|| malformed(tag, body))?;
                i32::try_from(i)
                    .map(|narrow| Value::Int(narrow as i64))
                    .map_err(|_| CodecError::Format(format!("{} out of range for {}", i, tag)))
            }
            TAG_I8 => {
                let parsed = match body {
                    serde_json::Value::String(s) => s.parse::<i64>().ok(),
                    other => other.as_i64(),
                };
                parsed.map(Value::Int).ok_or_else(|| malformed(tag, body))
            }
            TAG_DOUBLE => body
                .as_f64()
                .map(Value::Float)
                .ok_or_else(|| malformed(tag, body)),
            TAG_STRING => body
                .as_str()
                .map(Value::from)
                .ok_or_else(|| malformed(tag, body)),
            TAG_BASE64 => {
                let text = body.as_str().ok_or_else(|| malformed(tag, body))?;
                STANDARD
                    .decode(text)
                    .map(Value::Bytes)
                    .map_err(|e| CodecError::Format(format!("invalid base64: {}", e)))
            }
            TAG_DATETIME => {
                let text = body.as_str().ok_or_else(|| malformed(tag, body))?;
                parse_datetime(text).map(Value::DateTime)
            }
            TAG_ARRAY => {
                let items = body.as_array().ok_or_else(|| malformed(tag, body))?;
                items
                    .iter()
                    .map(|item| self.decode(item))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::List)
            }
            TAG_STRUCT => {
                let fields = body.as_object().ok_or_else(|| malformed(tag, body))?;
                let mut map = BTreeMap::new();
                for (key, item) in fields {
                    map.insert(key.clone(), self.decode(item)?);
                }
                Ok(Value::Struct(map))
            }
            TAG_RESOURCE => {
                let text = body.as_str().ok_or_else(|| malformed(tag, body))?;
                Ok(Value::Resource(ResourcePath::parse(text)?))
            }
            TAG_FAULT => serde_json::from_value::<Fault>(body.clone())
                .map(Value::Fault)
                .map_err(|e| CodecError::Format(format!("invalid fault: {}", e))),
            other => Err(CodecError::UnknownType(other.to_string())),
        }
    }

    /// Encode a string-keyed argument map as a `struct` node.
    pub fn encode_struct(&self, map: &BTreeMap<String, Value>) -> Result<WireTree, CodecError> {
        self.encode(&Value::Struct(map.clone()))
    }

    /// Decode a node that must be a `struct`.
    pub fn decode_struct(&self, tree: &WireTree) -> Result<BTreeMap<String, Value>, CodecError> {
        match self.decode(tree)? {
            Value::Struct(map) => Ok(map),
            other => Err(CodecError::Format(format!("expected struct, got {:?}", other))),
        }
    }
}

fn malformed(tag: &str, body: &WireTree) -> CodecError {
    CodecError::Format(format!("malformed {} body: {}", tag, body))
}

/// Two-digit years below this pivot belong to the 2000s.
const YEAR_PIVOT: i32 = 70;

/// Parse an ISO-8601 date-time.
///
/// Accepts RFC 3339 (`2024-01-02T03:04:05Z`, any offset) and the compact
/// forms `YYYYMMDDTHH:MM:SS` / `YYMMDDTHH:MM:SS`, with or without date dashes.
/// Forms without an offset are read as UTC.
pub fn parse_datetime(text: &str) -> Result<DateTime<Utc>, CodecError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }

    let bad = || CodecError::Format(format!("invalid date-time '{}'", text));
    let (date, time) = text.split_once('T').ok_or_else(bad)?;
    let time = time.strip_suffix('Z').unwrap_or(time);

    let date: String = date.chars().filter(|c| *c != '-').collect();
    if !date.chars().all(|c| c.is_ascii_digit()) {
        return Err(bad());
    }
    let (year, rest) = match date.len() {
        8 => (date[..4].parse::<i32>().map_err(|_| bad())?, &date[4..]),
        6 => {
            let short = date[..2].parse::<i32>().map_err(|_| bad())?;
            let year = if short < YEAR_PIVOT { 2000 + short } else { 1900 + short };
            (year, &date[2..])
        }
        _ => return Err(bad()),
    };
    let month = rest[..2].parse::<u32>().map_err(|_| bad())?;
    let day = rest[2..].parse::<u32>().map_err(|_| bad())?;

    let time: String = time.chars().filter(|c| *c != ':').collect();
    if time.len() != 6 || !time.chars().all(|c| c.is_ascii_digit()) {
        return Err(bad());
    }
    let hour = time[..2].parse::<u32>().map_err(|_| bad())?;
    let minute = time[2..4].parse::<u32>().map_err(|_| bad())?;
    let second = time[4..].parse::<u32>().map_err(|_| bad())?;

    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, second))
        .map(|naive| naive.and_utc())
        .ok_or_else(bad)
}

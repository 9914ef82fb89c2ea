//! # Wire Protocol
//!
//! Bases forward a stream of JSON objects, one per node message. Every object is a
//! flat, case-insensitive field map:
//!
//! ```text
//! {"from": 5, "to": 0, "type": "publish", "serviceId": 2, "temperature": 21.5}
//! ```
//!
//! - `from` / `to` are node addresses (0 is the Base itself).
//! - `type` is one of `publish`, `set`, `request`, `err`.
//! - `serviceId`, `dataType` and `count` are structural metatypes; every other
//!   recognised field name is a physical-quantity channel.
//!
//! This module owns the [`Message`] representation, the datatype catalogue and the
//! scalar value kinds stored in the state tree. Validation lives in [`validate`] and
//! the incremental stream framer in [`framer`].

pub mod framer;
pub mod validate;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use validate::ValidationError;

/// Address of the Base on every node network.
pub const BASE_ADDR: u8 = 0;
/// Service id of the read-only service manager every node exposes.
pub const SERVICE_MANAGER_ID: u8 = 0;

// Normalised (lower-cased) names of the structural fields.
pub const FIELD_FROM: &str = "from";
pub const FIELD_TO: &str = "to";
pub const FIELD_TYPE: &str = "type";
pub const FIELD_SERVICE_ID: &str = "serviceid";
pub const FIELD_DATA_TYPE: &str = "datatype";
pub const FIELD_COUNT: &str = "count";
pub const FIELD_ERROR: &str = "error";

/// Fields that address a message rather than carry a value.
pub const ENVELOPE_FIELDS: [&str; 3] = [FIELD_FROM, FIELD_TO, FIELD_TYPE];

/// JSON kind a datatype's values must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasicKind {
    Float,
    Int,
    Bool,
    Text,
}

/// One entry of the datatype catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataTypeInfo {
    pub name: &'static str,
    pub id: u8,
    pub kind: BasicKind,
}

impl DataTypeInfo {
    /// Normalised key used in messages and in the state tree.
    pub fn key(&self) -> String {
        self.name.to_ascii_lowercase()
    }
}

const fn dt(name: &'static str, id: u8, kind: BasicKind) -> DataTypeInfo {
    DataTypeInfo { name, id, kind }
}

pub static KNOWN_DATATYPES: &[DataTypeInfo] = &[
    // Metatypes
    dt("dataType", 0, BasicKind::Text),
    dt("serviceId", 1, BasicKind::Int),
    dt("message", 2, BasicKind::Text),
    dt("expression", 3, BasicKind::Text),
    // ISO-defined physical dimensions
    dt("acceleration", 20, BasicKind::Float),
    dt("amount", 21, BasicKind::Float),
    dt("angle", 22, BasicKind::Float),
    dt("angularVelocity", 23, BasicKind::Float),
    dt("area", 24, BasicKind::Float),
    dt("radioactivity", 25, BasicKind::Float),
    dt("electricalCapacitance", 26, BasicKind::Float),
    dt("electricalResistance", 27, BasicKind::Float),
    dt("electricCurrent", 28, BasicKind::Float),
    dt("energy", 29, BasicKind::Float),
    dt("force", 30, BasicKind::Float),
    dt("frequency", 31, BasicKind::Float),
    dt("illuminance", 32, BasicKind::Float),
    dt("inductance", 33, BasicKind::Float),
    dt("length", 34, BasicKind::Float),
    dt("luminousFlux", 35, BasicKind::Float),
    dt("luminousIntensity", 36, BasicKind::Float),
    dt("magneticFieldStrength", 37, BasicKind::Float),
    dt("mass", 38, BasicKind::Float),
    dt("power", 39, BasicKind::Float),
    dt("pressure", 40, BasicKind::Float),
    dt("relativeHumidity", 41, BasicKind::Float),
    dt("speed", 42, BasicKind::Float),
    dt("temperature", 43, BasicKind::Float),
    dt("time", 44, BasicKind::Float),
    dt("voltage", 45, BasicKind::Float),
    dt("volume", 46, BasicKind::Float),
    // Other common types
    dt("count", 50, BasicKind::Int),
    dt("presence", 51, BasicKind::Bool),
    dt("switch", 52, BasicKind::Bool),
];

/// Case-insensitive catalogue lookup.
pub fn lookup_datatype(name: &str) -> Option<&'static DataTypeInfo> {
    KNOWN_DATATYPES
        .iter()
        .find(|info| info.name.eq_ignore_ascii_case(name))
}

pub fn datatype_by_id(id: u8) -> Option<&'static DataTypeInfo> {
    KNOWN_DATATYPES.iter().find(|info| info.id == id)
}

/// Spelling used when a field is written back to the wire.
pub fn wire_name(key: &str) -> &str {
    match lookup_datatype(key) {
        Some(info) => info.name,
        None => key,
    }
}

/// Message kinds carried in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Publish,
    Set,
    Request,
    Error,
}

impl MessageType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "publish" => Some(MessageType::Publish),
            "set" => Some(MessageType::Set),
            "request" => Some(MessageType::Request),
            "err" | "error" => Some(MessageType::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Publish => "publish",
            MessageType::Set => "set",
            MessageType::Request => "request",
            MessageType::Error => "err",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse an address field the way nodes write them: an integer or a numeric string.
pub fn parse_addr(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Coerce a field value to its list form: lists stay lists, anything else becomes a
/// one-element list.
pub fn value_list(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}

/// A node message with normalised (lower-cased) field names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    fields: BTreeMap<String, Value>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one framed object. Anything but a JSON object is rejected.
    pub fn from_json_str(raw: &str) -> Result<Self, ValidationError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| ValidationError::Syntax(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        match value {
            Value::Object(map) => {
                let mut msg = Message::new();
                for (key, val) in map {
                    msg.insert(&key, val);
                }
                Ok(msg)
            }
            _ => Err(ValidationError::NotAnObject),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(&name.to_ascii_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn insert(&mut self, name: &str, value: impl Into<Value>) {
        self.fields.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(&name.to_ascii_lowercase())
    }

    /// Iterate `(normalised name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// List form of a field, if present.
    pub fn value_list(&self, name: &str) -> Option<Vec<Value>> {
        self.get(name).map(value_list)
    }

    /// Kind declared by `type`; a bare `error` field (sent by Bases) counts as an error.
    pub fn message_type(&self) -> Option<MessageType> {
        match self.get(FIELD_TYPE) {
            Some(Value::String(s)) => MessageType::parse(s),
            Some(_) => None,
            None if self.contains(FIELD_ERROR) => Some(MessageType::Error),
            None => None,
        }
    }

    fn addr_field(&self, name: &str) -> Option<u8> {
        self.get(name)
            .and_then(parse_addr)
            .and_then(|a| u8::try_from(a).ok())
    }

    pub fn from_addr(&self) -> Option<u8> {
        self.addr_field(FIELD_FROM)
    }

    pub fn to_addr(&self) -> Option<u8> {
        self.addr_field(FIELD_TO)
    }

    /// Service ids in message order; the first one is the addressed service.
    pub fn service_ids(&self) -> Vec<u8> {
        self.value_list(FIELD_SERVICE_ID)
            .unwrap_or_default()
            .iter()
            .filter_map(|v| v.as_u64().and_then(|id| u8::try_from(id).ok()))
            .collect()
    }

    pub fn main_service_id(&self) -> Option<u8> {
        self.service_ids().first().copied()
    }

    /// Render with wire spelling for known field names.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (key, value) in &self.fields {
            map.insert(wire_name(key).to_string(), value.clone());
        }
        Value::Object(map)
    }

    pub fn to_json_string(&self) -> String {
        self.to_json().to_string()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json_string())
    }
}

/// One channel value as held in the state tree and persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    /// Convert a JSON scalar. Lists and objects have no scalar form.
    pub fn from_json(value: &Value) -> Option<Scalar> {
        match value {
            Value::Null => Some(Scalar::Null),
            Value::Bool(b) => Some(Scalar::Bool(*b)),
            Value::Number(n) => Some(match n.as_i64() {
                Some(i) => Scalar::Int(i),
                None => Scalar::Float(n.as_f64().unwrap_or(f64::NAN)),
            }),
            Value::String(s) => Some(Scalar::Text(s.clone())),
            Value::Array(_) | Value::Object(_) => None,
        }
    }

    /// Like [`Scalar::from_json`], keeping nested values of unknown fields as text.
    pub fn from_json_lossy(value: &Value) -> Scalar {
        Self::from_json(value).unwrap_or_else(|| Scalar::Text(value.to_string()))
    }

    pub fn to_json(&self) -> Value {
        match self {
            Scalar::Null => Value::Null,
            Scalar::Bool(b) => Value::Bool(*b),
            Scalar::Int(i) => Value::from(*i),
            Scalar::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Scalar::Text(s) => Value::String(s.clone()),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Scalar::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    /// Equality by value: `21` and `21.0` are the same reading.
    pub fn same_value(&self, other: &Scalar) -> bool {
        match (self, other) {
            (Scalar::Int(i), Scalar::Float(f)) | (Scalar::Float(f), Scalar::Int(i)) => {
                *i as f64 == *f
            }
            _ => self == other,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

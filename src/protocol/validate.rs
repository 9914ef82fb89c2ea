//! Stateless structural and type validation, one entry point per message
//! direction and kind.
//!
//! Nothing in the state tracker may assume anything about a message that has not
//! been checked here first. Unknown field names are logged and accepted so that
//! newer nodes keep working against an older server.

use log::warn;
use serde_json::Value;

use super::{
    lookup_datatype, parse_addr, value_list, BasicKind, Message, MessageType, BASE_ADDR,
    ENVELOPE_FIELDS, FIELD_COUNT, FIELD_DATA_TYPE, FIELD_ERROR, FIELD_FROM, FIELD_SERVICE_ID,
    FIELD_TO, FIELD_TYPE,
};

/// Structural or type problem with a message. Never sent to the network.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("malformed JSON: {0}")]
    Syntax(String),

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("message has no type")]
    NoType,

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("message type '{0}' is not allowed here")]
    UnexpectedType(MessageType),

    #[error("message is missing a '{0}' field")]
    MissingField(&'static str),

    #[error("'{value}' can't be parsed as an address")]
    BadAddress { value: String },

    #[error("'{value}' is not a valid node address")]
    NotNodeAddress { value: String },

    #[error("'{value}' is not a valid Base address")]
    NotBaseAddress { value: String },

    #[error("'{field}' value list is empty")]
    EmptyValueList { field: String },

    #[error("some values don't match the '{field}' type")]
    TypeMismatch { field: String },

    #[error("'{field}' can't be negative")]
    Negative { field: String },

    #[error("'{field}' must be between 0 and 255")]
    OutOfRange { field: String },

    #[error("service ID list contains duplicates")]
    DuplicateServiceIds,

    #[error("too many service IDs")]
    TooManyServiceIds,

    #[error("too many 'count' elements: {0}")]
    TooManyCounts(usize),

    #[error("invalid number of published types: {0}")]
    InvalidPublishCount(i64),

    #[error("invalid total number of types: {0}")]
    InvalidTotalCount(i64),
}

type Result<T> = std::result::Result<T, ValidationError>;

/// Validate a message received from a Base and return its kind.
pub fn validate_incoming(msg: &Message) -> Result<MessageType> {
    let kind = classify(msg)?;
    match kind {
        MessageType::Publish => validate_incoming_publish(msg)?,
        MessageType::Request => validate_incoming_request(msg)?,
        MessageType::Set => validate_incoming_set(msg)?,
        MessageType::Error => validate_incoming_error(msg)?,
    }
    Ok(kind)
}

/// Validate a message about to be sent to a node and return its kind.
pub fn validate_outgoing(msg: &Message) -> Result<MessageType> {
    let kind = match msg.get(FIELD_TYPE) {
        None => return Err(ValidationError::NoType),
        Some(_) => classify(msg)?,
    };
    match kind {
        MessageType::Request => validate_outgoing_request(msg)?,
        MessageType::Set => validate_outgoing_set(msg)?,
        other => return Err(ValidationError::UnexpectedType(other)),
    }
    Ok(kind)
}

fn classify(msg: &Message) -> Result<MessageType> {
    match msg.get(FIELD_TYPE) {
        Some(Value::String(s)) => {
            MessageType::parse(s).ok_or_else(|| ValidationError::UnknownType(s.clone()))
        }
        Some(other) => Err(ValidationError::UnknownType(other.to_string())),
        None if msg.contains(FIELD_ERROR) => Ok(MessageType::Error),
        None => Err(ValidationError::NoType),
    }
}

pub fn validate_incoming_publish(msg: &Message) -> Result<()> {
    require_node_addr(msg, FIELD_FROM)?;
    optional_base_addr(msg, FIELD_TO)?;
    require_field(msg, FIELD_SERVICE_ID)?;

    for (field, value) in msg.iter() {
        if ENVELOPE_FIELDS.contains(&field) {
            continue;
        }
        let values = non_empty_list(field, value)?;
        if lookup_datatype(field).is_none() {
            warn!("Unknown type '{}'", field);
            continue;
        }
        validate_types(field, &values)?;
        if field == FIELD_SERVICE_ID {
            validate_unique(&values)?;
        }
    }

    if let (Some(types), Some(counts)) =
        (msg.value_list(FIELD_DATA_TYPE), msg.value_list(FIELD_COUNT))
    {
        validate_description_counts(types.len(), &counts)?;
    }
    Ok(())
}

/// A node asking something of another node (or of us). Only metatypes are
/// meaningful in a request.
pub fn validate_incoming_request(msg: &Message) -> Result<()> {
    require_node_addr(msg, FIELD_FROM)?;
    require_field(msg, FIELD_SERVICE_ID)?;
    validate_request_fields(msg)
}

/// A node setting values on another node.
pub fn validate_incoming_set(msg: &Message) -> Result<()> {
    require_node_addr(msg, FIELD_FROM)?;
    require_node_addr(msg, FIELD_TO)?;
    require_field(msg, FIELD_SERVICE_ID)?;
    validate_value_fields(msg)
}

/// Error replies may come from a node (`from` set) or from the Base itself.
pub fn validate_incoming_error(msg: &Message) -> Result<()> {
    if msg.contains(FIELD_FROM) {
        require_node_addr(msg, FIELD_FROM)?;
    }
    Ok(())
}

pub fn validate_outgoing_request(msg: &Message) -> Result<()> {
    require_node_addr(msg, FIELD_TO)?;
    optional_base_addr(msg, FIELD_FROM)?;
    require_field(msg, FIELD_SERVICE_ID)?;
    validate_request_fields(msg)
}

pub fn validate_outgoing_set(msg: &Message) -> Result<()> {
    require_node_addr(msg, FIELD_TO)?;
    optional_base_addr(msg, FIELD_FROM)?;
    require_field(msg, FIELD_SERVICE_ID)?;
    validate_value_fields(msg)
}

fn validate_request_fields(msg: &Message) -> Result<()> {
    for (field, value) in msg.iter() {
        if ENVELOPE_FIELDS.contains(&field) {
            continue;
        }
        if ![FIELD_SERVICE_ID, FIELD_DATA_TYPE, FIELD_COUNT].contains(&field) {
            warn!("Type '{}' not allowed in Requests", field);
            continue;
        }
        let values = non_empty_list(field, value)?;
        if field == FIELD_SERVICE_ID && values.len() > 1 {
            return Err(ValidationError::TooManyServiceIds);
        }
        validate_types(field, &values)?;
    }
    Ok(())
}

fn validate_value_fields(msg: &Message) -> Result<()> {
    for (field, value) in msg.iter() {
        if ENVELOPE_FIELDS.contains(&field) {
            continue;
        }
        let values = non_empty_list(field, value)?;
        if lookup_datatype(field).is_none() {
            warn!("Unknown type '{}'", field);
            continue;
        }
        validate_types(field, &values)?;
    }
    Ok(())
}

fn require_field(msg: &Message, field: &'static str) -> Result<()> {
    if msg.contains(field) {
        Ok(())
    } else {
        Err(ValidationError::MissingField(field))
    }
}

fn require_node_addr(msg: &Message, field: &'static str) -> Result<()> {
    let raw = msg.get(field).ok_or(ValidationError::MissingField(field))?;
    let addr = parse_addr(raw).ok_or_else(|| ValidationError::BadAddress {
        value: raw.to_string(),
    })?;
    if !(1..=255).contains(&addr) {
        return Err(ValidationError::NotNodeAddress {
            value: raw.to_string(),
        });
    }
    Ok(())
}

fn optional_base_addr(msg: &Message, field: &'static str) -> Result<()> {
    let Some(raw) = msg.get(field) else {
        return Ok(());
    };
    let addr = parse_addr(raw).ok_or_else(|| ValidationError::BadAddress {
        value: raw.to_string(),
    })?;
    if addr != i64::from(BASE_ADDR) {
        return Err(ValidationError::NotBaseAddress {
            value: raw.to_string(),
        });
    }
    Ok(())
}

fn non_empty_list(field: &str, value: &Value) -> Result<Vec<Value>> {
    let values = value_list(value);
    if values.is_empty() {
        return Err(ValidationError::EmptyValueList {
            field: field.to_string(),
        });
    }
    Ok(values)
}

fn nullable(field: &str) -> bool {
    ![FIELD_COUNT, FIELD_SERVICE_ID, FIELD_DATA_TYPE].contains(&field)
}

fn value_matches(kind: BasicKind, value: &Value, allow_null: bool) -> bool {
    match value {
        Value::Null => allow_null,
        Value::Bool(_) => kind == BasicKind::Bool,
        Value::Number(n) => match kind {
            BasicKind::Float => true,
            BasicKind::Int => n.is_i64() || n.is_u64(),
            _ => false,
        },
        Value::String(_) => kind == BasicKind::Text,
        Value::Array(_) | Value::Object(_) => false,
    }
}

/// Check every value of a known field against its declared basic kind plus the
/// per-type numeric constraints.
pub fn validate_types(field: &str, values: &[Value]) -> Result<()> {
    let Some(info) = lookup_datatype(field) else {
        return Ok(());
    };
    let allow_null = nullable(field);
    if values
        .iter()
        .any(|v| !value_matches(info.kind, v, allow_null))
    {
        return Err(ValidationError::TypeMismatch {
            field: field.to_string(),
        });
    }

    if field == FIELD_COUNT && values.iter().any(|v| v.as_i64().is_some_and(|n| n < 0)) {
        return Err(ValidationError::Negative {
            field: field.to_string(),
        });
    }
    if field == FIELD_SERVICE_ID
        && values
            .iter()
            .any(|v| !v.as_u64().is_some_and(|n| n <= 255))
    {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
        });
    }
    Ok(())
}

fn validate_unique(values: &[Value]) -> Result<()> {
    for (i, v) in values.iter().enumerate() {
        if values[i + 1..].contains(v) {
            return Err(ValidationError::DuplicateServiceIds);
        }
    }
    Ok(())
}

/// `count` splits the `dataType` list into published and accepted channels.
fn validate_description_counts(type_count: usize, counts: &[Value]) -> Result<()> {
    if counts.len() > 2 {
        return Err(ValidationError::TooManyCounts(counts.len()));
    }
    let published = counts.first().and_then(Value::as_i64).unwrap_or(0);
    if published < 0 || published > type_count as i64 {
        return Err(ValidationError::InvalidPublishCount(published));
    }
    if let Some(accepted) = counts.get(1).and_then(Value::as_i64) {
        let total = published + accepted;
        if total != type_count as i64 {
            return Err(ValidationError::InvalidTotalCount(total));
        }
    }
    Ok(())
}

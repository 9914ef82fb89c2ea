use thiserror::Error;

use crate::protocol::validate::ValidationError;

/// Errors raised by the time-indexed store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Wrapper around sled's error type.
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// Wrapper around bincode serialization and deserialization errors.
    #[error("serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// Wrapper around IO errors (directory creation, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A key or row that does not decode.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// A structurally valid message that makes no sense against the known state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown node {0}")]
    UnknownNode(u8),

    #[error("unknown service {0}")]
    UnknownService(u8),

    #[error("the service manager is read-only")]
    ReadOnlyService,

    #[error("service doesn't accept '{0}'")]
    UndeclaredType(String),

    #[error("too many '{field}' values: {given} given, {declared} accepted")]
    TooManyAccepted {
        field: String,
        given: usize,
        declared: u32,
    },

    #[error("too many '{field}' values: {given} given, {declared} published")]
    TooManyPublished {
        field: String,
        given: usize,
        declared: u32,
    },

    #[error("message has no usable '{0}' address")]
    MissingAddress(&'static str),
}

/// Failure to hand a line to a Base.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("no Base connected")]
    NoBase,

    #[error("unknown Base '{0}'")]
    UnknownBase(String),

    #[error("a Base named '{0}' is already connected")]
    DuplicateBase(String),

    #[error("connection to Base '{0}' is closed")]
    Closed(String),
}

/// Why a message was routed to the invalid path instead of the tracker.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RejectReason {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Failure of a user command before anything was sent.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command is not a JSON object: {0}")]
    BadJson(ValidationError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

//! Error types for query parsing, registry composition and resolution.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the engine.
///
/// Parse and registry errors are raised before any transport activity.
/// Resolution errors either abort the whole query or are recorded as error
/// markers on the affected result nodes, depending on the failure policy.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    /// The query literal is structurally malformed.
    #[error("parse error at '{path}': {message}")]
    ParseError { path: String, message: String },

    /// Two descriptors registered the same operation identifier.
    #[error("operation '{operation}' is registered by both '{first}' and '{second}'")]
    DuplicateOperation {
        operation: String,
        first: String,
        second: String,
    },

    /// Two descriptors claim ownership of the same entity type.
    #[error("entity type '{entity_type}' is owned by both '{first}' and '{second}'")]
    DuplicateEntity {
        entity_type: String,
        first: String,
        second: String,
    },

    /// A relation refers to an entity type no service declares.
    #[error("relation '{relation}' refers to unknown entity type '{entity_type}'")]
    UnknownEntityType {
        relation: String,
        entity_type: String,
    },

    /// The envelope names a service or operation the registry does not know.
    #[error("unknown operation '{operation}' on service '{service}'")]
    UnknownOperation { service: String, operation: String },

    /// A selection references a field the entity type does not declare.
    #[error("unknown field '{field}' on type '{entity_type}'")]
    UnknownField { entity_type: String, field: String },

    /// The requested limit is above the relation's declared maximum.
    #[error("limit {requested} on '{relation}' exceeds the maximum of {max}")]
    LimitExceeded {
        relation: String,
        requested: usize,
        max: usize,
    },

    /// Relation traversal reached the configured depth bound.
    #[error("relation '{relation}' at depth {depth} exceeds the maximum depth of {max_depth}")]
    CycleDepthExceeded {
        relation: String,
        depth: usize,
        max_depth: usize,
    },

    /// A batch call failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The execution deadline expired.
    #[error("query timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// The execution was cancelled by the caller.
    #[error("query was cancelled")]
    Cancelled,

    /// Configuration could not be loaded.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl FetchError {
    pub(crate) fn parse(path: impl Into<String>, message: impl Into<String>) -> Self {
        FetchError::ParseError {
            path: path.into(),
            message: message.into(),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        FetchError::Config {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::ParseError { .. } => ErrorKind::ParseError,
            FetchError::DuplicateOperation { .. } => ErrorKind::DuplicateOperation,
            FetchError::DuplicateEntity { .. } => ErrorKind::DuplicateEntity,
            FetchError::UnknownEntityType { .. } => ErrorKind::UnknownEntityType,
            FetchError::UnknownOperation { .. } => ErrorKind::UnknownOperation,
            FetchError::UnknownField { .. } => ErrorKind::UnknownField,
            FetchError::LimitExceeded { .. } => ErrorKind::LimitExceeded,
            FetchError::CycleDepthExceeded { .. } => ErrorKind::CycleDepthExceeded,
            FetchError::Transport(_) => ErrorKind::TransportError,
            FetchError::Timeout { .. } => ErrorKind::Timeout,
            FetchError::Cancelled => ErrorKind::Cancelled,
            FetchError::Config { .. } => ErrorKind::Config,
        }
    }

    /// The marker written into the response tree for nodes this error failed.
    pub fn to_marker(&self) -> ErrorMarker {
        ErrorMarker {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Failure reported by a transport adapter.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("transport call {service}/{operation} failed: {message}")]
pub struct TransportError {
    pub service: String,
    pub operation: String,
    pub message: String,
}

impl TransportError {
    pub fn new(
        service: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        TransportError {
            service: service.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Serializable discriminant of [`FetchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ParseError,
    DuplicateOperation,
    DuplicateEntity,
    UnknownEntityType,
    UnknownOperation,
    UnknownField,
    TransportError,
    LimitExceeded,
    CycleDepthExceeded,
    Timeout,
    Cancelled,
    Config,
}

/// Terminal error recorded on a result node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMarker {
    pub kind: ErrorKind,
    pub message: String,
}

/// Result type for engine operations.
pub type FetchResult<T> = Result<T, FetchError>;

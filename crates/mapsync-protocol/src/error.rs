//! Protocol error types

use thiserror::Error;

/// Protocol-specific errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Missing message type")]
    MissingType,

    #[error("Unknown type: {0}")]
    UnknownType(String),

    #[error("Invalid payload for {kind}: {detail}")]
    InvalidPayload { kind: String, detail: String },
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

//! Error types for Conduit.
//!
//! One error enum covers local validation, transport anomalies, and the
//! caller-visible rejection kinds. Errors that cross the wire are reduced to
//! an [`ErrorDescriptor`](crate::fulfillment::ErrorDescriptor) and rebuilt on
//! the frontend with [`ConduitError::from_descriptor`].

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::fulfillment::ErrorDescriptor;

/// Main error type for the Conduit library.
#[derive(Debug, Error)]
pub enum ConduitError {
    // Marshaling errors
    #[error("Malformed value: {message}")]
    MalformedValue { message: String },

    // Protocol-level retransmission
    #[error("Duplicate request id: {request_id}")]
    DuplicateRequest { request_id: String },

    #[error("Duplicate message for request {request_id}: {message}")]
    DuplicateMessage { request_id: String, message: String },

    #[error("Message of {size} bytes exceeds the channel limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    // Dispatch errors
    #[error("Incompatible interface: no operation {operation} compatible with version {version}")]
    IncompatibleInterface { operation: String, version: String },

    #[error("Operation failed ({classification}): {message}")]
    OperationFailure {
        classification: String,
        message: String,
    },

    // Request lifecycle
    #[error("Request timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Request cancelled by caller")]
    Cancelled,

    #[error("Request not found on backend: {request_id}")]
    NotFound { request_id: String },

    // Transport errors
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("HTTP error: {message}")]
    Http {
        message: String,
        status_code: Option<u16>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for Conduit operations.
pub type Result<T> = std::result::Result<T, ConduitError>;

/// Classification carried on the wire for failed fulfillments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MalformedValue,
    DuplicateMessage,
    IncompatibleInterface,
    OperationFailure,
    TimedOut,
    Cancelled,
    NotFound,
    Transport,
}

impl From<std::io::Error> for ConduitError {
    fn from(err: std::io::Error) -> Self {
        ConduitError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ConduitError {
    fn from(err: serde_json::Error) -> Self {
        ConduitError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for ConduitError {
    fn from(err: reqwest::Error) -> Self {
        ConduitError::Http {
            message: err.to_string(),
            status_code: err.status().map(|s| s.as_u16()),
        }
    }
}

impl ConduitError {
    /// Create a transport error from any displayable cause.
    pub fn transport(message: impl std::fmt::Display) -> Self {
        ConduitError::Transport {
            message: message.to_string(),
        }
    }

    /// Create a malformed-value error.
    pub fn malformed(message: impl Into<String>) -> Self {
        ConduitError::MalformedValue {
            message: message.into(),
        }
    }

    /// Wire classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConduitError::MalformedValue { .. } => ErrorKind::MalformedValue,
            ConduitError::DuplicateRequest { .. } | ConduitError::DuplicateMessage { .. } => {
                ErrorKind::DuplicateMessage
            }
            ConduitError::IncompatibleInterface { .. } => ErrorKind::IncompatibleInterface,
            ConduitError::OperationFailure { .. } => ErrorKind::OperationFailure,
            ConduitError::TimedOut(_) => ErrorKind::TimedOut,
            ConduitError::Cancelled => ErrorKind::Cancelled,
            ConduitError::NotFound { .. } => ErrorKind::NotFound,
            _ => ErrorKind::Transport,
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard codes:
    /// - -32700: Parse error
    /// - -32600: Invalid Request
    /// - -32601: Method not found
    /// - -32603: Internal error
    ///
    /// Application codes (-32000 to -32099):
    /// - -32000: Transport/connectivity error
    /// - -32001: Operation failed
    /// - -32002: Timed out
    /// - -32004: Cancelled by caller
    /// - -32005: Duplicate request or message
    /// - -32006: Request not found
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            ConduitError::Json { .. } | ConduitError::MalformedValue { .. } => -32700,
            ConduitError::MessageTooLarge { .. } => -32600,
            ConduitError::IncompatibleInterface { .. } => -32601,

            ConduitError::Transport { .. }
            | ConduitError::Io { .. }
            | ConduitError::Http { .. } => -32000,

            ConduitError::OperationFailure { .. } => -32001,
            ConduitError::TimedOut(_) => -32002,
            ConduitError::Cancelled => -32004,

            ConduitError::DuplicateRequest { .. } | ConduitError::DuplicateMessage { .. } => {
                -32005
            }

            ConduitError::NotFound { .. } => -32006,

            _ => -32603,
        }
    }

    /// Rebuild a caller-visible error from a failed fulfillment's descriptor.
    pub fn from_descriptor(descriptor: &ErrorDescriptor) -> Self {
        match descriptor.kind {
            ErrorKind::IncompatibleInterface => ConduitError::IncompatibleInterface {
                operation: descriptor
                    .operation
                    .clone()
                    .unwrap_or_else(|| "<unknown>".to_string()),
                version: descriptor
                    .version
                    .clone()
                    .unwrap_or_else(|| "<unknown>".to_string()),
            },
            ErrorKind::Cancelled => ConduitError::Cancelled,
            ErrorKind::MalformedValue => ConduitError::MalformedValue {
                message: descriptor.message.clone(),
            },
            _ => ConduitError::OperationFailure {
                classification: descriptor.classification.clone(),
                message: descriptor.message.clone(),
            },
        }
    }

    /// True for rejections the caller initiated or policy imposed locally.
    pub fn is_local_rejection(&self) -> bool {
        matches!(self, ConduitError::TimedOut(_) | ConduitError::Cancelled)
    }
}

//! Backend answers and progress notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ConduitError, ErrorKind, Result};
use crate::marshal::{self, RpcValue, SerializedValue};

/// Outcome of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FulfillmentStatus {
    Success,
    Failure,
}

/// Description of a failure that crosses the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDescriptor {
    pub kind: ErrorKind,
    /// Handler-defined error class (e.g. `"DivideByZero"`).
    pub classification: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Diagnostics attached to every fulfillment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticMetadata {
    pub operation: String,
    pub version: String,
    /// Backend execution time.
    pub elapsed_ms: u64,
    pub completed_at: DateTime<Utc>,
}

/// The backend's terminal answer to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fulfillment {
    pub request_id: String,
    pub status: FulfillmentStatus,
    pub result: SerializedValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDescriptor>,
    pub diagnostics: DiagnosticMetadata,
}

impl Fulfillment {
    /// Successful fulfillment carrying a marshaled result.
    pub fn success(
        request_id: impl Into<String>,
        result: &RpcValue,
        diagnostics: DiagnosticMetadata,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            status: FulfillmentStatus::Success,
            result: marshal::serialize(result),
            error: None,
            diagnostics,
        }
    }

    /// Failed fulfillment.
    pub fn failure(
        request_id: impl Into<String>,
        error: ErrorDescriptor,
        diagnostics: DiagnosticMetadata,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            status: FulfillmentStatus::Failure,
            result: SerializedValue::default(),
            error: Some(error),
            diagnostics,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == FulfillmentStatus::Success
    }

    /// Convert into the caller-visible outcome.
    pub fn into_outcome(self) -> Result<RpcValue> {
        match self.status {
            FulfillmentStatus::Success => marshal::deserialize(self.result),
            FulfillmentStatus::Failure => Err(match &self.error {
                Some(descriptor) => ConduitError::from_descriptor(descriptor),
                None => ConduitError::OperationFailure {
                    classification: "Unknown".to_string(),
                    message: "backend reported failure without detail".to_string(),
                },
            }),
        }
    }
}

impl DiagnosticMetadata {
    pub fn new(operation: impl Into<String>, version: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            operation: operation.into(),
            version: version.into(),
            elapsed_ms,
            completed_at: Utc::now(),
        }
    }
}

/// Non-terminal progress notification for a still-executing request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingUpdate {
    pub request_id: String,
    /// Monotonic per request, starting at 1.
    pub sequence: u64,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl PendingUpdate {
    pub fn new(request_id: impl Into<String>, sequence: u64, metadata: serde_json::Value) -> Self {
        Self {
            request_id: request_id.into(),
            sequence,
            metadata,
            timestamp: Utc::now(),
        }
    }
}

//! HTTP bodies for the polling transport.
//!
//! ```text
//! POST   /requests        SubmitRequest  -> 202 PollResponse (pending)
//!                                         | 200 PollResponse (resolved/rejected)
//! GET    /requests/{id}                  -> 200 PollResponse | 404 ErrorBody
//! DELETE /requests/{id}                  -> 204 | 404 ErrorBody
//! GET    /operations                     -> 200 [InterfaceDescriptor]
//! GET    /health                         -> 200 {"status":"ok"}
//! ```

use serde::{Deserialize, Serialize};

use crate::fulfillment::{Fulfillment, PendingUpdate};
use crate::marshal::SerializedValue;

/// Body of `POST /requests`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub request_id: String,
    pub operation: String,
    pub version: String,
    pub params: SerializedValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Pending,
    Resolved,
    Rejected,
}

/// Status of one request as seen by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResponse {
    pub request_id: String,
    pub status: PollStatus,
    /// Most recent progress report while pending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<PendingUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fulfillment: Option<Fulfillment>,
}

impl PollResponse {
    pub fn pending(request_id: impl Into<String>, update: Option<PendingUpdate>) -> Self {
        Self {
            request_id: request_id.into(),
            status: PollStatus::Pending,
            update,
            fulfillment: None,
        }
    }

    pub fn finished(fulfillment: Fulfillment) -> Self {
        Self {
            request_id: fulfillment.request_id.clone(),
            status: if fulfillment.is_success() {
                PollStatus::Resolved
            } else {
                PollStatus::Rejected
            },
            update: None,
            fulfillment: Some(fulfillment),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != PollStatus::Pending
    }
}

/// Body of non-2xx answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i32,
    pub error: String,
}

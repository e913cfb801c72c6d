//! Frontend request registry.
//!
//! Owns every live request from registration until it reaches a terminal
//! state. All state changes go through one `std::sync::Mutex` that is never
//! held across an `.await`, so check-then-update sequences cannot interleave
//! with other tasks. Terminal transitions remove the entry; anything that
//! arrives afterwards for the same id finds nothing and is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::state::RequestState;
use crate::error::{ConduitError, Result};
use crate::fulfillment::{Fulfillment, PendingUpdate};
use crate::marshal::{RpcValue, SerializedValue};

/// Callback invoked for each pending update of one request.
pub type UpdateListener = Arc<dyn Fn(&PendingUpdate) + Send + Sync>;

/// Receiver side of a request's final outcome.
pub type OutcomeReceiver = oneshot::Receiver<Result<RpcValue>>;

/// A request as handed to a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub id: String,
    pub operation: String,
    pub version: String,
    pub params: SerializedValue,
    pub created_at: DateTime<Utc>,
}

impl OutboundRequest {
    pub fn new(
        id: impl Into<String>,
        operation: impl Into<String>,
        version: impl Into<String>,
        params: SerializedValue,
    ) -> Self {
        Self {
            id: id.into(),
            operation: operation.into(),
            version: version.into(),
            params,
            created_at: Utc::now(),
        }
    }
}

/// Counters describing registry activity since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub registered: u64,
    pub resolved: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    /// Fulfillments or updates that arrived for an unknown id.
    pub late_dropped: u64,
}

/// Snapshot of one live request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestSnapshot {
    pub id: String,
    pub operation: String,
    pub version: String,
    pub state: RequestState,
    pub created_at: DateTime<Utc>,
    pub cancel_requested: bool,
    pub updates_seen: u64,
}

struct Entry {
    operation: String,
    version: String,
    created_at: DateTime<Utc>,
    state: RequestState,
    cancel_requested: bool,
    updates_seen: u64,
    completion: Option<oneshot::Sender<Result<RpcValue>>>,
    listeners: Vec<UpdateListener>,
    timer: Option<AbortHandle>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    stats: RegistryStats,
}

/// Table of live requests keyed by id.
#[derive(Default)]
pub struct RequestRegistry {
    inner: Mutex<Inner>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a request in the `Created` state.
    ///
    /// Fails with [`ConduitError::DuplicateRequest`] if the id is live.
    pub fn register(&self, request: &OutboundRequest) -> Result<OutcomeReceiver> {
        let mut inner = self.lock();
        if inner.entries.contains_key(&request.id) {
            return Err(ConduitError::DuplicateRequest {
                request_id: request.id.clone(),
            });
        }
        let (tx, rx) = oneshot::channel();
        inner.entries.insert(
            request.id.clone(),
            Entry {
                operation: request.operation.clone(),
                version: request.version.clone(),
                created_at: request.created_at,
                state: RequestState::Created,
                cancel_requested: false,
                updates_seen: 0,
                completion: Some(tx),
                listeners: Vec::new(),
                timer: None,
            },
        );
        inner.stats.registered += 1;
        debug!(
            "Registered request {} ({} v{})",
            request.id, request.operation, request.version
        );
        Ok(rx)
    }

    /// Record that the transport accepted the request for sending.
    ///
    /// Returns false if the request is no longer live or already past
    /// `Created` (a fast backend may have answered already).
    pub fn mark_submitted(&self, request_id: &str) -> bool {
        let mut inner = self.lock();
        match inner.entries.get_mut(request_id) {
            Some(entry) if entry.state.can_transition_to(RequestState::Submitted) => {
                entry.state = RequestState::Submitted;
                true
            }
            _ => false,
        }
    }

    /// Start the local timeout for a live request.
    ///
    /// The timer races fulfillment arrival; whichever reaches the registry
    /// first decides the outcome.
    pub fn arm_timeout(self: &Arc<Self>, request_id: &str, timeout: Duration) {
        let registry: Weak<Self> = Arc::downgrade(self);
        let id = request_id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(registry) = registry.upgrade() {
                registry.time_out(&id, timeout);
            }
        });

        let mut inner = self.lock();
        match inner.entries.get_mut(request_id) {
            Some(entry) => {
                if let Some(previous) = entry.timer.replace(task.abort_handle()) {
                    previous.abort();
                }
            }
            None => task.abort(),
        }
    }

    /// Attach a pending-update listener. Returns false if the request is gone.
    pub fn add_listener(&self, request_id: &str, listener: UpdateListener) -> bool {
        let mut inner = self.lock();
        match inner.entries.get_mut(request_id) {
            Some(entry) => {
                entry.listeners.push(listener);
                true
            }
            None => false,
        }
    }

    /// Deliver a progress notification. The request moves to (or stays in)
    /// `Pending`; listeners run after the lock is released.
    pub fn pending_update(&self, update: PendingUpdate) -> bool {
        let listeners = {
            let mut inner = self.lock();
            let Some(entry) = inner.entries.get_mut(&update.request_id) else {
                inner.stats.late_dropped += 1;
                debug!("Dropping pending update for unknown request {}", update.request_id);
                return false;
            };
            if entry.state == RequestState::Created {
                // The backend is working on it, so the send side has completed.
                entry.state = RequestState::Submitted;
            }
            if !entry.state.can_transition_to(RequestState::Pending) {
                return false;
            }
            entry.state = RequestState::Pending;
            entry.updates_seen += 1;
            entry.listeners.clone()
        };

        for listener in listeners {
            listener(&update);
        }
        true
    }

    /// Resolve or reject a request from its fulfillment.
    ///
    /// A fulfillment for an unknown id (already terminal, or never ours) is
    /// dropped and false is returned.
    pub fn fulfill(&self, fulfillment: Fulfillment) -> bool {
        let request_id = fulfillment.request_id.clone();
        let outcome = fulfillment.into_outcome();
        let terminal = if outcome.is_ok() {
            RequestState::Resolved
        } else {
            RequestState::Rejected
        };
        self.finish(&request_id, terminal, outcome)
    }

    /// Reject a live request with a local error (e.g. the send failed).
    pub fn reject(&self, request_id: &str, error: ConduitError) -> bool {
        self.finish(request_id, RequestState::Rejected, Err(error))
    }

    /// Expire a request whose timeout elapsed.
    pub fn time_out(&self, request_id: &str, after: Duration) -> bool {
        let expired = self.finish(
            request_id,
            RequestState::TimedOut,
            Err(ConduitError::TimedOut(after)),
        );
        if expired {
            warn!("Request {} timed out after {:?}", request_id, after);
        }
        expired
    }

    /// Cancel a live request on behalf of the caller.
    pub fn cancel(&self, request_id: &str) -> bool {
        {
            let mut inner = self.lock();
            if let Some(entry) = inner.entries.get_mut(request_id) {
                entry.cancel_requested = true;
            }
        }
        self.finish(request_id, RequestState::Cancelled, Err(ConduitError::Cancelled))
    }

    fn finish(&self, request_id: &str, terminal: RequestState, outcome: Result<RpcValue>) -> bool {
        let completion = {
            let mut inner = self.lock();
            let legal = inner
                .entries
                .get(request_id)
                .map(|entry| entry.state.can_transition_to(terminal));
            match legal {
                Some(true) => {}
                Some(false) => return false,
                None => {
                    inner.stats.late_dropped += 1;
                    debug!(
                        "Dropping {} outcome for unknown request {}",
                        terminal, request_id
                    );
                    return false;
                }
            }

            let Some(mut entry) = inner.entries.remove(request_id) else {
                return false;
            };
            entry.state = terminal;
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            match terminal {
                RequestState::Resolved => inner.stats.resolved += 1,
                RequestState::Rejected => inner.stats.rejected += 1,
                RequestState::TimedOut => inner.stats.timed_out += 1,
                RequestState::Cancelled => inner.stats.cancelled += 1,
                _ => {}
            }
            entry.completion.take()
        };

        debug!("Request {} reached {}", request_id, terminal);
        if let Some(tx) = completion {
            // The caller may have dropped its handle; nothing to do then.
            let _ = tx.send(outcome);
        }
        true
    }

    /// Current state of a live request. `None` once terminal.
    pub fn state(&self, request_id: &str) -> Option<RequestState> {
        self.lock().entries.get(request_id).map(|entry| entry.state)
    }

    pub fn is_live(&self, request_id: &str) -> bool {
        self.lock().entries.contains_key(request_id)
    }

    pub fn snapshot(&self, request_id: &str) -> Option<RequestSnapshot> {
        self.lock()
            .entries
            .get(request_id)
            .map(|entry| RequestSnapshot {
                id: request_id.to_string(),
                operation: entry.operation.clone(),
                version: entry.version.clone(),
                state: entry.state,
                created_at: entry.created_at,
                cancel_requested: entry.cancel_requested,
                updates_seen: entry.updates_seen,
            })
    }

    /// Number of live requests.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RegistryStats {
        self.lock().stats
    }
}

impl std::fmt::Debug for RequestRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("RequestRegistry")
            .field("live", &inner.entries.len())
            .field("stats", &inner.stats)
            .finish()
    }
}

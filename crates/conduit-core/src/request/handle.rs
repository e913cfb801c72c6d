//! Caller-facing handle for one submitted request.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tracing::debug;

use super::registry::{OutcomeReceiver, RequestRegistry};
use super::state::RequestState;
use crate::error::{ConduitError, Result};
use crate::fulfillment::PendingUpdate;
use crate::marshal::RpcValue;
use crate::transport::Transport;

/// Cancels one request. Cheap to clone and safe to move into other tasks.
#[derive(Clone)]
pub struct RequestCanceller {
    request_id: String,
    registry: Arc<RequestRegistry>,
    transport: Arc<dyn Transport>,
}

impl RequestCanceller {
    /// Stop waiting for the request.
    ///
    /// The request is rejected with [`ConduitError::Cancelled`] and released
    /// from the registry; a cancellation notice goes to the backend in the
    /// background. Returns false if the request had already finished.
    pub fn cancel(&self) -> bool {
        if !self.registry.cancel(&self.request_id) {
            return false;
        }

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let transport = self.transport.clone();
            let request_id = self.request_id.clone();
            runtime.spawn(async move {
                if let Err(e) = transport.cancel(&request_id).await {
                    debug!(
                        "Cancellation notice for {} over {} failed: {}",
                        request_id,
                        transport.name(),
                        e
                    );
                }
            });
        }
        true
    }
}

/// A submitted request. Await it for the final value.
///
/// ```rust,ignore
/// let handle = client.submit("Add", "1.0", params).await?;
/// handle.on_pending_update(|update| println!("progress: {}", update.metadata));
/// let sum = handle.await?;
/// ```
pub struct RequestHandle {
    outcome: OutcomeReceiver,
    canceller: RequestCanceller,
}

impl RequestHandle {
    pub(crate) fn new(
        request_id: String,
        outcome: OutcomeReceiver,
        registry: Arc<RequestRegistry>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            outcome,
            canceller: RequestCanceller {
                request_id,
                registry,
                transport,
            },
        }
    }

    pub fn id(&self) -> &str {
        &self.canceller.request_id
    }

    /// See [`RequestCanceller::cancel`].
    pub fn cancel(&self) -> bool {
        self.canceller.cancel()
    }

    /// A detached canceller for use while this handle is being awaited.
    pub fn canceller(&self) -> RequestCanceller {
        self.canceller.clone()
    }

    /// Register a callback for progress notifications.
    pub fn on_pending_update<F>(&self, callback: F) -> &Self
    where
        F: Fn(&PendingUpdate) + Send + Sync + 'static,
    {
        self.canceller
            .registry
            .add_listener(&self.canceller.request_id, Arc::new(callback));
        self
    }

    /// Current lifecycle state, or `None` once the request finished.
    pub fn state(&self) -> Option<RequestState> {
        self.canceller.registry.state(&self.canceller.request_id)
    }
}

impl Future for RequestHandle {
    type Output = Result<RpcValue>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.outcome).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(ConduitError::Other(
                    "request was dropped without an outcome".to_string(),
                ))
            })
        })
    }
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.canceller.request_id)
            .field("transport", &self.canceller.transport.name())
            .finish()
    }
}

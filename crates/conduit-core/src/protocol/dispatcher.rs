//! Backend dispatcher.
//!
//! Resolves a reassembled request to its implementation, runs it on its own
//! task, and turns whatever happens into a [`Fulfillment`]. Each request id
//! executes at most once: the fulfillment is retained (bounded, oldest
//! evicted first) and replayed for retransmissions, and a duplicate that
//! arrives while the original is still running is dropped. A cancel notice
//! that arrives before its request is dispatched is held briefly and applied
//! when the request starts.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tracing::{debug, warn};

use super::operation::{
    InterfaceDescriptor, OperationContext, OperationError, OperationHandler, OperationRegistry,
    ProgressSender,
};
use crate::cancel::CancellationToken;
use crate::config::{DispatcherConfig, DispatcherSettings};
use crate::error::{ConduitError, ErrorKind, Result};
use crate::fulfillment::{DiagnosticMetadata, ErrorDescriptor, Fulfillment};
use crate::marshal::{self, RpcValue, SerializedValue};

/// A fully reassembled request on the backend side.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundRequest {
    pub id: String,
    pub operation: String,
    pub version: String,
    pub params: SerializedValue,
}

/// What the dispatcher did with one inbound request.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The operation ran (or failed to resolve) and produced this answer.
    Completed(Fulfillment),
    /// The id had already completed; this is the retained answer.
    Replayed(Fulfillment),
    /// The id is still executing; the duplicate was dropped.
    InFlight,
    /// The request could not be used; nothing was executed.
    Dropped(ConduitError),
}

impl DispatchOutcome {
    /// The fulfillment to send back, if any.
    pub fn fulfillment(&self) -> Option<&Fulfillment> {
        match self {
            DispatchOutcome::Completed(f) | DispatchOutcome::Replayed(f) => Some(f),
            _ => None,
        }
    }

    pub fn into_fulfillment(self) -> Option<Fulfillment> {
        match self {
            DispatchOutcome::Completed(f) | DispatchOutcome::Replayed(f) => Some(f),
            _ => None,
        }
    }
}

#[derive(Default)]
struct DispatchState {
    in_flight: HashMap<String, CancellationToken>,
    retained: HashMap<String, Fulfillment>,
    order: VecDeque<String>,
    pending_cancels: HashMap<String, Instant>,
}

impl DispatchState {
    fn prune_pending_cancels(&mut self) {
        self.pending_cancels
            .retain(|_, noted| noted.elapsed() < DispatcherConfig::PENDING_CANCEL_TTL);
        while self.pending_cancels.len() >= DispatcherConfig::MAX_PENDING_CANCELS {
            let oldest = self
                .pending_cancels
                .iter()
                .min_by_key(|(_, noted)| **noted)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    self.pending_cancels.remove(&id);
                }
                None => break,
            }
        }
    }
}

/// Resolves and invokes operations for inbound requests.
pub struct Dispatcher {
    operations: Arc<OperationRegistry>,
    settings: DispatcherSettings,
    state: Mutex<DispatchState>,
}

impl Dispatcher {
    pub fn new(operations: OperationRegistry) -> Self {
        Self::with_settings(operations, DispatcherSettings::default())
    }

    pub fn with_settings(operations: OperationRegistry, settings: DispatcherSettings) -> Self {
        Self {
            operations: Arc::new(operations),
            settings,
            state: Mutex::new(DispatchState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    pub fn describe(&self) -> Vec<InterfaceDescriptor> {
        self.operations.describe()
    }

    /// Execute a request at most once and produce its fulfillment.
    pub async fn dispatch(
        &self,
        request: InboundRequest,
        progress: Option<ProgressSender>,
    ) -> DispatchOutcome {
        let token = {
            let mut state = self.lock();
            if let Some(retained) = state.retained.get(&request.id) {
                debug!("Replaying retained fulfillment for {}", request.id);
                return DispatchOutcome::Replayed(retained.clone());
            }
            if state.in_flight.contains_key(&request.id) {
                let err = ConduitError::DuplicateMessage {
                    request_id: request.id.clone(),
                    message: "request is already executing".to_string(),
                };
                warn!("{}", err);
                return DispatchOutcome::InFlight;
            }
            let token = CancellationToken::new();
            if state.pending_cancels.remove(&request.id).is_some() {
                debug!("Applying early cancel notice to {}", request.id);
                token.cancel();
            }
            state.in_flight.insert(request.id.clone(), token.clone());
            token
        };

        let request_id = request.id.clone();
        let outcome = self.execute(request, token, progress).await;

        let mut state = self.lock();
        state.in_flight.remove(&request_id);
        match outcome {
            Ok(fulfillment) => {
                self.retain(&mut state, fulfillment.clone());
                DispatchOutcome::Completed(fulfillment)
            }
            Err(err) => {
                warn!("Dropping request {}: {}", request_id, err);
                DispatchOutcome::Dropped(err)
            }
        }
    }

    /// Signal cancellation to a running invocation. Returns false if the id
    /// is not executing; a notice for an id that has not completed either is
    /// remembered so the request starts out cancelled if it arrives shortly.
    pub fn cancel(&self, request_id: &str) -> bool {
        let mut state = self.lock();
        if let Some(token) = state.in_flight.get(request_id) {
            debug!("Cancellation requested for {}", request_id);
            token.cancel();
            return true;
        }
        if !state.retained.contains_key(request_id) {
            state.prune_pending_cancels();
            state
                .pending_cancels
                .insert(request_id.to_string(), Instant::now());
            debug!("Holding cancel notice for {} until it is dispatched", request_id);
        }
        false
    }

    /// Retained fulfillment for an id, if it completed recently.
    pub fn retained(&self, request_id: &str) -> Option<Fulfillment> {
        self.lock().retained.get(request_id).cloned()
    }

    pub fn is_in_flight(&self, request_id: &str) -> bool {
        self.lock().in_flight.contains_key(request_id)
    }

    /// Invoke an operation directly, outside any request bookkeeping.
    pub async fn invoke_operation(
        &self,
        name: &str,
        version: &str,
        params: RpcValue,
    ) -> Result<RpcValue> {
        let handler = self
            .operations
            .resolve(name, version)
            .map(|op| op.handler.clone())
            .ok_or_else(|| ConduitError::IncompatibleInterface {
                operation: name.to_string(),
                version: version.to_string(),
            })?;
        run_handler(handler, params, OperationContext::detached())
            .await
            .map_err(|e| ConduitError::OperationFailure {
                classification: e.classification,
                message: e.message,
            })
    }

    async fn execute(
        &self,
        request: InboundRequest,
        token: CancellationToken,
        progress: Option<ProgressSender>,
    ) -> Result<Fulfillment> {
        let started = Instant::now();
        let InboundRequest {
            id,
            operation,
            version,
            params,
        } = request;

        let Some(resolved) = self.operations.resolve(&operation, &version) else {
            warn!("No operation {} compatible with v{}", operation, version);
            return Ok(Fulfillment::failure(
                id,
                ErrorDescriptor {
                    kind: ErrorKind::IncompatibleInterface,
                    classification: "IncompatibleInterface".to_string(),
                    message: format!(
                        "no operation {} compatible with version {}",
                        operation, version
                    ),
                    operation: Some(operation.clone()),
                    version: Some(version.clone()),
                },
                DiagnosticMetadata::new(operation, version, 0),
            ));
        };
        let handler = resolved.handler.clone();
        let served_version = resolved.version_label.clone();

        let params = marshal::deserialize(params)?;
        let context = OperationContext::new(id.clone(), token, progress);
        let result = run_handler(handler, params, context).await;
        let diagnostics = DiagnosticMetadata::new(
            operation.clone(),
            served_version,
            started.elapsed().as_millis() as u64,
        );

        Ok(match result {
            Ok(value) => Fulfillment::success(id, &value, diagnostics),
            Err(err) => {
                warn!("Operation {} failed for {}: {}", operation, id, err);
                Fulfillment::failure(
                    id,
                    ErrorDescriptor {
                        kind: ErrorKind::OperationFailure,
                        classification: err.classification,
                        message: err.message,
                        operation: Some(operation),
                        version: Some(version),
                    },
                    diagnostics,
                )
            }
        })
    }

    fn retain(&self, state: &mut DispatchState, fulfillment: Fulfillment) {
        let capacity = self.settings.retained_results;
        if capacity == 0 {
            return;
        }
        let id = fulfillment.request_id.clone();
        if state.retained.insert(id.clone(), fulfillment).is_none() {
            state.order.push_back(id);
        }
        while state.order.len() > capacity {
            if let Some(oldest) = state.order.pop_front() {
                state.retained.remove(&oldest);
            }
        }
    }
}

/// Run a handler on its own task so a panic becomes a failure instead of
/// tearing down the dispatch loop.
async fn run_handler(
    handler: Arc<dyn OperationHandler>,
    params: RpcValue,
    context: OperationContext,
) -> std::result::Result<RpcValue, OperationError> {
    match tokio::spawn(handler.call(params, context)).await {
        Ok(result) => result,
        Err(join_err) if join_err.is_panic() => Err(OperationError::new(
            "Panic",
            "operation panicked during execution",
        )),
        Err(join_err) => Err(OperationError::new("Aborted", join_err.to_string())),
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Dispatcher")
            .field("operations", &self.operations.len())
            .field("in_flight", &state.in_flight.len())
            .field("retained", &state.retained.len())
            .finish()
    }
}

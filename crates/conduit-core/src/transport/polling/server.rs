//! HTTP backend for the polling transport, built on axum.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use super::wire::{ErrorBody, PollResponse, SubmitRequest};
use crate::config::ServerConfig;
use crate::error::{ConduitError, Result};
use crate::fulfillment::{Fulfillment, PendingUpdate};
use crate::protocol::{DispatchOutcome, Dispatcher, InboundRequest};

/// In-flight request as tracked by the HTTP layer.
#[derive(Debug, Default)]
struct Job {
    latest_update: Option<PendingUpdate>,
}

/// State shared across handlers.
pub struct PollingState {
    dispatcher: Arc<Dispatcher>,
    jobs: Mutex<HashMap<String, Job>>,
}

impl PollingState {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, Job>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current answer for an id: pending, finished, or unknown.
    fn status(&self, request_id: &str) -> Option<PollResponse> {
        if let Some(job) = self.jobs().get(request_id) {
            return Some(PollResponse::pending(request_id, job.latest_update.clone()));
        }
        self.dispatcher
            .retained(request_id)
            .map(PollResponse::finished)
    }
}

/// Handle to a running polling server. Dropping shuts it down.
pub struct PollingServerHandle {
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PollingServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting requests and finish in-flight HTTP exchanges.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Wait for the server task to exit.
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PollingServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Build the router serving the polling endpoints.
pub fn router(state: Arc<PollingState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/operations", get(handle_operations))
        .route("/requests", post(handle_submit))
        .route("/requests/:id", get(handle_poll).delete(handle_cancel))
        .layer(DefaultBodyLimit::max(ServerConfig::MAX_BODY_SIZE))
        .layer(ConcurrencyLimitLayer::new(ServerConfig::CONCURRENCY_LIMIT))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the polling server.
///
/// Returns the bound address (useful when `port` is 0) and a handle that
/// stops the server when dropped.
pub async fn start_server(
    dispatcher: Arc<Dispatcher>,
    host: &str,
    port: u16,
) -> Result<PollingServerHandle> {
    let app = router(Arc::new(PollingState::new(dispatcher)));

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| ConduitError::Config {
            message: format!("invalid listen address {}:{}: {}", host, port, e),
        })?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;
    info!("Polling server listening on {}", actual_addr);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let shutdown = async {
            let _ = shutdown_rx.await;
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("Polling server error: {}", e);
        }
        info!("Polling server stopped");
    });

    Ok(PollingServerHandle {
        addr: actual_addr,
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}

fn error_response(status: StatusCode, err: &ConduitError) -> Response {
    (
        status,
        Json(ErrorBody {
            code: err.to_rpc_error_code(),
            error: err.to_string(),
        }),
    )
        .into_response()
}

async fn handle_health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn handle_operations(State(state): State<Arc<PollingState>>) -> impl IntoResponse {
    Json(state.dispatcher.describe())
}

async fn handle_submit(
    State(state): State<Arc<PollingState>>,
    Json(body): Json<SubmitRequest>,
) -> Response {
    let SubmitRequest {
        request_id,
        operation,
        version,
        params,
    } = body;

    if let Some(retained) = state.dispatcher.retained(&request_id) {
        debug!("Replaying retained fulfillment for {}", request_id);
        return (StatusCode::OK, Json(PollResponse::finished(retained))).into_response();
    }

    let done_rx = {
        let mut jobs = state.jobs();
        if let Some(job) = jobs.get(&request_id) {
            debug!("Duplicate submission for in-flight {}", request_id);
            let pending = PollResponse::pending(request_id.as_str(), job.latest_update.clone());
            return (StatusCode::ACCEPTED, Json(pending)).into_response();
        }
        jobs.insert(request_id.clone(), Job::default());

        let (done_tx, done_rx) = oneshot::channel();
        let request = InboundRequest {
            id: request_id.clone(),
            operation,
            version,
            params,
        };
        tokio::spawn(run_job(state.clone(), request, done_tx));
        done_rx
    };

    let grace = state.dispatcher.settings().submit_grace;
    if let Ok(Ok(Some(fulfillment))) = tokio::time::timeout(grace, done_rx).await {
        return (StatusCode::OK, Json(PollResponse::finished(fulfillment))).into_response();
    }

    match state.status(&request_id) {
        Some(response) if response.is_terminal() => {
            (StatusCode::OK, Json(response)).into_response()
        }
        Some(response) => (StatusCode::ACCEPTED, Json(response)).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            &ConduitError::NotFound { request_id },
        ),
    }
}

async fn handle_poll(
    State(state): State<Arc<PollingState>>,
    Path(request_id): Path<String>,
) -> Response {
    match state.status(&request_id) {
        Some(response) => (StatusCode::OK, Json(response)).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            &ConduitError::NotFound { request_id },
        ),
    }
}

async fn handle_cancel(
    State(state): State<Arc<PollingState>>,
    Path(request_id): Path<String>,
) -> Response {
    // An accepted job that has not started yet picks up the held notice.
    let running = state.dispatcher.cancel(&request_id);
    if running || state.jobs().contains_key(&request_id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        error_response(
            StatusCode::NOT_FOUND,
            &ConduitError::NotFound { request_id },
        )
    }
}

/// Execute one request, recording progress on its job entry.
async fn run_job(
    state: Arc<PollingState>,
    request: InboundRequest,
    done_tx: oneshot::Sender<Option<Fulfillment>>,
) {
    let request_id = request.id.clone();
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<PendingUpdate>();
    let dispatch = state.dispatcher.dispatch(request, Some(progress_tx));
    tokio::pin!(dispatch);

    let outcome = loop {
        tokio::select! {
            biased;
            Some(update) = progress_rx.recv() => {
                if let Some(job) = state.jobs().get_mut(&update.request_id) {
                    job.latest_update = Some(update);
                }
            }
            outcome = &mut dispatch => break outcome,
        }
    };

    // The dispatcher has already retained the fulfillment, so polls that
    // miss the job entry find it there.
    state.jobs().remove(&request_id);
    let fulfillment = match outcome {
        DispatchOutcome::Completed(f) | DispatchOutcome::Replayed(f) => Some(f),
        DispatchOutcome::InFlight | DispatchOutcome::Dropped(_) => None,
    };
    let _ = done_tx.send(fulfillment);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::{self, RpcValue};
    use crate::protocol::{OperationContext, OperationRegistry, OperationResult};
    use crate::transport::polling::wire::PollStatus;
    use std::time::Duration;

    fn dispatcher() -> Arc<Dispatcher> {
        let mut ops = OperationRegistry::new();
        ops.register("Add", "1.0", |params: RpcValue, _ctx: OperationContext| async move {
            let (a, b): (i64, i64) = params.deserialize_into()?;
            OperationResult::Ok(RpcValue::from(a + b))
        })
        .unwrap();
        ops.register("Sleep", "1.0", |_p: RpcValue, ctx: OperationContext| async move {
            ctx.report_progress(serde_json::json!({"phase": "sleeping"}));
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(300)) => {}
                _ = ctx.cancellation().cancelled() => {}
            }
            OperationResult::Ok(RpcValue::Null)
        })
        .unwrap();
        Arc::new(Dispatcher::new(ops))
    }

    fn submit_body(id: &str, operation: &str, params: RpcValue) -> SubmitRequest {
        SubmitRequest {
            request_id: id.to_string(),
            operation: operation.to_string(),
            version: "1.0".to_string(),
            params: marshal::serialize(&params),
        }
    }

    #[tokio::test]
    async fn test_server_starts_and_reports_health() {
        let mut handle = start_server(dispatcher(), "127.0.0.1", 0).await.unwrap();
        assert!(handle.addr().port() > 0);

        let body: serde_json::Value = reqwest::get(format!("http://{}/health", handle.addr()))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_fast_operation_answers_inline() {
        let handle = start_server(dispatcher(), "127.0.0.1", 0).await.unwrap();
        let client = reqwest::Client::new();
        let params = RpcValue::from(vec![RpcValue::from(2i64), RpcValue::from(3i64)]);

        let response = client
            .post(format!("http://{}/requests", handle.addr()))
            .json(&submit_body("r1", "Add", params))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let poll: PollResponse = response.json().await.unwrap();
        assert_eq!(poll.status, PollStatus::Resolved);
        assert_eq!(
            poll.fulfillment.unwrap().into_outcome().unwrap(),
            RpcValue::from(5i64)
        );
    }

    #[tokio::test]
    async fn test_slow_operation_polls_pending_then_resolves() {
        let handle = start_server(dispatcher(), "127.0.0.1", 0).await.unwrap();
        let client = reqwest::Client::new();
        let base = format!("http://{}", handle.addr());

        let response = client
            .post(format!("{}/requests", base))
            .json(&submit_body("s1", "Sleep", RpcValue::Null))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);

        let poll: PollResponse = client
            .get(format!("{}/requests/s1", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(poll.status, PollStatus::Pending);
        assert_eq!(poll.update.unwrap().metadata["phase"], "sleeping");

        tokio::time::sleep(Duration::from_millis(400)).await;
        let poll: PollResponse = client
            .get(format!("{}/requests/s1", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(poll.status, PollStatus::Resolved);
    }

    #[tokio::test]
    async fn test_unknown_request_is_404() {
        let handle = start_server(dispatcher(), "127.0.0.1", 0).await.unwrap();
        let response = reqwest::get(format!("http://{}/requests/nope", handle.addr()))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
        let body: ErrorBody = response.json().await.unwrap();
        assert_eq!(body.code, -32006);
    }

    #[tokio::test]
    async fn test_delete_cancels_running_job() {
        let handle = start_server(dispatcher(), "127.0.0.1", 0).await.unwrap();
        let client = reqwest::Client::new();
        let base = format!("http://{}", handle.addr());

        client
            .post(format!("{}/requests", base))
            .json(&submit_body("c1", "Sleep", RpcValue::Null))
            .send()
            .await
            .unwrap();
        let response = client
            .delete(format!("{}/requests/c1", base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let response = client
            .delete(format!("{}/requests/c1", base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_operations_listing() {
        let handle = start_server(dispatcher(), "127.0.0.1", 0).await.unwrap();
        let listing: Vec<crate::protocol::InterfaceDescriptor> =
            reqwest::get(format!("http://{}/operations", handle.addr()))
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].operation_names, vec!["Add", "Sleep"]);
    }
}

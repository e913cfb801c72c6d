//! Frontend side of the polling transport, built on reqwest.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::json;
use tokio::task::AbortHandle;
use tracing::{debug, warn};
use url::Url;

use super::wire::{ErrorBody, PollResponse, SubmitRequest};
use crate::config::PollingSettings;
use crate::error::{ConduitError, Result};
use crate::fulfillment::PendingUpdate;
use crate::protocol::InterfaceDescriptor;
use crate::request::{OutboundRequest, RequestRegistry};
use crate::transport::Transport;

/// Transport that submits over HTTP and polls for the outcome.
pub struct PollingTransport {
    client: Client,
    base: Url,
    registry: Arc<RequestRegistry>,
    settings: PollingSettings,
    pollers: Mutex<Vec<AbortHandle>>,
}

impl PollingTransport {
    /// Create a transport for the backend at `base_url` (e.g.
    /// `http://127.0.0.1:8080`).
    pub fn new(
        base_url: &str,
        registry: Arc<RequestRegistry>,
        settings: PollingSettings,
    ) -> Result<Self> {
        let base = Url::parse(base_url).map_err(|e| ConduitError::Config {
            message: format!("invalid backend URL {}: {}", base_url, e),
        })?;
        if base.cannot_be_a_base() {
            return Err(ConduitError::Config {
                message: format!("backend URL {} cannot carry paths", base_url),
            });
        }

        let client = Client::builder()
            .timeout(settings.http_timeout)
            .user_agent(concat!("conduit/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConduitError::Http {
                message: format!("Failed to create HTTP client: {}", e),
                status_code: None,
            })?;

        Ok(Self {
            client,
            base,
            registry,
            settings,
            pollers: Mutex::new(Vec::new()),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        // Bases that cannot carry paths are refused in new().
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Whether the backend answers its health check.
    pub async fn health(&self) -> Result<bool> {
        let response = self.client.get(self.endpoint(&["health"])).send().await?;
        Ok(response.status().is_success())
    }

    fn spawn_poller(&self, request_id: String) {
        let task = tokio::spawn(poll_loop(
            self.client.clone(),
            self.endpoint(&["requests", &request_id]),
            self.registry.clone(),
            self.settings.clone(),
            request_id,
        ));

        let mut pollers = self.pollers.lock().unwrap_or_else(|p| p.into_inner());
        pollers.retain(|handle| !handle.is_finished());
        pollers.push(task.abort_handle());
    }
}

impl Drop for PollingTransport {
    fn drop(&mut self) {
        let pollers = self.pollers.get_mut().unwrap_or_else(|p| p.into_inner());
        for handle in pollers.drain(..) {
            handle.abort();
        }
    }
}

#[async_trait]
impl Transport for PollingTransport {
    fn name(&self) -> &'static str {
        "polling"
    }

    async fn submit(&self, request: OutboundRequest) -> Result<()> {
        let body = SubmitRequest {
            request_id: request.id.clone(),
            operation: request.operation,
            version: request.version,
            params: request.params,
        };
        let response = self
            .client
            .post(self.endpoint(&["requests"]))
            .json(&body)
            .send()
            .await
            .map_err(|e| ConduitError::Http {
                message: format!("POST requests failed: {}", e),
                status_code: e.status().map(|s| s.as_u16()),
            })?;

        match response.status() {
            StatusCode::OK => {
                let poll: PollResponse = response.json().await?;
                apply(&self.registry, poll, 0);
            }
            StatusCode::ACCEPTED => {
                debug!("Backend accepted {}; polling", request.id);
                self.spawn_poller(request.id);
            }
            _ => return Err(error_from_response(response, &request.id).await),
        }
        Ok(())
    }

    async fn cancel(&self, request_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.endpoint(&["requests", request_id]))
            .send()
            .await?;
        match response.status() {
            // Not running any more; nothing to stop.
            s if s.is_success() || s == StatusCode::NOT_FOUND => Ok(()),
            _ => Err(error_from_response(response, request_id).await),
        }
    }

    async fn describe_operations(&self) -> Result<Vec<InterfaceDescriptor>> {
        let response = self.client.get(self.endpoint(&["operations"])).send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(response, "operations").await);
        }
        Ok(response.json().await?)
    }
}

/// Poll one request until it is terminal, no longer live, or unknown to the
/// backend.
async fn poll_loop(
    client: Client,
    url: Url,
    registry: Arc<RequestRegistry>,
    settings: PollingSettings,
    request_id: String,
) {
    let mut interval = settings.poll_interval;
    let mut polls: u64 = 0;

    loop {
        tokio::time::sleep(interval).await;
        if !registry.is_live(&request_id) {
            debug!("Stopped polling {}: no longer live", request_id);
            return;
        }

        match poll_once(&client, &url, &request_id).await {
            Ok(poll) => {
                polls += 1;
                if apply(&registry, poll, polls) {
                    return;
                }
            }
            Err(e @ ConduitError::NotFound { .. }) => {
                warn!("Backend lost request {}", request_id);
                registry.reject(&request_id, e);
                return;
            }
            Err(e) => {
                debug!("Poll for {} failed, retrying: {}", request_id, e);
            }
        }
        interval = settings.next_interval(interval);
    }
}

async fn poll_once(client: &Client, url: &Url, request_id: &str) -> Result<PollResponse> {
    let response = client.get(url.clone()).send().await?;
    if response.status() != StatusCode::OK {
        return Err(error_from_response(response, request_id).await);
    }
    Ok(response.json().await?)
}

/// Feed a poll response into the registry. Returns true when terminal.
fn apply(registry: &RequestRegistry, poll: PollResponse, sequence: u64) -> bool {
    match poll.fulfillment {
        Some(fulfillment) => {
            registry.fulfill(fulfillment);
            true
        }
        None => {
            let metadata = poll
                .update
                .map(|update| update.metadata)
                .unwrap_or_else(|| json!({}));
            registry.pending_update(PendingUpdate::new(poll.request_id, sequence.max(1), metadata));
            false
        }
    }
}

async fn error_from_response(response: Response, request_id: &str) -> ConduitError {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return ConduitError::NotFound {
            request_id: request_id.to_string(),
        };
    }
    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => format!("backend answered {}", status),
    };
    ConduitError::Http {
        message,
        status_code: Some(status.as_u16()),
    }
}

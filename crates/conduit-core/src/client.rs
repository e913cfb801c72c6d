//! Frontend entry point.
//!
//! [`RpcClient`] ties a [`RequestRegistry`] to one [`Transport`]. The request
//! lifecycle is identical for every transport; the client never branches on
//! which one it holds.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{ClientSettings, Settings};
use crate::error::Result;
use crate::marshal::{self, RpcValue};
use crate::protocol::InterfaceDescriptor;
use crate::request::{OutboundRequest, RegistryStats, RequestHandle, RequestRegistry};
use crate::transport::channel::{ChannelTransport, MessageSink, MessageSource};
use crate::transport::polling::PollingTransport;
use crate::transport::Transport;

/// Per-call overrides for [`RpcClient::submit_with`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Caller-supplied id; a random one is generated otherwise.
    pub request_id: Option<String>,
    /// Overrides [`ClientSettings::request_timeout`].
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn with_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Issues remote operation calls over one transport.
pub struct RpcClient {
    registry: Arc<RequestRegistry>,
    transport: Arc<dyn Transport>,
    settings: ClientSettings,
    required_interfaces: HashMap<String, String>,
}

impl RpcClient {
    /// Build a client around an existing registry and transport. The
    /// transport must report into the same registry.
    pub fn new(
        registry: Arc<RequestRegistry>,
        transport: Arc<dyn Transport>,
        settings: ClientSettings,
    ) -> Self {
        Self {
            registry,
            transport,
            settings,
            required_interfaces: HashMap::new(),
        }
    }

    /// Client over a host channel (in-process or any other sink/source pair).
    pub fn over_channel<S, R>(sink: S, source: R, settings: ClientSettings) -> Self
    where
        S: MessageSink,
        R: MessageSource,
    {
        let registry = Arc::new(RequestRegistry::new());
        let transport = ChannelTransport::new(sink, source, registry.clone())
            .with_describe_timeout(settings.request_timeout);
        Self::new(registry, Arc::new(transport), settings)
    }

    /// Client over a TCP channel to a listening channel server.
    pub async fn connect_channel(addr: SocketAddr, settings: &Settings) -> Result<Self> {
        let registry = Arc::new(RequestRegistry::new());
        let transport =
            ChannelTransport::connect(addr, settings.max_message_size(), registry.clone())
                .await?
                .with_describe_timeout(settings.client.request_timeout);
        Ok(Self::new(registry, Arc::new(transport), settings.client.clone()))
    }

    /// Client over the HTTP polling transport.
    pub fn over_polling(base_url: &str, settings: &Settings) -> Result<Self> {
        let registry = Arc::new(RequestRegistry::new());
        let transport = PollingTransport::new(base_url, registry.clone(), settings.polling.clone())?;
        Ok(Self::new(registry, Arc::new(transport), settings.client.clone()))
    }

    /// Declare an interface version this frontend expects. Used to compute
    /// `compatible` in [`describe_available_operations`](Self::describe_available_operations).
    pub fn require_interface(
        mut self,
        interface_name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        self.required_interfaces
            .insert(interface_name.into(), version.into());
        self
    }

    /// Submit a call. Await the returned handle for its value.
    pub async fn submit(
        &self,
        operation: &str,
        version: &str,
        params: RpcValue,
    ) -> Result<RequestHandle> {
        self.submit_with(operation, version, params, RequestOptions::default())
            .await
    }

    /// Submit a call with an explicit id and/or timeout.
    ///
    /// Fails immediately only when the id is already live. A transport
    /// failure rejects the request, and the handle resolves to that error.
    pub async fn submit_with(
        &self,
        operation: &str,
        version: &str,
        params: RpcValue,
        options: RequestOptions,
    ) -> Result<RequestHandle> {
        let request_id = options
            .request_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let request = OutboundRequest::new(
            request_id.clone(),
            operation,
            version,
            marshal::serialize(&params),
        );

        let outcome = self.registry.register(&request)?;
        let handle = RequestHandle::new(
            request_id.clone(),
            outcome,
            self.registry.clone(),
            self.transport.clone(),
        );

        debug!(
            "Submitting {} v{} as {} over {}",
            operation,
            version,
            request_id,
            self.transport.name()
        );

        // The deadline covers the send as well as the wait for an answer.
        let timeout = options.timeout.unwrap_or(self.settings.request_timeout);
        self.registry.arm_timeout(&request_id, timeout);
        let guard = AbandonGuard::new(&self.registry, &request_id);

        match tokio::time::timeout(timeout, self.transport.submit(request)).await {
            Ok(Ok(())) => {
                self.registry.mark_submitted(&request_id);
            }
            Ok(Err(e)) => {
                warn!("Sending {} failed: {}", request_id, e);
                self.registry.reject(&request_id, e);
            }
            Err(_) => {
                warn!("Sending {} stalled for {:?}", request_id, timeout);
                // The armed timer usually gets there first.
                if self.registry.is_live(&request_id) {
                    self.registry.time_out(&request_id, timeout);
                }
            }
        }
        guard.disarm();
        Ok(handle)
    }

    /// Submit and wait for the value.
    pub async fn call(&self, operation: &str, version: &str, params: RpcValue) -> Result<RpcValue> {
        self.submit(operation, version, params).await?.await
    }

    /// Interfaces the backend serves, with `compatible` computed against the
    /// versions declared through [`require_interface`](Self::require_interface).
    /// Interfaces without a declared requirement are reported compatible.
    pub async fn describe_available_operations(&self) -> Result<Vec<InterfaceDescriptor>> {
        let mut interfaces = self.transport.describe_operations().await?;
        for interface in &mut interfaces {
            interface.compatible = match self.required_interfaces.get(&interface.interface_name) {
                Some(required) => interface.is_compatible_with(required),
                None => true,
            };
        }
        Ok(interfaces)
    }

    pub fn registry(&self) -> &Arc<RequestRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }
}

/// Cancels a registered request if the submitting future is dropped while
/// the transport is still sending.
struct AbandonGuard<'a> {
    registry: &'a RequestRegistry,
    request_id: &'a str,
    armed: bool,
}

impl<'a> AbandonGuard<'a> {
    fn new(registry: &'a RequestRegistry, request_id: &'a str) -> Self {
        Self {
            registry,
            request_id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.registry.cancel(self.request_id) {
            debug!("Submission of {} abandoned mid-send", self.request_id);
        }
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("transport", &self.transport.name())
            .field("live_requests", &self.registry.len())
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConduitError;
    use crate::protocol::{OperationContext, OperationRegistry, OperationResult};
    use crate::request::RequestState;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records submissions and never answers.
    #[derive(Default)]
    struct SilentTransport {
        submitted: Mutex<Vec<String>>,
        cancelled: Mutex<Vec<String>>,
        fail_submit: bool,
        stall_submit: bool,
    }

    #[async_trait]
    impl Transport for SilentTransport {
        fn name(&self) -> &'static str {
            "silent"
        }

        async fn submit(&self, request: OutboundRequest) -> Result<()> {
            if self.fail_submit {
                return Err(ConduitError::transport("link down"));
            }
            if self.stall_submit {
                std::future::pending::<()>().await;
            }
            self.submitted.lock().unwrap().push(request.id);
            Ok(())
        }

        async fn cancel(&self, request_id: &str) -> Result<()> {
            self.cancelled.lock().unwrap().push(request_id.to_string());
            Ok(())
        }

        async fn describe_operations(&self) -> Result<Vec<InterfaceDescriptor>> {
            let mut ops = OperationRegistry::new();
            ops.register_in("math", "Add", "1.2", |p: RpcValue, _c: OperationContext| async move {
                OperationResult::Ok(p)
            })?;
            Ok(ops.describe())
        }
    }

    fn client(transport: Arc<SilentTransport>, timeout: Duration) -> RpcClient {
        RpcClient::new(
            Arc::new(RequestRegistry::new()),
            transport,
            ClientSettings {
                request_timeout: timeout,
            },
        )
    }

    #[tokio::test]
    async fn test_submit_moves_to_submitted() {
        let transport = Arc::new(SilentTransport::default());
        let client = client(transport.clone(), Duration::from_secs(5));
        let handle = client.submit("Add", "1.0", RpcValue::Null).await.unwrap();
        assert_eq!(handle.state(), Some(RequestState::Submitted));
        assert_eq!(transport.submitted.lock().unwrap().as_slice(), [handle.id().to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_live_id_rejected() {
        let client = client(Arc::new(SilentTransport::default()), Duration::from_secs(5));
        let options = RequestOptions::default().with_id("fixed");
        let _first = client
            .submit_with("Add", "1.0", RpcValue::Null, options.clone())
            .await
            .unwrap();
        let err = client
            .submit_with("Add", "1.0", RpcValue::Null, options)
            .await
            .unwrap_err();
        assert!(matches!(err, ConduitError::DuplicateRequest { .. }));
    }

    #[tokio::test]
    async fn test_timeout_rejects() {
        let client = client(Arc::new(SilentTransport::default()), Duration::from_millis(30));
        let started = std::time::Instant::now();
        let err = client.call("Add", "1.0", RpcValue::Null).await.unwrap_err();
        assert!(matches!(err, ConduitError::TimedOut(_)));
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(client.stats().timed_out, 1);
        assert!(client.registry().is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_rejects_handle() {
        let transport = Arc::new(SilentTransport {
            fail_submit: true,
            ..SilentTransport::default()
        });
        let client = client(transport, Duration::from_secs(5));
        let handle = client.submit("Add", "1.0", RpcValue::Null).await.unwrap();
        assert!(matches!(handle.await, Err(ConduitError::Transport { .. })));
        assert_eq!(client.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_stalled_send_times_out() {
        let transport = Arc::new(SilentTransport {
            stall_submit: true,
            ..SilentTransport::default()
        });
        let client = client(transport, Duration::from_millis(100));
        let started = std::time::Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            client.call("Add", "1.0", RpcValue::Null),
        )
        .await
        .expect("call must resolve on its own timeout");

        assert!(matches!(result, Err(ConduitError::TimedOut(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(client.stats().timed_out, 1);
        assert!(client.registry().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_submit_releases_entry() {
        let transport = Arc::new(SilentTransport {
            stall_submit: true,
            ..SilentTransport::default()
        });
        let client = client(transport, Duration::from_secs(5));
        let options = RequestOptions::default().with_id("fixed");

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            client.submit_with("Add", "1.0", RpcValue::Null, options.clone()),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(client.registry().is_empty());
        assert_eq!(client.stats().cancelled, 1);

        // The id is free again.
        let request = OutboundRequest::new("fixed", "Add", "1.0", marshal::serialize(&RpcValue::Null));
        assert!(client.registry().register(&request).is_ok());
    }

    #[tokio::test]
    async fn test_cancel_sends_notice() {
        let transport = Arc::new(SilentTransport::default());
        let client = client(transport.clone(), Duration::from_secs(5));
        let handle = client.submit("Add", "1.0", RpcValue::Null).await.unwrap();
        let id = handle.id().to_string();
        assert!(handle.cancel());
        assert!(matches!(handle.await, Err(ConduitError::Cancelled)));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.cancelled.lock().unwrap().as_slice(), [id]);
    }

    #[tokio::test]
    async fn test_describe_computes_compatibility() {
        let transport = Arc::new(SilentTransport::default());
        let listing = client(transport.clone(), Duration::from_secs(5))
            .require_interface("math", "1.0")
            .describe_available_operations()
            .await
            .unwrap();
        assert!(listing[0].compatible);

        let listing = client(transport, Duration::from_secs(5))
            .require_interface("math", "2.0")
            .describe_available_operations()
            .await
            .unwrap();
        assert!(!listing[0].compatible);
    }
}

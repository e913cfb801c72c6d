//! Frontend side of the channel transport.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::framing::send_payload;
use super::host::{MessageSink, MessageSource};
use super::reassembly::{CompletedMessage, ReassemblyTable};
use super::tcp;
use super::wire::{ChannelMessage, ControlMessage, HeaderBody};
use crate::config::{ChannelConfig, ClientConfig};
use crate::error::{ConduitError, Result};
use crate::fulfillment::Fulfillment;
use crate::marshal::{RpcValue, SerializedValue};
use crate::protocol::{InterfaceDescriptor, DESCRIBE_OPERATION, DESCRIBE_VERSION};
use crate::request::{OutboundRequest, RequestRegistry};
use crate::transport::Transport;

/// Transport over a bounded-size message channel.
///
/// Owns a background receive loop that reassembles fulfillments and routes
/// them, along with pending updates, into the registry. Dropping the
/// transport stops the loop.
pub struct ChannelTransport {
    sink: Arc<dyn MessageSink>,
    registry: Arc<RequestRegistry>,
    describe_timeout: Duration,
    receiver: JoinHandle<()>,
}

impl ChannelTransport {
    pub fn new<S, R>(sink: S, source: R, registry: Arc<RequestRegistry>) -> Self
    where
        S: MessageSink,
        R: MessageSource,
    {
        let receiver = tokio::spawn(receive_loop(source, registry.clone()));
        Self {
            sink: Arc::new(sink),
            registry,
            describe_timeout: ClientConfig::REQUEST_TIMEOUT,
            receiver,
        }
    }

    /// Connect to a [`ChannelServer`](super::ChannelServer) listening on TCP.
    pub async fn connect(
        addr: SocketAddr,
        max_message_size: usize,
        registry: Arc<RequestRegistry>,
    ) -> Result<Self> {
        let (sink, source) = tcp::connect(addr, max_message_size).await?;
        Ok(Self::new(sink, source, registry))
    }

    pub fn with_describe_timeout(mut self, timeout: Duration) -> Self {
        self.describe_timeout = timeout;
        self
    }

    /// Whether the receive loop is still running.
    pub fn is_connected(&self) -> bool {
        !self.receiver.is_finished()
    }
}

impl Drop for ChannelTransport {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn submit(&self, request: OutboundRequest) -> Result<()> {
        let OutboundRequest {
            id,
            operation,
            version,
            params,
            ..
        } = request;
        let body = HeaderBody::Request {
            operation,
            version,
            params: params.objects,
        };
        send_payload(self.sink.as_ref(), &id, body, &params.chunks).await?;
        Ok(())
    }

    async fn cancel(&self, request_id: &str) -> Result<()> {
        self.sink
            .send(ChannelMessage::Control(ControlMessage::Cancel {
                request_id: request_id.to_string(),
            }))
            .await
    }

    async fn describe_operations(&self) -> Result<Vec<InterfaceDescriptor>> {
        let request = OutboundRequest::new(
            format!("describe-{}", uuid::Uuid::new_v4()),
            DESCRIBE_OPERATION,
            DESCRIBE_VERSION,
            SerializedValue::default(),
        );
        let request_id = request.id.clone();
        let outcome = self.registry.register(&request)?;
        self.registry.arm_timeout(&request_id, self.describe_timeout);
        match tokio::time::timeout(self.describe_timeout, self.submit(request)).await {
            Ok(Ok(())) => {
                self.registry.mark_submitted(&request_id);
            }
            Ok(Err(e)) => {
                self.registry
                    .reject(&request_id, ConduitError::transport(e.to_string()));
                return Err(e);
            }
            Err(_) => {
                if self.registry.is_live(&request_id) {
                    self.registry.time_out(&request_id, self.describe_timeout);
                }
                return Err(ConduitError::TimedOut(self.describe_timeout));
            }
        }

        let listing: RpcValue = outcome
            .await
            .map_err(|_| ConduitError::transport("describe request was dropped"))??;
        listing.deserialize_into()
    }
}

async fn receive_loop<R: MessageSource>(mut source: R, registry: Arc<RequestRegistry>) {
    let mut table = ReassemblyTable::new();
    let mut last_eviction = Instant::now();

    loop {
        match source.recv().await {
            Ok(Some(message)) => handle_message(&mut table, &registry, message),
            Ok(None) => {
                info!("Channel closed by backend");
                break;
            }
            Err(e @ (ConduitError::MalformedValue { .. } | ConduitError::Json { .. })) => {
                warn!("Dropping undecodable channel message: {}", e);
            }
            Err(e) => {
                warn!("Channel receive failed: {}", e);
                break;
            }
        }

        if last_eviction.elapsed() >= ChannelConfig::EVICTION_INTERVAL {
            table.evict_stale(ChannelConfig::PARTIAL_RECEPTION_TTL);
            last_eviction = Instant::now();
        }
    }
}

fn handle_message(table: &mut ReassemblyTable, registry: &RequestRegistry, message: ChannelMessage) {
    let completed = match message {
        ChannelMessage::Control(ControlMessage::Header(header)) => table.accept_header(header),
        ChannelMessage::Data(data) => table.accept_data(data),
        ChannelMessage::Control(ControlMessage::Update(update)) => {
            registry.pending_update(update);
            return;
        }
        ChannelMessage::Control(ControlMessage::Cancel { request_id }) => {
            debug!("Ignoring cancel notice for {} on the frontend", request_id);
            return;
        }
    };

    match completed {
        Ok(Some(message)) => deliver(registry, message),
        Ok(None) => {}
        Err(e) => warn!("Dropping channel message: {}", e),
    }
}

fn deliver(registry: &RequestRegistry, message: CompletedMessage) {
    let CompletedMessage { header, chunks } = message;
    match header.body {
        HeaderBody::Fulfillment {
            status,
            error,
            diagnostics,
            result,
        } => {
            registry.fulfill(Fulfillment {
                request_id: header.request_id,
                status,
                result: SerializedValue {
                    objects: result,
                    chunks,
                },
                error,
                diagnostics,
            });
        }
        HeaderBody::Request { operation, .. } => {
            warn!(
                "Frontend received a request ({} for {}); dropping",
                operation, header.request_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fulfillment::{DiagnosticMetadata, FulfillmentStatus, PendingUpdate};
    use crate::marshal;
    use crate::transport::channel::host::memory_channel;
    use crate::transport::channel::wire::{DataMessage, HeaderMessage};
    use bytes::Bytes;
    use serde_json::json;

    #[tokio::test]
    async fn test_submit_sends_header_and_chunks() {
        let (front, back) = memory_channel(200);
        let (sink, source) = front.split();
        let (_back_sink, mut back_source) = back.split();
        let registry = Arc::new(RequestRegistry::new());
        let transport = ChannelTransport::new(sink, source, registry);

        let payload: Vec<u8> = (0..300).map(|i| (i % 251) as u8).collect();
        let params = marshal::serialize(&RpcValue::from(payload.clone()));
        transport
            .submit(OutboundRequest::new("r1", "Echo", "1.0", params))
            .await
            .unwrap();

        let mut table = ReassemblyTable::new();
        let mut completed = None;
        while completed.is_none() {
            let message = back_source.recv().await.unwrap().unwrap();
            completed = match message {
                ChannelMessage::Control(ControlMessage::Header(h)) => table.accept_header(h),
                ChannelMessage::Data(d) => table.accept_data(d),
                other => panic!("unexpected message: {:?}", other),
            }
            .unwrap();
        }
        let completed = completed.unwrap();
        assert_eq!(completed.header.chunk_count, 2);
        assert_eq!(completed.header.segments, vec![2]);
        assert_eq!(completed.chunks, vec![Bytes::from(payload)]);
    }

    #[tokio::test]
    async fn test_fulfillment_and_updates_reach_registry() {
        let (front, back) = memory_channel(1024);
        let (sink, source) = front.split();
        let (back_sink, _back_source) = back.split();
        let registry = Arc::new(RequestRegistry::new());
        let _transport = ChannelTransport::new(sink, source, registry.clone());

        let request = OutboundRequest::new("r1", "Echo", "1.0", SerializedValue::default());
        let outcome = registry.register(&request).unwrap();
        registry.mark_submitted("r1");

        back_sink
            .send(ChannelMessage::Control(ControlMessage::Update(
                PendingUpdate::new("r1", 1, json!({"step": 1})),
            )))
            .await
            .unwrap();

        // Data first, header second.
        back_sink
            .send(ChannelMessage::Data(DataMessage {
                request_id: "r1".into(),
                chunk_index: 0,
                data: Bytes::from_static(b"ok"),
            }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        back_sink
            .send(ChannelMessage::Control(ControlMessage::Header(
                HeaderMessage {
                    request_id: "r1".into(),
                    chunk_count: 1,
                    segments: vec![1],
                    body: HeaderBody::Fulfillment {
                        status: FulfillmentStatus::Success,
                        error: None,
                        diagnostics: DiagnosticMetadata::new("Echo", "1.0", 1),
                        result: json!({"$binary": 0}),
                    },
                },
            )))
            .await
            .unwrap();

        let value = tokio::time::timeout(Duration::from_secs(1), outcome)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(value, RpcValue::Binary(Bytes::from_static(b"ok")));
        assert_eq!(registry.stats().resolved, 1);
    }

    #[tokio::test]
    async fn test_cancel_sends_notice() {
        let (front, back) = memory_channel(64);
        let (sink, source) = front.split();
        let (_back_sink, mut back_source) = back.split();
        let transport = ChannelTransport::new(sink, source, Arc::new(RequestRegistry::new()));

        transport.cancel("r7").await.unwrap();
        assert_eq!(
            back_source.recv().await.unwrap(),
            Some(ChannelMessage::Control(ControlMessage::Cancel {
                request_id: "r7".into()
            }))
        );
    }

    #[tokio::test]
    async fn test_describe_times_out_without_backend() {
        let (front, back) = memory_channel(1024);
        let (sink, source) = front.split();
        let transport = ChannelTransport::new(sink, source, Arc::new(RequestRegistry::new()))
            .with_describe_timeout(Duration::from_millis(50));

        let err = transport.describe_operations().await.unwrap_err();
        assert!(matches!(err, ConduitError::TimedOut(_)));
        drop(back);
    }
}

//! Backend side of the channel transport.
//!
//! A serve loop reads one host channel, reassembles requests, and spawns a
//! dispatch per completed request. Fulfillments and progress updates go back
//! over the same channel. [`ChannelServer::listen`] accepts TCP connections
//! and runs one serve loop per connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::framing::send_payload;
use super::host::{MessageSink, MessageSource};
use super::reassembly::{CompletedMessage, ReassemblyTable};
use super::tcp;
use super::wire::{ChannelMessage, ControlMessage, HeaderBody};
use crate::config::ChannelConfig;
use crate::error::{ConduitError, Result};
use crate::fulfillment::{DiagnosticMetadata, ErrorDescriptor, Fulfillment};
use crate::marshal::{RpcValue, SerializedValue};
use crate::protocol::{
    DispatchOutcome, Dispatcher, InboundRequest, DESCRIBE_OPERATION, DESCRIBE_VERSION,
};

/// Handle to one serve loop. Dropping stops it.
pub struct ChannelServerHandle {
    task: Option<JoinHandle<()>>,
}

impl ChannelServerHandle {
    /// Stop serving. Dispatches already running finish on their own.
    pub fn shutdown(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Wait until the peer closes the channel.
    pub async fn closed(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ChannelServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle to a running TCP channel listener. Dropping shuts it down.
pub struct ChannelListenerHandle {
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<JoinHandle<()>>,
}

impl ChannelListenerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting and close every open connection.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for ChannelListenerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Channel transport backend.
pub struct ChannelServer;

impl ChannelServer {
    /// Serve requests arriving on one host channel.
    pub fn serve<S, R>(sink: S, source: R, dispatcher: Arc<Dispatcher>) -> ChannelServerHandle
    where
        S: MessageSink,
        R: MessageSource,
    {
        let sink: Arc<dyn MessageSink> = Arc::new(sink);
        ChannelServerHandle {
            task: Some(tokio::spawn(Self::serve_loop(sink, source, dispatcher))),
        }
    }

    /// Listen for TCP connections on `addr`, one serve loop per connection.
    pub async fn listen(
        addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        max_message_size: usize,
    ) -> Result<ChannelListenerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        info!("Channel server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            dispatcher,
            max_message_size,
            shutdown_rx,
            conn_shutdown_rx,
        ));

        Ok(ChannelListenerHandle {
            addr,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        dispatcher: Arc<Dispatcher>,
        max_message_size: usize,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
    ) {
        let active_connections = Arc::new(AtomicUsize::new(0));
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Channel server shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Channel accept error: {}", e);
                            continue;
                        }
                    };
                    if active_connections.load(Ordering::Relaxed) >= ChannelConfig::MAX_TCP_CONNECTIONS {
                        warn!(
                            "Rejecting channel connection from {}: at max capacity ({})",
                            peer_addr,
                            ChannelConfig::MAX_TCP_CONNECTIONS
                        );
                        continue;
                    }
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Could not disable Nagle for {}: {}", peer_addr, e);
                    }

                    active_connections.fetch_add(1, Ordering::Relaxed);
                    let conns = active_connections.clone();
                    let dispatcher = dispatcher.clone();
                    let mut conn_shutdown = conn_shutdown_rx.clone();
                    tokio::spawn(async move {
                        debug!("Channel connection from {}", peer_addr);
                        let (sink, source) = tcp::split_stream(stream, max_message_size);
                        let handle = Self::serve(sink, source, dispatcher);
                        tokio::select! {
                            _ = handle.closed() => {
                                debug!("Channel connection {} closed", peer_addr);
                            }
                            _ = conn_shutdown.changed() => {}
                        }
                        conns.fetch_sub(1, Ordering::Relaxed);
                    });
                }
            }
        }
    }

    async fn serve_loop<R: MessageSource>(
        sink: Arc<dyn MessageSink>,
        mut source: R,
        dispatcher: Arc<Dispatcher>,
    ) {
        let mut table = ReassemblyTable::new();
        let mut last_eviction = Instant::now();

        loop {
            let message = match source.recv().await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    debug!("Channel closed by frontend");
                    break;
                }
                Err(e @ (ConduitError::MalformedValue { .. } | ConduitError::Json { .. })) => {
                    warn!("Dropping undecodable channel message: {}", e);
                    continue;
                }
                Err(e) => {
                    warn!("Channel receive failed: {}", e);
                    break;
                }
            };

            let completed = match message {
                ChannelMessage::Control(ControlMessage::Header(header)) => {
                    table.accept_header(header)
                }
                ChannelMessage::Data(data) => table.accept_data(data),
                ChannelMessage::Control(ControlMessage::Cancel { request_id }) => {
                    let running = dispatcher.cancel(&request_id);
                    let partial = table.discard(&request_id);
                    debug!(
                        "Cancel notice for {} (running: {}, partial: {})",
                        request_id, running, partial
                    );
                    Ok(None)
                }
                ChannelMessage::Control(ControlMessage::Update(update)) => {
                    debug!("Ignoring pending update for {} on the backend", update.request_id);
                    Ok(None)
                }
            };

            match completed {
                Ok(Some(message)) => Self::spawn_request(&sink, &dispatcher, message),
                Ok(None) => {}
                Err(e) => warn!("Dropping channel message: {}", e),
            }

            if last_eviction.elapsed() >= ChannelConfig::EVICTION_INTERVAL {
                table.evict_stale(ChannelConfig::PARTIAL_RECEPTION_TTL);
                last_eviction = Instant::now();
            }
        }
    }

    fn spawn_request(
        sink: &Arc<dyn MessageSink>,
        dispatcher: &Arc<Dispatcher>,
        message: CompletedMessage,
    ) {
        let CompletedMessage { header, chunks } = message;
        let HeaderBody::Request {
            operation,
            version,
            params,
        } = header.body
        else {
            warn!(
                "Backend received a fulfillment for {}; dropping",
                header.request_id
            );
            return;
        };
        let request = InboundRequest {
            id: header.request_id,
            operation,
            version,
            params: SerializedValue {
                objects: params,
                chunks,
            },
        };

        let sink = sink.clone();
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            let request_id = request.id.clone();
            let fulfillment = if request.operation == DESCRIBE_OPERATION {
                Some(describe(&dispatcher, &request_id))
            } else {
                dispatch_with_progress(sink.as_ref(), &dispatcher, request).await
            };
            if let Some(fulfillment) = fulfillment {
                if let Err(e) = send_fulfillment(sink.as_ref(), fulfillment).await {
                    error!("Failed to send fulfillment for {}: {}", request_id, e);
                }
            }
        });
    }
}

fn describe(dispatcher: &Dispatcher, request_id: &str) -> Fulfillment {
    describe_fulfillment(request_id, RpcValue::from_serialize(&dispatcher.describe()))
}

fn describe_fulfillment(request_id: &str, listing: Result<RpcValue>) -> Fulfillment {
    let diagnostics = DiagnosticMetadata::new(DESCRIBE_OPERATION, DESCRIBE_VERSION, 0);
    match listing {
        Ok(listing) => Fulfillment::success(request_id, &listing, diagnostics),
        Err(e) => {
            error!("Failed to build operation listing for {}: {}", request_id, e);
            Fulfillment::failure(
                request_id,
                ErrorDescriptor {
                    kind: e.kind(),
                    classification: "DescribeFailed".to_string(),
                    message: e.to_string(),
                    operation: Some(DESCRIBE_OPERATION.to_string()),
                    version: Some(DESCRIBE_VERSION.to_string()),
                },
                diagnostics,
            )
        }
    }
}

/// Run one dispatch, forwarding progress updates while it executes.
async fn dispatch_with_progress(
    sink: &dyn MessageSink,
    dispatcher: &Dispatcher,
    request: InboundRequest,
) -> Option<Fulfillment> {
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let dispatch = dispatcher.dispatch(request, Some(progress_tx));
    tokio::pin!(dispatch);

    let outcome = loop {
        tokio::select! {
            biased;
            Some(update) = progress_rx.recv() => {
                if let Err(e) = sink.send(ChannelMessage::Control(ControlMessage::Update(update))).await {
                    debug!("Failed to forward pending update: {}", e);
                }
            }
            outcome = &mut dispatch => break outcome,
        }
    };
    while let Ok(update) = progress_rx.try_recv() {
        let _ = sink
            .send(ChannelMessage::Control(ControlMessage::Update(update)))
            .await;
    }

    match outcome {
        DispatchOutcome::Completed(f) | DispatchOutcome::Replayed(f) => Some(f),
        DispatchOutcome::InFlight | DispatchOutcome::Dropped(_) => None,
    }
}

async fn send_fulfillment(sink: &dyn MessageSink, fulfillment: Fulfillment) -> Result<()> {
    let Fulfillment {
        request_id,
        status,
        result,
        error,
        diagnostics,
    } = fulfillment;
    let body = HeaderBody::Fulfillment {
        status,
        error,
        diagnostics,
        result: result.objects,
    };
    send_payload(sink, &request_id, body, &result.chunks).await?;
    Ok(())
}

//! Conduit Core - RPC request/response transport and marshaling.
//!
//! A frontend issues a remote operation call; the call, including binary
//! parameters of any size, crosses a process or network boundary; a backend
//! dispatches and executes it; and the result comes back and is reassembled.
//!
//! Two transports sit behind one [`Transport`] contract:
//!
//! - the channel transport splits payloads into chunks no larger than the
//!   host's message limit and reassembles them in any arrival order;
//! - the polling transport submits over HTTP and polls for completion.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use conduit_core::{
//!     ChannelServer, ClientSettings, Dispatcher, OperationContext, OperationRegistry,
//!     OperationResult, RpcClient, RpcValue,
//! };
//! use conduit_core::transport::channel::memory_channel;
//!
//! #[tokio::main]
//! async fn main() -> conduit_core::Result<()> {
//!     let mut ops = OperationRegistry::new();
//!     ops.register("Add", "1.0", |params: RpcValue, _ctx: OperationContext| async move {
//!         let (a, b): (i64, i64) = params.deserialize_into()?;
//!         OperationResult::Ok(RpcValue::from(a + b))
//!     })?;
//!
//!     let (front, back) = memory_channel(1024 * 1024);
//!     let (back_sink, back_source) = back.split();
//!     let _server = ChannelServer::serve(back_sink, back_source, Arc::new(Dispatcher::new(ops)));
//!
//!     let (sink, source) = front.split();
//!     let client = RpcClient::over_channel(sink, source, ClientSettings::default());
//!     let params = RpcValue::from(vec![RpcValue::from(2i64), RpcValue::from(3i64)]);
//!     let sum = client.call("Add", "1.0", params).await?;
//!     assert_eq!(sum, RpcValue::from(5i64));
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod client;
pub mod config;
pub mod error;
pub mod fulfillment;
pub mod marshal;
pub mod protocol;
pub mod request;
pub mod transport;

// Re-export commonly used types
pub use cancel::{CancellationToken, CancelledError};
pub use client::{RequestOptions, RpcClient};
pub use config::{ClientSettings, DispatcherSettings, PollingSettings, Settings};
pub use error::{ConduitError, ErrorKind, Result};
pub use fulfillment::{DiagnosticMetadata, ErrorDescriptor, Fulfillment, FulfillmentStatus, PendingUpdate};
pub use marshal::{deserialize, serialize, RpcValue, SerializedValue};
pub use protocol::{
    DispatchOutcome, Dispatcher, InboundRequest, InterfaceDescriptor, OperationContext,
    OperationError, OperationHandler, OperationRegistry, OperationResult,
};
pub use request::{
    RegistryStats, RequestCanceller, RequestHandle, RequestRegistry, RequestState,
};
pub use transport::channel::{ChannelServer, ChannelTransport};
pub use transport::polling::PollingTransport;
pub use transport::Transport;

//! Transports carrying requests to a backend and fulfillments back.
//!
//! Both implementations sit behind [`Transport`]; the request state machine
//! only ever talks to the trait. Each transport is constructed with the
//! [`RequestRegistry`](crate::request::RequestRegistry) it reports into.
//!
//! - [`channel`]: bounded-size message channel with chunked reassembly.
//! - [`polling`]: HTTP submit-then-poll.

pub mod channel;
pub mod polling;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::InterfaceDescriptor;
use crate::request::OutboundRequest;

/// The logical contract shared by every transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Send a request. Returns once the transport accepted it; the outcome
    /// arrives later through the registry.
    async fn submit(&self, request: OutboundRequest) -> Result<()>;

    /// Best-effort notice that the caller stopped waiting.
    async fn cancel(&self, request_id: &str) -> Result<()>;

    /// Interfaces the backend currently serves.
    async fn describe_operations(&self) -> Result<Vec<InterfaceDescriptor>>;
}

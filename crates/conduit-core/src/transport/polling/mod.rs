//! Polling transport.
//!
//! The frontend submits once with `POST /requests` and then polls
//! `GET /requests/{id}` with growing intervals until the backend reports a
//! fulfillment. Fast operations are answered inline by the submit call.

pub mod client;
pub mod server;
pub mod wire;

pub use client::PollingTransport;
pub use server::{router, start_server, PollingServerHandle, PollingState};
pub use wire::{ErrorBody, PollResponse, PollStatus, SubmitRequest};

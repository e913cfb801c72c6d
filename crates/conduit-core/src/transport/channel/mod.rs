//! Channel transport.
//!
//! Requests and fulfillments travel as a JSON header on the control
//! sub-channel followed by raw binary chunks on the data sub-channel. Chunks
//! never exceed the host's maximum message size; the receiver reassembles
//! them in any arrival order.

pub mod client;
pub mod framing;
pub mod host;
pub mod reassembly;
pub mod server;
pub mod tcp;
pub mod wire;

pub use client::ChannelTransport;
pub use host::{memory_channel, MemoryEndpoint, MemorySink, MemorySource, MessageSink, MessageSource};
pub use reassembly::{CompletedMessage, PartialReception, ReassemblyTable};
pub use server::{ChannelListenerHandle, ChannelServer, ChannelServerHandle};
pub use tcp::{TcpSink, TcpSource};
pub use wire::{ChannelMessage, ControlMessage, DataMessage, HeaderBody, HeaderMessage};

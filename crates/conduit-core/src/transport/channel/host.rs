//! Host channel capabilities and the in-process host.
//!
//! A host provides exactly three things: send one message, receive one
//! message, and report its largest single-message payload. The in-process
//! host keeps separate control and data queues and receives from whichever
//! is ready first, so a header can overtake or trail its data chunks.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::wire::{ChannelMessage, ControlMessage, DataMessage};
use crate::config::ChannelConfig;
use crate::error::{ConduitError, Result};

/// Sending half of a host channel.
#[async_trait]
pub trait MessageSink: Send + Sync + 'static {
    async fn send(&self, message: ChannelMessage) -> Result<()>;

    /// Largest payload a single message may carry.
    fn max_message_size(&self) -> usize;
}

/// Receiving half of a host channel. `Ok(None)` means the peer closed.
#[async_trait]
pub trait MessageSource: Send + 'static {
    async fn recv(&mut self) -> Result<Option<ChannelMessage>>;
}

/// In-process sink.
#[derive(Debug, Clone)]
pub struct MemorySink {
    control: mpsc::Sender<ControlMessage>,
    data: mpsc::Sender<DataMessage>,
    max_message_size: usize,
}

/// In-process source.
#[derive(Debug)]
pub struct MemorySource {
    control: mpsc::Receiver<ControlMessage>,
    data: mpsc::Receiver<DataMessage>,
}

/// One side of an in-process channel pair.
#[derive(Debug)]
pub struct MemoryEndpoint {
    pub sink: MemorySink,
    pub source: MemorySource,
}

impl MemoryEndpoint {
    pub fn split(self) -> (MemorySink, MemorySource) {
        (self.sink, self.source)
    }
}

/// Create a connected pair of in-process endpoints.
pub fn memory_channel(max_message_size: usize) -> (MemoryEndpoint, MemoryEndpoint) {
    let depth = ChannelConfig::MEMORY_QUEUE_DEPTH;
    let (a_control_tx, b_control_rx) = mpsc::channel(depth);
    let (a_data_tx, b_data_rx) = mpsc::channel(depth);
    let (b_control_tx, a_control_rx) = mpsc::channel(depth);
    let (b_data_tx, a_data_rx) = mpsc::channel(depth);

    let a = MemoryEndpoint {
        sink: MemorySink {
            control: a_control_tx,
            data: a_data_tx,
            max_message_size,
        },
        source: MemorySource {
            control: a_control_rx,
            data: a_data_rx,
        },
    };
    let b = MemoryEndpoint {
        sink: MemorySink {
            control: b_control_tx,
            data: b_data_tx,
            max_message_size,
        },
        source: MemorySource {
            control: b_control_rx,
            data: b_data_rx,
        },
    };
    (a, b)
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn send(&self, message: ChannelMessage) -> Result<()> {
        match message {
            ChannelMessage::Control(control) => self
                .control
                .send(control)
                .await
                .map_err(|_| ConduitError::transport("control channel closed")),
            ChannelMessage::Data(data) => {
                if data.data.len() > self.max_message_size {
                    return Err(ConduitError::MessageTooLarge {
                        size: data.data.len(),
                        limit: self.max_message_size,
                    });
                }
                self.data
                    .send(data)
                    .await
                    .map_err(|_| ConduitError::transport("data channel closed"))
            }
        }
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<ChannelMessage>> {
        tokio::select! {
            Some(control) = self.control.recv() => Ok(Some(ChannelMessage::Control(control))),
            Some(data) = self.data.recv() => Ok(Some(ChannelMessage::Data(data))),
            else => Ok(None),
        }
    }
}

//! Stream host over TCP.
//!
//! Both sub-channels share one connection. Each message is one frame:
//!
//! ```text
//! [u32 BE: len][payload of len]   payload = encode_message(..)
//! ```

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use super::host::{MessageSink, MessageSource};
use super::wire::{decode_message, encode_message, ChannelMessage};
use crate::config::ChannelConfig;
use crate::error::{ConduitError, Result};

/// Read one length-prefixed frame. `None` on clean EOF.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    limit: usize,
) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > limit {
        return Err(ConduitError::MessageTooLarge { size: len, limit });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| ConduitError::MessageTooLarge {
        size: payload.len(),
        limit: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Sending half of a TCP host.
#[derive(Debug)]
pub struct TcpSink {
    writer: Mutex<OwnedWriteHalf>,
    max_message_size: usize,
}

/// Receiving half of a TCP host.
#[derive(Debug)]
pub struct TcpSource {
    reader: OwnedReadHalf,
    frame_limit: usize,
}

/// Split a connected stream into host halves.
pub fn split_stream(stream: TcpStream, max_message_size: usize) -> (TcpSink, TcpSource) {
    let (reader, writer) = stream.into_split();
    (
        TcpSink {
            writer: Mutex::new(writer),
            max_message_size,
        },
        TcpSource {
            reader,
            frame_limit: max_message_size + ChannelConfig::FRAME_OVERHEAD,
        },
    )
}

/// Connect to a channel server.
pub async fn connect(addr: SocketAddr, max_message_size: usize) -> Result<(TcpSink, TcpSource)> {
    let stream = tokio::time::timeout(ChannelConfig::TCP_CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| ConduitError::transport(format!("connection to {} timed out", addr)))??;
    stream.set_nodelay(true)?;
    debug!("Connected channel host to {}", addr);
    Ok(split_stream(stream, max_message_size))
}

#[async_trait]
impl MessageSink for TcpSink {
    async fn send(&self, message: ChannelMessage) -> Result<()> {
        if let ChannelMessage::Data(data) = &message {
            if data.data.len() > self.max_message_size {
                return Err(ConduitError::MessageTooLarge {
                    size: data.data.len(),
                    limit: self.max_message_size,
                });
            }
        }
        let frame = encode_message(&message)?;
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &frame)
            .await
            .map_err(|e| ConduitError::transport(format!("send failed: {}", e)))
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

#[async_trait]
impl MessageSource for TcpSource {
    async fn recv(&mut self) -> Result<Option<ChannelMessage>> {
        match read_frame(&mut self.reader, self.frame_limit).await? {
            Some(frame) => decode_message(Bytes::from(frame)).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel::wire::{ControlMessage, DataMessage};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, b"hello").await.unwrap();
        let frame = read_frame(&mut server, 1024).await.unwrap().unwrap();
        assert_eq!(frame, b"hello");
    }

    #[tokio::test]
    async fn test_frame_eof() {
        let (client, mut server) = tokio::io::duplex(1024);
        drop(client);
        assert!(read_frame(&mut server, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_over_limit() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, &[0u8; 64]).await.unwrap();
        let err = read_frame(&mut server, 16).await.unwrap_err();
        assert!(matches!(err, ConduitError::MessageTooLarge { size: 64, .. }));
    }

    #[tokio::test]
    async fn test_long_id_with_full_chunk_fits_frame_limit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            split_stream(stream, 1024)
        });

        let (sink, _source) = connect(addr, 1024).await.unwrap();
        let (_server_sink, mut server_source) = accept.await.unwrap();

        let data = ChannelMessage::Data(DataMessage {
            request_id: "x".repeat(u16::MAX as usize),
            chunk_index: 0,
            data: Bytes::from(vec![7u8; 1024]),
        });
        let sending = {
            let data = data.clone();
            tokio::spawn(async move { sink.send(data).await })
        };
        assert_eq!(server_source.recv().await.unwrap(), Some(data));
        sending.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_tcp_host_carries_both_kinds() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            split_stream(stream, 32)
        });

        let (sink, _source) = connect(addr, 32).await.unwrap();
        let (_server_sink, mut server_source) = accept.await.unwrap();

        let cancel = ChannelMessage::Control(ControlMessage::Cancel {
            request_id: "r1".into(),
        });
        let data = ChannelMessage::Data(DataMessage {
            request_id: "r1".into(),
            chunk_index: 3,
            data: Bytes::from_static(b"payload"),
        });
        sink.send(cancel.clone()).await.unwrap();
        sink.send(data.clone()).await.unwrap();

        assert_eq!(server_source.recv().await.unwrap(), Some(cancel));
        assert_eq!(server_source.recv().await.unwrap(), Some(data));

        let oversized = ChannelMessage::Data(DataMessage {
            request_id: "r1".into(),
            chunk_index: 0,
            data: Bytes::from(vec![0u8; 33]),
        });
        assert!(matches!(
            sink.send(oversized).await.unwrap_err(),
            ConduitError::MessageTooLarge { .. }
        ));
    }
}

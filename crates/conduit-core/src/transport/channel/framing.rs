//! Splitting marshaled payloads into bounded wire chunks and back.

use bytes::{Bytes, BytesMut};
use tracing::debug;

use super::host::MessageSink;
use super::wire::{ChannelMessage, ControlMessage, DataMessage, HeaderBody, HeaderMessage};
use crate::error::{ConduitError, Result};

/// Split marshaled chunks into wire chunks of at most `max` bytes.
///
/// Returns the per-chunk segment counts and the wire chunks in order. A
/// zero-length chunk still occupies one (empty) wire chunk so that every
/// marshaled chunk has at least one segment.
pub fn split_chunks(chunks: &[Bytes], max: usize) -> (Vec<usize>, Vec<Bytes>) {
    let max = max.max(1);
    let mut segments = Vec::with_capacity(chunks.len());
    let mut wire = Vec::new();
    for chunk in chunks {
        if chunk.is_empty() {
            segments.push(1);
            wire.push(Bytes::new());
            continue;
        }
        let mut count = 0;
        let mut offset = 0;
        while offset < chunk.len() {
            let end = (offset + max).min(chunk.len());
            wire.push(chunk.slice(offset..end));
            offset = end;
            count += 1;
        }
        segments.push(count);
    }
    (segments, wire)
}

/// Reassemble marshaled chunks from wire chunks using the header's segments.
pub fn join_chunks(segments: &[usize], wire: Vec<Bytes>) -> Result<Vec<Bytes>> {
    let expected: usize = segments.iter().sum();
    if expected != wire.len() {
        return Err(ConduitError::malformed(format!(
            "segments describe {} wire chunks but {} arrived",
            expected,
            wire.len()
        )));
    }

    let mut wire = wire.into_iter();
    let mut chunks = Vec::with_capacity(segments.len());
    for &count in segments {
        if count == 1 {
            chunks.extend(wire.next());
            continue;
        }
        let parts: Vec<Bytes> = wire.by_ref().take(count).collect();
        let mut joined = BytesMut::with_capacity(parts.iter().map(Bytes::len).sum());
        for part in parts {
            joined.extend_from_slice(&part);
        }
        chunks.push(joined.freeze());
    }
    Ok(chunks)
}

/// Send one marshaled payload: the header on the control channel, then every
/// wire chunk on the data channel. Returns the number of data messages.
pub async fn send_payload(
    sink: &dyn MessageSink,
    request_id: &str,
    body: HeaderBody,
    chunks: &[Bytes],
) -> Result<usize> {
    let max = sink.max_message_size();
    let (segments, wire) = split_chunks(chunks, max);

    let header = ControlMessage::Header(HeaderMessage {
        request_id: request_id.to_string(),
        chunk_count: wire.len(),
        segments: if wire.is_empty() { Vec::new() } else { segments },
        body,
    });
    let header_size = serde_json::to_vec(&header)?.len();
    if header_size > max {
        return Err(ConduitError::MessageTooLarge {
            size: header_size,
            limit: max,
        });
    }

    sink.send(ChannelMessage::Control(header)).await?;
    let count = wire.len();
    for (chunk_index, data) in wire.into_iter().enumerate() {
        sink.send(ChannelMessage::Data(DataMessage {
            request_id: request_id.to_string(),
            chunk_index,
            data,
        }))
        .await?;
    }

    debug!("Sent {} with {} data message(s)", request_id, count);
    Ok(count)
}

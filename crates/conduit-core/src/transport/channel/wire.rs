//! Channel wire messages.
//!
//! Control channel (JSON-describable, always delivered whole):
//!
//! ```text
//! {"type":"header","requestId":"…","chunkCount":3,"segments":[1,2],"kind":"request",
//!  "operation":"Echo","version":"1.0","params":{"$binary":0}}
//! {"type":"cancel","requestId":"…"}
//! {"type":"update","requestId":"…","sequence":1,"metadata":{…},"timestamp":"…"}
//! ```
//!
//! Data channel: `{ requestId, chunkIndex, data }` with raw bytes.
//!
//! `segments[i]` is the number of consecutive data messages that make up
//! marshaled chunk `i`; `chunkCount` is their sum.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConduitError, Result};
use crate::fulfillment::{DiagnosticMetadata, ErrorDescriptor, FulfillmentStatus, PendingUpdate};

/// Header announcing one marshaled payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderMessage {
    pub request_id: String,
    pub chunk_count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub segments: Vec<usize>,
    #[serde(flatten)]
    pub body: HeaderBody,
}

/// What the header introduces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HeaderBody {
    Request {
        operation: String,
        version: String,
        /// Parameter tree with binary placeholders.
        params: Value,
    },
    Fulfillment {
        status: FulfillmentStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorDescriptor>,
        diagnostics: DiagnosticMetadata,
        /// Result tree with binary placeholders.
        result: Value,
    },
}

/// One slice of binary payload.
#[derive(Debug, Clone, PartialEq)]
pub struct DataMessage {
    pub request_id: String,
    pub chunk_index: usize,
    pub data: Bytes,
}

/// Messages carried on the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Header(HeaderMessage),
    Cancel {
        #[serde(rename = "requestId")]
        request_id: String,
    },
    Update(PendingUpdate),
}

impl ControlMessage {
    pub fn request_id(&self) -> &str {
        match self {
            ControlMessage::Header(h) => &h.request_id,
            ControlMessage::Cancel { request_id } => request_id,
            ControlMessage::Update(u) => &u.request_id,
        }
    }
}

/// Anything a channel host moves.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Control(ControlMessage),
    Data(DataMessage),
}

impl ChannelMessage {
    pub fn request_id(&self) -> &str {
        match self {
            ChannelMessage::Control(c) => c.request_id(),
            ChannelMessage::Data(d) => &d.request_id,
        }
    }
}

const CONTROL_TAG: u8 = 0x01;
const DATA_TAG: u8 = 0x02;

/// Encode a message as a single byte frame for stream hosts.
///
/// ```text
/// control: [0x01][UTF-8 JSON]
/// data:    [0x02][u16 BE id len][id][u32 BE chunk index][payload]
/// ```
pub fn encode_message(message: &ChannelMessage) -> Result<Vec<u8>> {
    use bytes::BufMut;

    match message {
        ChannelMessage::Control(control) => {
            let json = serde_json::to_vec(control)?;
            let mut buf = Vec::with_capacity(json.len() + 1);
            buf.put_u8(CONTROL_TAG);
            buf.put_slice(&json);
            Ok(buf)
        }
        ChannelMessage::Data(data) => {
            let id = data.request_id.as_bytes();
            let id_len = u16::try_from(id.len())
                .map_err(|_| ConduitError::malformed("request id longer than 65535 bytes"))?;
            let index = u32::try_from(data.chunk_index)
                .map_err(|_| ConduitError::malformed("chunk index exceeds u32"))?;
            let mut buf = Vec::with_capacity(1 + 2 + id.len() + 4 + data.data.len());
            buf.put_u8(DATA_TAG);
            buf.put_u16(id_len);
            buf.put_slice(id);
            buf.put_u32(index);
            buf.put_slice(&data.data);
            Ok(buf)
        }
    }
}

/// Decode a frame produced by [`encode_message`].
pub fn decode_message(frame: Bytes) -> Result<ChannelMessage> {
    use bytes::Buf;

    let mut buf = frame;
    if !buf.has_remaining() {
        return Err(ConduitError::malformed("empty channel frame"));
    }
    match buf.get_u8() {
        CONTROL_TAG => Ok(ChannelMessage::Control(serde_json::from_slice(&buf)?)),
        DATA_TAG => {
            if buf.remaining() < 2 {
                return Err(ConduitError::malformed("truncated data frame"));
            }
            let id_len = buf.get_u16() as usize;
            if buf.remaining() < id_len + 4 {
                return Err(ConduitError::malformed("truncated data frame"));
            }
            let request_id = String::from_utf8(buf.split_to(id_len).to_vec())
                .map_err(|_| ConduitError::malformed("request id is not UTF-8"))?;
            let chunk_index = buf.get_u32() as usize;
            Ok(ChannelMessage::Data(DataMessage {
                request_id,
                chunk_index,
                data: buf,
            }))
        }
        tag => Err(ConduitError::malformed(format!("unknown frame tag {:#04x}", tag))),
    }
}

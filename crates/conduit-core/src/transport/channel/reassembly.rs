//! Chunk reassembly.
//!
//! One [`PartialReception`] per request id that has started arriving. Data
//! chunks may precede their header: the first chunk creates the partial in
//! buffering mode, and the header later folds in the expected count. The
//! table is owned by a single receive loop, so it needs no locking.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, warn};

use super::framing::join_chunks;
use super::wire::{DataMessage, HeaderMessage};
use crate::error::{ConduitError, Result};

/// In-progress reception of one payload.
#[derive(Debug)]
pub struct PartialReception {
    pub request_id: String,
    pub received_chunk_count: usize,
    /// Unknown until the header arrives.
    pub expected_chunk_count: Option<usize>,
    chunks: BTreeMap<usize, Bytes>,
    header: Option<HeaderMessage>,
    started_at: Instant,
}

impl PartialReception {
    fn new(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            received_chunk_count: 0,
            expected_chunk_count: None,
            chunks: BTreeMap::new(),
            header: None,
            started_at: Instant::now(),
        }
    }

    /// Only data chunks so far.
    pub fn is_buffering(&self) -> bool {
        self.header.is_none()
    }

    fn is_complete(&self) -> bool {
        self.expected_chunk_count == Some(self.received_chunk_count)
    }
}

/// A fully received payload: its header plus the marshaled chunks.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedMessage {
    pub header: HeaderMessage,
    pub chunks: Vec<Bytes>,
}

/// Partial receptions keyed by request id.
#[derive(Debug, Default)]
pub struct ReassemblyTable {
    partials: HashMap<String, PartialReception>,
}

impl ReassemblyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a header into the table.
    ///
    /// Returns the completed message if every chunk is already here (always
    /// the case for a zero-chunk header).
    pub fn accept_header(&mut self, header: HeaderMessage) -> Result<Option<CompletedMessage>> {
        let request_id = header.request_id.clone();
        let partial = self
            .partials
            .entry(request_id.clone())
            .or_insert_with(|| PartialReception::new(&request_id));

        if !partial.is_buffering() {
            return Err(ConduitError::DuplicateMessage {
                request_id,
                message: "header already received".to_string(),
            });
        }

        let overflow = partial
            .chunks
            .range(header.chunk_count..)
            .next()
            .map(|(&index, _)| index);
        if let Some(index) = overflow {
            self.partials.remove(&request_id);
            return Err(ConduitError::malformed(format!(
                "chunk {} buffered for {} but header announces {} chunk(s)",
                index, request_id, header.chunk_count
            )));
        }

        partial.expected_chunk_count = Some(header.chunk_count);
        partial.header = Some(header);
        self.take_if_complete(&request_id)
    }

    /// Fold a data chunk into the table.
    ///
    /// A repeated index or an index past the announced count fails and only
    /// that chunk is dropped; the partial stays.
    pub fn accept_data(&mut self, data: DataMessage) -> Result<Option<CompletedMessage>> {
        let DataMessage {
            request_id,
            chunk_index,
            data,
        } = data;
        let partial = self
            .partials
            .entry(request_id.clone())
            .or_insert_with(|| PartialReception::new(&request_id));

        if let Some(expected) = partial.expected_chunk_count {
            if chunk_index >= expected {
                return Err(ConduitError::malformed(format!(
                    "chunk {} out of range for {} ({} expected)",
                    chunk_index, request_id, expected
                )));
            }
        }
        if partial.chunks.contains_key(&chunk_index) {
            return Err(ConduitError::DuplicateMessage {
                request_id,
                message: format!("chunk {} already received", chunk_index),
            });
        }

        partial.chunks.insert(chunk_index, data);
        partial.received_chunk_count += 1;
        self.take_if_complete(&request_id)
    }

    fn take_if_complete(&mut self, request_id: &str) -> Result<Option<CompletedMessage>> {
        if !self.partials.get(request_id).is_some_and(PartialReception::is_complete) {
            return Ok(None);
        }
        let Some(partial) = self.partials.remove(request_id) else {
            return Ok(None);
        };
        let Some(header) = partial.header else {
            return Ok(None);
        };

        let wire: Vec<Bytes> = partial.chunks.into_values().collect();
        let chunks = if header.segments.is_empty() {
            wire
        } else {
            join_chunks(&header.segments, wire)?
        };
        debug!(
            "Reassembled {} from {} wire chunk(s)",
            request_id, header.chunk_count
        );
        Ok(Some(CompletedMessage { header, chunks }))
    }

    /// Forget a partial reception. Returns false if none existed.
    pub fn discard(&mut self, request_id: &str) -> bool {
        self.partials.remove(request_id).is_some()
    }

    /// Drop partials that started longer than `max_age` ago.
    pub fn evict_stale(&mut self, max_age: Duration) -> usize {
        let before = self.partials.len();
        self.partials.retain(|id, partial| {
            let keep = partial.started_at.elapsed() < max_age;
            if !keep {
                warn!(
                    "Discarding stale partial reception {} ({}/{:?} chunks)",
                    id, partial.received_chunk_count, partial.expected_chunk_count
                );
            }
            keep
        });
        before - self.partials.len()
    }

    pub fn get(&self, request_id: &str) -> Option<&PartialReception> {
        self.partials.get(request_id)
    }

    pub fn len(&self) -> usize {
        self.partials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partials.is_empty()
    }
}

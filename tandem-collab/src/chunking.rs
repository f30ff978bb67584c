//! Splitting and reassembly of whispers larger than the transport allows.
//!
//! ```text
//! payload (12 KB) ──split──► chunked-{event} {id, index: 0, chunk, final: false}
//!                            chunked-{event} {id, index: 1, chunk, final: true}
//!                                      │ (any order, duplicates allowed)
//!                                      ▼
//!                            Reassembler ──► payload, exactly once
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::ProtocolError;

pub const CHUNKED_PREFIX: &str = "chunked-";

/// Number of delivered message ids remembered to drop late duplicates.
const COMPLETED_MEMORY: usize = 256;

/// One piece of a chunked whisper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkEnvelope {
    pub id: String,
    pub index: u32,
    pub chunk: String,
    #[serde(rename = "final")]
    pub is_final: bool,
}

/// Frames to put on the transport for one logical whisper.
///
/// Payloads within `max_bytes` go out unchanged; larger ones become
/// `chunked-{event}` frames, each within `max_bytes` once encoded.
pub fn split(
    event: &str,
    payload: &str,
    max_bytes: usize,
    chunk_bytes: usize,
) -> Result<Vec<(String, String)>, ProtocolError> {
    if payload.len() <= max_bytes {
        return Ok(vec![(event.to_string(), payload.to_string())]);
    }

    let id = Uuid::new_v4().simple().to_string();
    let chunked_event = format!("{CHUNKED_PREFIX}{event}");
    let mut pieces = Vec::new();
    let mut start = 0;

    while start < payload.len() {
        let mut len = chunk_bytes.max(1);
        loop {
            let end = piece_end(payload, start, len);
            let envelope = ChunkEnvelope {
                id: id.clone(),
                index: pieces.len() as u32,
                chunk: payload[start..end].to_string(),
                is_final: end == payload.len(),
            };
            let encoded = serde_json::to_string(&envelope)
                .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
            // JSON escaping can grow a piece past the limit; shrink and retry.
            if encoded.len() <= max_bytes || end - start <= 1 {
                pieces.push(encoded);
                start = end;
                break;
            }
            len = (end - start) / 2;
        }
    }

    Ok(pieces.into_iter().map(|p| (chunked_event.clone(), p)).collect())
}

fn piece_end(s: &str, start: usize, len: usize) -> usize {
    let mut end = (start + len).min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    if end == start {
        // `len` is shorter than the next character; take the whole character.
        end = start + s[start..].chars().next().map_or(1, char::len_utf8);
    }
    end
}

#[derive(Debug)]
struct PendingMessage {
    chunks: BTreeMap<u32, String>,
    final_index: Option<u32>,
    first_seen: Instant,
}

impl PendingMessage {
    fn is_complete(&self) -> bool {
        match self.final_index {
            Some(last) => self.chunks.len() as u64 == last as u64 + 1,
            None => false,
        }
    }
}

/// Buffers chunks per message id and releases each message once.
#[derive(Debug)]
pub struct Reassembler {
    pending: HashMap<String, PendingMessage>,
    completed: VecDeque<String>,
    completed_ids: HashSet<String>,
    timeout: Duration,
}

impl Reassembler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            completed: VecDeque::with_capacity(COMPLETED_MEMORY),
            completed_ids: HashSet::new(),
            timeout,
        }
    }

    /// Feed one chunk; returns the full payload when this chunk completes it.
    pub fn accept(&mut self, envelope: ChunkEnvelope, now: Instant) -> Option<String> {
        self.evict_expired(now);

        if self.completed_ids.contains(&envelope.id) {
            return None;
        }

        let pending = self
            .pending
            .entry(envelope.id.clone())
            .or_insert_with(|| PendingMessage {
                chunks: BTreeMap::new(),
                final_index: None,
                first_seen: now,
            });

        if envelope.is_final {
            pending.final_index = Some(envelope.index);
        }
        if let Some(last) = pending.final_index {
            if envelope.index > last {
                log::debug!("Dropping chunk {} past final index {last}", envelope.index);
                return None;
            }
            pending.chunks.retain(|&i, _| i <= last);
        }
        pending.chunks.entry(envelope.index).or_insert(envelope.chunk);

        if !pending.is_complete() {
            return None;
        }

        let message = self.pending.remove(&envelope.id)?;
        self.remember_completed(envelope.id);
        Some(message.chunks.into_values().collect())
    }

    /// Number of messages still waiting for chunks.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn remember_completed(&mut self, id: String) {
        if self.completed.len() == COMPLETED_MEMORY {
            if let Some(oldest) = self.completed.pop_front() {
                self.completed_ids.remove(&oldest);
            }
        }
        self.completed_ids.insert(id.clone());
        self.completed.push_back(id);
    }

    fn evict_expired(&mut self, now: Instant) {
        let timeout = self.timeout;
        self.pending.retain(|id, msg| {
            let keep = now.duration_since(msg.first_seen) < timeout;
            if !keep {
                log::debug!("Abandoning incomplete chunked message {id}");
            }
            keep
        });
    }

    /// Route a raw transport frame.
    ///
    /// Direct events pass through; `chunked-*` frames are buffered and
    /// surface as `(original event, full payload)` once complete.
    pub fn receive(
        &mut self,
        event: &str,
        payload: &str,
        now: Instant,
    ) -> Result<Option<(String, String)>, ProtocolError> {
        let Some(inner) = event.strip_prefix(CHUNKED_PREFIX) else {
            return Ok(Some((event.to_string(), payload.to_string())));
        };
        let envelope: ChunkEnvelope = serde_json::from_str(payload)
            .map_err(|e| ProtocolError::MalformedChunk(e.to_string()))?;
        Ok(self.accept(envelope, now).map(|full| (inner.to_string(), full)))
    }
}

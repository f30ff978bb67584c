//! Presence/broadcast transport boundary and the chunking layer above it.
//!
//! A transport joins one channel per document and delivers
//! [`TransportEvent`]s: the roster on join, roster diffs, and whispers from
//! other members. Delivery is best effort, unordered and size limited.
//! [`ChunkedChannel`] turns [`WhisperMessage`]s into frames that fit and
//! back.

use std::sync::Arc;
use tokio::time::Instant;

use crate::chunking::{self, Reassembler};
use crate::config::WorkspaceConfig;
use crate::error::{ProtocolError, TransportError};
use crate::protocol::{is_snapshot_event, User, WhisperMessage};
use crate::window::WindowId;

/// What a transport reports to the workspace.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Roster at the time the channel was joined (or re-joined).
    Here(Vec<User>),
    Joining(User),
    Leaving(User),
    Whisper { event: String, payload: String },
    /// The connection dropped. Presence state is kept as is.
    Disconnected,
}

/// Sending half of a joined channel.
pub trait Transport: Send + Sync {
    /// Send one frame to every other member of the channel.
    fn whisper(&self, event: &str, payload: &str) -> Result<(), TransportError>;
}

pub struct ChunkedChannel {
    transport: Arc<dyn Transport>,
    local_window: WindowId,
    reassembler: Reassembler,
    max_bytes: usize,
    chunk_bytes: usize,
}

impl ChunkedChannel {
    pub fn new(transport: Arc<dyn Transport>, local_window: WindowId, config: &WorkspaceConfig) -> Self {
        Self {
            transport,
            local_window,
            reassembler: Reassembler::new(config.pending_chunk_timeout),
            max_bytes: config.max_whisper_bytes,
            chunk_bytes: config.chunk_bytes,
        }
    }

    /// Send `msg` unless nobody could receive it.
    ///
    /// `force` sends even when `alone`. Returns whether anything was sent.
    pub fn whisper(&self, msg: &WhisperMessage, force: bool, alone: bool) -> Result<bool, TransportError> {
        if alone && !force {
            return Ok(false);
        }
        let (event, payload) = msg.encode()?;
        let frames = chunking::split(&event, &payload, self.max_bytes, self.chunk_bytes)?;
        if frames.len() > 1 {
            log::debug!("Sending {event} in {} chunks ({} bytes)", frames.len(), payload.len());
        }
        for (frame_event, frame_payload) in &frames {
            self.transport.whisper(frame_event, frame_payload)?;
        }
        Ok(true)
    }

    /// Handle one incoming frame.
    ///
    /// Returns `None` while a chunked message is incomplete, and for
    /// messages not meant for this window.
    pub fn receive(
        &mut self,
        event: &str,
        payload: &str,
        now: Instant,
    ) -> Result<Option<WhisperMessage>, ProtocolError> {
        let Some((event, payload)) = self.reassembler.receive(event, payload, now)? else {
            return Ok(None);
        };
        if is_snapshot_event(&event) && event != format!("state-snapshot-{}", self.local_window) {
            return Ok(None);
        }
        let msg = WhisperMessage::decode(&event, &payload)?;
        if msg.sender_window() == Some(&self.local_window) {
            return Ok(None);
        }
        Ok(Some(msg))
    }

    pub fn pending_chunks(&self) -> usize {
        self.reassembler.pending_count()
    }
}

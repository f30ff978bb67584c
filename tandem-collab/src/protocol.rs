//! Messages exchanged between windows.
//!
//! Two layers:
//! ```text
//! ┌───────────────────────┐  JSON payload, event name = tag
//! │ WhisperMessage        │  (window-joined, focus, field-update, …)
//! ├───────────────────────┤
//! │ chunking (optional)   │  chunked-{event}, see crate::chunking
//! ├───────────────────────┤
//! │ RelayFrame (bincode)  │  only when talking to crate::relay
//! └───────────────────────┘
//! ```
//!
//! Every whisper is a variant of the closed [`WhisperMessage`] union; the
//! event name on the transport is derived from the variant, so a receiver
//! never dispatches on free-form strings.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;
use crate::window::WindowId;

/// Field values or metadata keyed by field handle.
pub type FieldMap = Map<String, Value>;

/// A user as reported by the presence roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub name: String,
}

impl User {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self { id, name: name.into() }
    }
}

impl PartialEq for User {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for User {}

impl std::hash::Hash for User {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Which half of the document a field lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Value,
    Meta,
}

/// Who is focused on which field, as carried in state snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FocusEntry {
    pub handle: String,
    pub user: User,
    pub window_id: WindowId,
}

/// Every message one window can whisper to the others.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum WhisperMessage {
    /// A window opened the document.
    WindowJoined { window_id: WindowId, user: User },
    /// Reply to `WindowJoined`: the sender is also here.
    WindowPresent { window_id: WindowId, user: User },
    /// A window closed the document.
    WindowLeft { window_id: WindowId },
    /// Full state for one newly joined window.
    StateSnapshot {
        target: WindowId,
        values: FieldMap,
        meta: FieldMap,
        focus: Vec<FocusEntry>,
    },
    Focus { user: User, handle: String, window_id: WindowId },
    Blur { user: User, handle: String, window_id: WindowId },
    /// Small change carried inline.
    FieldUpdate {
        handle: String,
        kind: FieldKind,
        value: Value,
        window_id: WindowId,
    },
    /// Large change: it is in the cache, go fetch it.
    FetchField { handle: String, kind: FieldKind, window_id: WindowId },
    /// Everything the sender had buffered is in the cache.
    SyncNow { window_id: WindowId },
    /// Ask the window of `target_user` to release `handle`.
    ForceUnlock {
        handle: String,
        target_user: u64,
        requester: User,
        requester_window: WindowId,
    },
    /// Reply to `ForceUnlock`, addressed to the requester.
    ForceUnlocked { handle: String, requester_window: WindowId, user: User },
    Saved { user: User, window_id: WindowId },
    Published { user: User, window_id: WindowId },
    RevisionRestored { user: User, window_id: WindowId },
}

const SNAPSHOT_PREFIX: &str = "state-snapshot-";

impl WhisperMessage {
    /// Transport event name for this message.
    ///
    /// Snapshots are addressed by event name, since the transport has no
    /// per-window delivery.
    pub fn event_name(&self) -> String {
        match self {
            WhisperMessage::WindowJoined { .. } => "window-joined".into(),
            WhisperMessage::WindowPresent { .. } => "window-present".into(),
            WhisperMessage::WindowLeft { .. } => "window-left".into(),
            WhisperMessage::StateSnapshot { target, .. } => format!("{SNAPSHOT_PREFIX}{target}"),
            WhisperMessage::Focus { .. } => "focus".into(),
            WhisperMessage::Blur { .. } => "blur".into(),
            WhisperMessage::FieldUpdate { .. } => "field-update".into(),
            WhisperMessage::FetchField { .. } => "fetch-field".into(),
            WhisperMessage::SyncNow { .. } => "sync-now".into(),
            WhisperMessage::ForceUnlock { .. } => "force-unlock".into(),
            WhisperMessage::ForceUnlocked { .. } => "force-unlocked".into(),
            WhisperMessage::Saved { .. } => "saved".into(),
            WhisperMessage::Published { .. } => "published".into(),
            WhisperMessage::RevisionRestored { .. } => "revision-restored".into(),
        }
    }

    /// Window that sent the message, when the message names one.
    pub fn sender_window(&self) -> Option<&WindowId> {
        match self {
            WhisperMessage::WindowJoined { window_id, .. }
            | WhisperMessage::WindowPresent { window_id, .. }
            | WhisperMessage::WindowLeft { window_id }
            | WhisperMessage::Focus { window_id, .. }
            | WhisperMessage::Blur { window_id, .. }
            | WhisperMessage::FieldUpdate { window_id, .. }
            | WhisperMessage::FetchField { window_id, .. }
            | WhisperMessage::SyncNow { window_id }
            | WhisperMessage::Saved { window_id, .. }
            | WhisperMessage::Published { window_id, .. }
            | WhisperMessage::RevisionRestored { window_id, .. } => Some(window_id),
            WhisperMessage::ForceUnlock { requester_window, .. } => Some(requester_window),
            WhisperMessage::StateSnapshot { .. } | WhisperMessage::ForceUnlocked { .. } => None,
        }
    }

    /// Serialize to `(event name, JSON payload)`.
    pub fn encode(&self) -> Result<(String, String), ProtocolError> {
        let payload = serde_json::to_string(self)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok((self.event_name(), payload))
    }

    /// Parse a whisper received under `event`.
    ///
    /// The payload's own tag must agree with the event name it arrived on.
    pub fn decode(event: &str, payload: &str) -> Result<Self, ProtocolError> {
        let msg: WhisperMessage = serde_json::from_str(payload)?;
        let expected = msg.event_name();
        if expected != event {
            return Err(ProtocolError::EventMismatch {
                event: event.to_string(),
                payload: expected,
            });
        }
        Ok(msg)
    }
}

/// Whether `event` is a snapshot addressed to some window.
pub fn is_snapshot_event(event: &str) -> bool {
    event.starts_with(SNAPSHOT_PREFIX)
}

/// Frames exchanged with the WebSocket relay.
///
/// Serialized with bincode, one frame per binary WebSocket message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelayFrame {
    /// Client → relay, first frame: join a channel as `user`.
    Subscribe { channel: String, user: User },
    /// Relay → client: roster at the time of joining.
    Here { users: Vec<User> },
    /// Relay → client: a user's first connection arrived.
    Joining { user: User },
    /// Relay → client: a user's last connection left.
    Leaving { user: User },
    /// Both directions: a whisper for everyone else on the channel.
    Whisper { event: String, payload: String },
    /// Relay → client: the previous frame was rejected.
    Error { message: String },
}

impl RelayFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}

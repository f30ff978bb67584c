//! Error types for the sync engine and its collaborators.
//!
//! Nothing in here is fatal to an editing session: callers log and move on,
//! and [`CacheError::is_retryable`] decides whether a failed persist is
//! attempted again.

use thiserror::Error;

/// Wire encoding/decoding failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unknown event `{0}`")]
    UnknownEvent(String),
    #[error("event name `{event}` does not match payload `{payload}`")]
    EventMismatch { event: String, payload: String },
    #[error("malformed chunk: {0}")]
    MalformedChunk(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            ProtocolError::Deserialization(e.to_string())
        } else {
            ProtocolError::Serialization(e.to_string())
        }
    }
}

/// Failures talking to the persisted state cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The service refused the operation (HTTP 403). Retrying in the same
    /// session does not change the outcome.
    #[error("cache access forbidden")]
    Forbidden,
    #[error("cache returned HTTP {0}")]
    Status(u16),
    #[error("cache request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("cache response could not be decoded: {0}")]
    Decode(String),
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

impl CacheError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, CacheError::Forbidden | CacheError::Decode(_))
    }
}

/// Failures handing a message to the presence transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("transport disconnected")]
    Disconnected,
    #[error("relay connection failed: {0}")]
    Connect(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Failures surfaced by a [`crate::workspace::WorkspaceHandle`].
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// The workspace task has stopped (destroyed or dropped).
    #[error("workspace is no longer running")]
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forbidden_is_not_retryable() {
        assert!(!CacheError::Forbidden.is_retryable());
        assert!(!CacheError::Decode("bad".into()).is_retryable());
        assert!(CacheError::Status(502).is_retryable());
        assert!(CacheError::Unavailable("offline".into()).is_retryable());
    }

    #[test]
    fn test_json_error_maps_to_deserialization() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(ProtocolError::from(err), ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_display() {
        let err = TransportError::TooLarge { size: 12_000, limit: 8_000 };
        assert_eq!(err.to_string(), "message of 12000 bytes exceeds the 8000 byte limit");
    }
}

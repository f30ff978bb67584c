//! Workspace configuration: document identity, timing and size limits.

use std::time::Duration;

/// Configuration for one [`crate::workspace::Workspace`].
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    /// Document reference (entry id or similar), part of the channel and cache key.
    pub reference: String,
    /// Site handle, part of the channel and cache key.
    pub site: String,
    /// Whether the document has been saved at least once.
    pub is_saved: bool,
    /// After joining, the window never considers itself alone for this long.
    pub warmup: Duration,
    /// How long a released field stays locked before it is actually unlocked.
    pub unlock_grace: Duration,
    /// A focused field with no edits for this long is force-released.
    pub field_inactivity: Duration,
    /// No edits at all for this long raises the inactivity modal.
    pub session_idle: Duration,
    /// Quiet period before a field change is flushed.
    pub debounce: Duration,
    /// Merges never overwrite a field edited locally within this window.
    pub protection_window: Duration,
    /// Delay before the revision-restore hook resolves.
    pub revision_restore_delay: Duration,
    /// Largest whisper sent in one piece.
    pub max_whisper_bytes: usize,
    /// Size of each piece of a chunked whisper.
    pub chunk_bytes: usize,
    /// Field values up to this size travel inside the update whisper;
    /// larger ones are persisted first and announced with a fetch notice.
    pub direct_update_limit: usize,
    /// Incomplete chunked messages are discarded after this long.
    pub pending_chunk_timeout: Duration,
    /// Metadata keys kept out of state snapshots sent to other windows.
    pub private_meta_keys: Vec<String>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            reference: String::new(),
            site: "default".to_string(),
            is_saved: true,
            warmup: Duration::from_secs(5),
            unlock_grace: Duration::from_secs(3),
            field_inactivity: Duration::from_secs(45),
            session_idle: Duration::from_secs(30 * 60),
            debounce: Duration::from_millis(300),
            protection_window: Duration::from_secs(4),
            revision_restore_delay: Duration::from_millis(500),
            max_whisper_bytes: 8_000,
            chunk_bytes: 6_000,
            direct_update_limit: 2_000,
            pending_chunk_timeout: Duration::from_secs(30),
            private_meta_keys: vec!["errors".to_string(), "validation".to_string()],
        }
    }
}

impl WorkspaceConfig {
    /// Configuration for the given document with default timings.
    pub fn for_document(reference: impl Into<String>, site: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            site: site.into(),
            ..Self::default()
        }
    }

    /// Mark the document as never saved (a fresh draft).
    pub fn unsaved(mut self) -> Self {
        self.is_saved = false;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_warmup(mut self, warmup: Duration) -> Self {
        self.warmup = warmup;
        self
    }

    pub fn with_unlock_grace(mut self, grace: Duration) -> Self {
        self.unlock_grace = grace;
        self
    }

    /// Presence channel name shared by every window on this document.
    pub fn channel_name(&self) -> String {
        format!("collaboration.{}.{}", self.reference, self.site)
    }
}

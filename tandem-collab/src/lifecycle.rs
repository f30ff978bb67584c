//! Save, publish and revision-restore notifications.
//!
//! The host calls the matching [`crate::workspace::WorkspaceHandle`] method
//! after the operation succeeded; the workspace announces it to every other
//! window (forced, so the user's own tabs hear it when nobody else is here)
//! and other windows react according to [`react`].

use crate::notify::{BlockingModal, Toast};
use crate::protocol::{User, WhisperMessage};
use crate::window::WindowId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Saved,
    Published,
    RevisionRestored,
}

impl LifecycleEvent {
    pub fn announcement(self, user: User, window_id: WindowId) -> WhisperMessage {
        match self {
            LifecycleEvent::Saved => WhisperMessage::Saved { user, window_id },
            LifecycleEvent::Published => WhisperMessage::Published { user, window_id },
            LifecycleEvent::RevisionRestored => WhisperMessage::RevisionRestored { user, window_id },
        }
    }

    /// The stored document now matches the editor, so the cache entry and
    /// anything buffered for it are obsolete.
    pub fn persists_document(self) -> bool {
        matches!(self, LifecycleEvent::Saved | LifecycleEvent::Published)
    }
}

/// How a window responds to another window's lifecycle announcement.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleReaction {
    /// Take the current values as saved and show a toast.
    MarkSaved(Toast),
    /// The document changed under us; the user has to reload.
    Block(BlockingModal),
}

pub fn react(msg: &WhisperMessage, local_user: &User) -> Option<LifecycleReaction> {
    match msg {
        WhisperMessage::Saved { user, .. } if user == local_user => {
            Some(LifecycleReaction::MarkSaved(Toast::SavedElsewhere))
        }
        WhisperMessage::Saved { user, .. } => Some(LifecycleReaction::MarkSaved(Toast::SavedBy(user.clone()))),
        WhisperMessage::Published { user, .. } => {
            Some(LifecycleReaction::Block(BlockingModal::Published { by: user.clone() }))
        }
        WhisperMessage::RevisionRestored { user, .. } => {
            Some(LifecycleReaction::Block(BlockingModal::RevisionRestored { by: user.clone() }))
        }
        _ => None,
    }
}

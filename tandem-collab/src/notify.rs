//! Notices for the editing UI: toasts, the status indicator, and blocking
//! modals. All fire-and-forget.

use std::sync::Mutex;

use crate::changes::SaveStatus;
use crate::protocol::User;

#[derive(Debug, Clone, PartialEq)]
pub enum Toast {
    UserJoined(User),
    UserLeft(User),
    SavedBy(User),
    /// Our own user saved from another window.
    SavedElsewhere,
    PublishedBy(User),
    ReleasedForInactivity { handle: String },
    /// Someone took a field away from us.
    ForceUnlocked { handle: String, by: User },
    /// Our force-unlock request went through.
    ForceUnlockConfirmed { handle: String, user: User },
}

/// Notices the user must acknowledge before going on.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockingModal {
    Published { by: User },
    RevisionRestored { by: User },
    /// No edits for the session idle period.
    Inactive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub save_status: SaveStatus,
    pub users: Vec<User>,
    pub active_windows: usize,
    pub alone: bool,
}

pub trait Notifier: Send + Sync {
    fn toast(&self, toast: Toast);
    fn status(&self, status: StatusSnapshot);
    fn modal(&self, modal: BlockingModal);
}

/// Writes every notice to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn toast(&self, toast: Toast) {
        log::info!("{toast:?}");
    }

    fn status(&self, status: StatusSnapshot) {
        log::debug!(
            "Status: {:?}, {} user(s), {} window(s){}",
            status.save_status,
            status.users.len(),
            status.active_windows,
            if status.alone { ", alone" } else { "" }
        );
    }

    fn modal(&self, modal: BlockingModal) {
        log::warn!("Blocking: {modal:?}");
    }
}

/// Keeps every notice for inspection.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    toasts: Mutex<Vec<Toast>>,
    statuses: Mutex<Vec<StatusSnapshot>>,
    modals: Mutex<Vec<BlockingModal>>,
}

impl RecordingNotifier {
    pub fn toasts(&self) -> Vec<Toast> {
        self.toasts.lock().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn modals(&self) -> Vec<BlockingModal> {
        self.modals.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn last_status(&self) -> Option<StatusSnapshot> {
        self.statuses.lock().ok().and_then(|s| s.last().cloned())
    }

    pub fn status_count(&self) -> usize {
        self.statuses.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl Notifier for RecordingNotifier {
    fn toast(&self, toast: Toast) {
        if let Ok(mut toasts) = self.toasts.lock() {
            toasts.push(toast);
        }
    }

    fn status(&self, status: StatusSnapshot) {
        if let Ok(mut statuses) = self.statuses.lock() {
            statuses.push(status);
        }
    }

    fn modal(&self, modal: BlockingModal) {
        if let Ok(mut modals) = self.modals.lock() {
            modals.push(modal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_notifier() {
        let notifier = RecordingNotifier::default();
        notifier.toast(Toast::SavedElsewhere);
        notifier.modal(BlockingModal::Inactive);
        notifier.status(StatusSnapshot {
            save_status: SaveStatus::Saved,
            users: vec![],
            active_windows: 1,
            alone: true,
        });

        assert_eq!(notifier.toasts(), vec![Toast::SavedElsewhere]);
        assert_eq!(notifier.modals(), vec![BlockingModal::Inactive]);
        assert!(notifier.last_status().unwrap().alone);
        assert_eq!(notifier.status_count(), 1);
    }
}

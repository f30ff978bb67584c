//! Per-field lock state.
//!
//! ```text
//!            remote focus (other user)          remote blur
//! Unlocked ───────────────────────────► Locked ─────────────► PendingUnlock
//!    ▲                                    ▲                        │
//!    │                                    └──── remote focus ──────┤
//!    └──────────────── grace timer fired + fetch ─────────────────┘
//! ```
//!
//! Local focus is tracked separately and never produces a lock: the same
//! user editing from two windows is not a conflict. Timers live in the
//! workspace; this module only holds state and answers what changed.

use std::collections::{BTreeSet, HashMap};
use tokio::time::Instant;

use crate::protocol::{FocusEntry, User};
use crate::window::WindowId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPhase {
    Locked,
    /// Released by its owner, kept for the grace interval.
    PendingUnlock,
}

/// A field held by a remote user.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldLock {
    pub owner: User,
    /// Windows of `owner` focused on the field. Released when empty.
    pub owner_windows: BTreeSet<WindowId>,
    pub acquired_at: Instant,
    pub phase: LockPhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalPhase {
    Focused,
    PendingRelease,
}

/// Result of a remote focus event.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteFocus {
    /// A lock was created or changed hands; render the field read-only.
    Locked { previous: Option<User> },
    /// The same owner focused again; any pending unlock is void.
    Refreshed,
    /// Same user, other window: tracked, never locked.
    Tracked,
    /// Our own window echoed back.
    Ignored,
}

pub struct FieldLocks {
    local_user: User,
    local_window: WindowId,
    locks: HashMap<String, FieldLock>,
    local_focus: HashMap<String, LocalPhase>,
    /// Focus reported by other windows, including our own user's.
    remote_focus: HashMap<String, FocusEntry>,
}

impl FieldLocks {
    pub fn new(local_user: User, local_window: WindowId) -> Self {
        Self {
            local_user,
            local_window,
            locks: HashMap::new(),
            local_focus: HashMap::new(),
            remote_focus: HashMap::new(),
        }
    }

    // ── local side ───────────────────────────────────────────────

    /// Returns `true` if this re-entered a field still pending release.
    pub fn focus_local(&mut self, handle: &str) -> bool {
        let previous = self.local_focus.insert(handle.to_string(), LocalPhase::Focused);
        previous == Some(LocalPhase::PendingRelease)
    }

    /// Returns `true` if the field was focused.
    pub fn blur_local(&mut self, handle: &str) -> bool {
        match self.local_focus.get_mut(handle) {
            Some(phase @ LocalPhase::Focused) => {
                *phase = LocalPhase::PendingRelease;
                true
            }
            _ => false,
        }
    }

    /// Ends the grace period of a blurred field. A re-focused field stays.
    pub fn release_local(&mut self, handle: &str) -> bool {
        if self.local_focus.get(handle) == Some(&LocalPhase::PendingRelease) {
            self.local_focus.remove(handle);
            return true;
        }
        false
    }

    pub fn is_locally_focused(&self, handle: &str) -> bool {
        self.local_focus.get(handle) == Some(&LocalPhase::Focused)
    }

    pub fn focused_handles(&self) -> Vec<String> {
        self.local_focus
            .iter()
            .filter(|(_, p)| **p == LocalPhase::Focused)
            .map(|(h, _)| h.clone())
            .collect()
    }

    // ── remote side ──────────────────────────────────────────────

    pub fn remote_focus(
        &mut self,
        user: &User,
        handle: &str,
        window: &WindowId,
        now: Instant,
    ) -> RemoteFocus {
        if *window == self.local_window {
            return RemoteFocus::Ignored;
        }
        self.remote_focus.insert(
            handle.to_string(),
            FocusEntry { handle: handle.to_string(), user: user.clone(), window_id: window.clone() },
        );

        if *user == self.local_user {
            return RemoteFocus::Tracked;
        }

        if let Some(lock) = self.locks.get_mut(handle) {
            if lock.owner == *user {
                lock.phase = LockPhase::Locked;
                lock.owner_windows.insert(window.clone());
                return RemoteFocus::Refreshed;
            }
        }

        let previous = self.locks.get(handle).map(|l| l.owner.clone());
        self.locks.insert(
            handle.to_string(),
            FieldLock {
                owner: user.clone(),
                owner_windows: BTreeSet::from([window.clone()]),
                acquired_at: now,
                phase: LockPhase::Locked,
            },
        );
        RemoteFocus::Locked { previous }
    }

    /// Returns `true` if a lock entered `PendingUnlock` and needs a timer.
    ///
    /// The owner may hold the field from several windows; only the blur of
    /// the last one starts the grace period.
    pub fn remote_blur(&mut self, user: &User, handle: &str, window: &WindowId) -> bool {
        if self
            .remote_focus
            .get(handle)
            .is_some_and(|f| f.window_id == *window)
        {
            self.remote_focus.remove(handle);
        }
        match self.locks.get_mut(handle) {
            Some(lock) if lock.owner == *user => {
                lock.owner_windows.remove(window);
            }
            _ => return false,
        }
        self.begin_unlock(handle, |lock| lock.owner_windows.is_empty())
    }

    /// Locks held only by a closed window start their grace period.
    pub fn window_gone(&mut self, window: &WindowId) -> Vec<String> {
        self.remote_focus.retain(|_, f| f.window_id != *window);
        let mut released = Vec::new();
        for (handle, lock) in self.locks.iter_mut() {
            let last = lock.owner_windows.remove(window) && lock.owner_windows.is_empty();
            if last && lock.phase == LockPhase::Locked {
                lock.phase = LockPhase::PendingUnlock;
                released.push(handle.clone());
            }
        }
        released
    }

    /// Locks owned by a user who left the channel start their grace period.
    pub fn user_gone(&mut self, user: &User) -> Vec<String> {
        self.remote_focus.retain(|_, f| f.user != *user);
        let handles: Vec<String> = self
            .locks
            .iter()
            .filter(|(_, l)| l.owner == *user && l.phase == LockPhase::Locked)
            .map(|(h, _)| h.clone())
            .collect();
        handles
            .into_iter()
            .filter(|h| self.begin_unlock(h, |_| true))
            .collect()
    }

    fn begin_unlock(&mut self, handle: &str, owned: impl Fn(&FieldLock) -> bool) -> bool {
        match self.locks.get_mut(handle) {
            Some(lock) if owned(lock) && lock.phase == LockPhase::Locked => {
                lock.phase = LockPhase::PendingUnlock;
                true
            }
            _ => false,
        }
    }

    /// Grace timer fired. Only a lock still pending is released.
    pub fn commit_unlock(&mut self, handle: &str) -> Option<FieldLock> {
        if self.locks.get(handle)?.phase != LockPhase::PendingUnlock {
            return None;
        }
        self.locks.remove(handle)
    }

    pub fn lock(&self, handle: &str) -> Option<&FieldLock> {
        self.locks.get(handle)
    }

    pub fn is_locked(&self, handle: &str) -> bool {
        self.locks.contains_key(handle)
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// `(handle, owner)` for every lock, sorted by handle.
    pub fn locked(&self) -> Vec<(String, User)> {
        let mut locked: Vec<(String, User)> = self
            .locks
            .iter()
            .map(|(h, l)| (h.clone(), l.owner.clone()))
            .collect();
        locked.sort_by(|a, b| a.0.cmp(&b.0));
        locked
    }

    /// Everyone's focus as this window knows it, for state snapshots.
    pub fn focus_map(&self) -> Vec<FocusEntry> {
        let mut entries: Vec<FocusEntry> = self
            .focused_handles()
            .into_iter()
            .map(|handle| FocusEntry {
                handle,
                user: self.local_user.clone(),
                window_id: self.local_window.clone(),
            })
            .collect();
        entries.extend(
            self.remote_focus
                .values()
                .filter(|f| !self.is_locally_focused(&f.handle))
                .cloned(),
        );
        entries.sort_by(|a, b| a.handle.cmp(&b.handle));
        entries
    }

    /// Drops all state, returning the handles that were locked.
    pub fn clear(&mut self) -> Vec<String> {
        self.local_focus.clear();
        self.remote_focus.clear();
        self.locks.drain().map(|(h, _)| h).collect()
    }
}

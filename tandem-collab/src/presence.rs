//! Who is here: users from the presence roster, windows from the
//! announce/reply handshake.
//!
//! ## Why two sets
//!
//! ```text
//! transport roster  ── here/joining/leaving ──►  users          (per user)
//! window-joined / window-present / window-left ► active_windows (per tab)
//! same-browser sibling detection ─────────────►  siblings       (per tab)
//! ```
//!
//! The roster cannot tell two tabs of one user apart, so windows announce
//! themselves. None of this is authoritative: it only decides whether a
//! broadcast is worth sending, and every set is allowed to go stale until
//! the next `window-left` or re-announce.

use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

use crate::protocol::User;
use crate::window::WindowId;

/// What the status indicator shows about occupancy.
#[derive(Debug, Clone, PartialEq)]
pub struct Occupancy {
    pub users: Vec<User>,
    pub active_windows: usize,
}

pub struct PresenceTracker {
    /// Our own window, always counted as active.
    local_window: WindowId,
    /// Roster order as reported by the transport.
    users: Vec<User>,
    active_windows: HashSet<WindowId>,
    siblings: HashSet<WindowId>,
    /// Set when the channel is joined; starts the warm-up period.
    joined_at: Option<Instant>,
    warmup: Duration,
}

impl PresenceTracker {
    pub fn new(local_window: WindowId, warmup: Duration) -> Self {
        let mut active_windows = HashSet::new();
        active_windows.insert(local_window.clone());
        Self {
            local_window,
            users: Vec::new(),
            active_windows,
            siblings: HashSet::new(),
            joined_at: None,
            warmup,
        }
    }

    /// Authoritative roster received on joining the channel.
    pub fn set_users(&mut self, users: Vec<User>, now: Instant) {
        let mut seen = HashSet::new();
        self.users = users.into_iter().filter(|u| seen.insert(u.id)).collect();
        self.joined_at = Some(now);
    }

    /// Returns `true` if the user was not already on the roster.
    pub fn user_joining(&mut self, user: User) -> bool {
        if self.users.contains(&user) {
            return false;
        }
        self.users.push(user);
        true
    }

    /// Returns the removed user, if it was on the roster.
    pub fn user_leaving(&mut self, user: &User) -> Option<User> {
        let pos = self.users.iter().position(|u| u == user)?;
        Some(self.users.remove(pos))
    }

    /// Returns `true` if the window was not known yet.
    pub fn window_joined(&mut self, window: WindowId) -> bool {
        if window == self.local_window {
            return false;
        }
        self.active_windows.insert(window)
    }

    pub fn window_present(&mut self, window: WindowId) {
        if window != self.local_window {
            self.active_windows.insert(window);
        }
    }

    /// Unknown windows are ignored.
    pub fn window_left(&mut self, window: &WindowId) {
        if *window != self.local_window {
            self.active_windows.remove(window);
        }
    }

    pub fn sibling_detected(&mut self, window: WindowId) {
        if window != self.local_window {
            self.siblings.insert(window);
        }
    }

    pub fn sibling_gone(&mut self, window: &WindowId) {
        self.siblings.remove(window);
    }

    pub fn in_warmup(&self, now: Instant) -> bool {
        match self.joined_at {
            Some(t) => now.duration_since(t) < self.warmup,
            // Not joined yet: nothing is known, assume company.
            None => true,
        }
    }

    /// True when nobody could receive a broadcast.
    pub fn is_alone(&self, now: Instant) -> bool {
        !self.in_warmup(now)
            && self.users.len() <= 1
            && self.active_windows.len() <= 1
            && self.siblings.is_empty()
    }

    pub fn occupancy(&self) -> Occupancy {
        Occupancy {
            users: self.users.clone(),
            active_windows: self.active_windows.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WARMUP: Duration = Duration::from_secs(5);

    fn tracker() -> PresenceTracker {
        PresenceTracker::new(WindowId::from("self"), WARMUP)
    }

    #[test]
    fn test_not_alone_before_join() {
        let t = tracker();
        assert!(!t.is_alone(Instant::now()));
    }

    #[test]
    fn test_warmup_forces_company() {
        let mut t = tracker();
        let start = Instant::now();
        t.set_users(vec![User::new(1, "Alice")], start);

        assert!(!t.is_alone(start + Duration::from_secs(1)));
        assert!(t.is_alone(start + WARMUP));
    }

    #[test]
    fn test_second_user_breaks_solitude() {
        let mut t = tracker();
        let start = Instant::now();
        t.set_users(vec![User::new(1, "Alice")], start);
        let later = start + WARMUP;

        assert!(t.user_joining(User::new(2, "Bob")));
        assert!(!t.user_joining(User::new(2, "Bob")));
        assert!(!t.is_alone(later));

        assert!(t.user_leaving(&User::new(2, "Bob")).is_some());
        assert!(t.user_leaving(&User::new(2, "Bob")).is_none());
        assert!(t.is_alone(later));
    }

    #[test]
    fn test_same_user_second_window() {
        let mut t = tracker();
        let start = Instant::now();
        t.set_users(vec![User::new(1, "Alice")], start);
        let later = start + WARMUP;

        assert!(t.window_joined(WindowId::from("other")));
        assert!(!t.window_joined(WindowId::from("other")));
        assert!(!t.is_alone(later));

        t.window_left(&WindowId::from("other"));
        assert!(t.is_alone(later));
    }

    #[test]
    fn test_window_left_unknown_is_noop() {
        let mut t = tracker();
        t.window_left(&WindowId::from("never-seen"));
        t.window_left(&WindowId::from("self"));
        assert_eq!(t.occupancy().active_windows, 1);
    }

    #[test]
    fn test_own_window_is_ignored() {
        let mut t = tracker();
        assert!(!t.window_joined(WindowId::from("self")));
        t.window_present(WindowId::from("self"));
        t.sibling_detected(WindowId::from("self"));
        assert_eq!(t.occupancy().active_windows, 1);
    }

    #[test]
    fn test_sibling_blocks_solitude() {
        let mut t = tracker();
        let start = Instant::now();
        t.set_users(vec![User::new(1, "Alice")], start);
        let later = start + WARMUP;

        t.sibling_detected(WindowId::from("tab-2"));
        assert!(!t.is_alone(later));
        t.sibling_gone(&WindowId::from("tab-2"));
        assert!(t.is_alone(later));
    }

    #[test]
    fn test_roster_deduplicates() {
        let mut t = tracker();
        t.set_users(
            vec![User::new(1, "Alice"), User::new(2, "Bob"), User::new(1, "Alice")],
            Instant::now(),
        );
        let occ = t.occupancy();
        assert_eq!(occ.users.len(), 2);
        assert_eq!(occ.active_windows, 1);
    }
}

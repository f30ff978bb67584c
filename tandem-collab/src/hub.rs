//! In-process presence channels.
//!
//! Each named channel fans whispers out to every other member, the way a
//! presence channel on a broadcast service does. Members are connections;
//! the roster is per user, so a user's second window does not produce a
//! `Joining` and closing one of two windows does not produce a `Leaving`.
//!
//! The WebSocket relay is a thin framing layer over the same hub.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::protocol::User;
use crate::transport::{Transport, TransportEvent};

/// Largest whisper (event name + payload) accepted by default.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 10_240;

/// Statistics for monitoring hub health.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HubStats {
    pub messages_sent: u64,
    pub messages_rejected: u64,
    pub channels: usize,
    pub members: usize,
}

struct Member {
    user: User,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

#[derive(Default)]
struct Channel {
    /// Join order is kept so rosters come out stable.
    members: Vec<(u64, Member)>,
}

impl Channel {
    fn roster(&self) -> Vec<User> {
        let mut users: Vec<User> = Vec::new();
        for (_, m) in &self.members {
            if !users.contains(&m.user) {
                users.push(m.user.clone());
            }
        }
        users
    }

    fn has_user(&self, user: &User) -> bool {
        self.members.iter().any(|(_, m)| m.user == *user)
    }

    fn send_others(&self, except: u64, event: &TransportEvent) -> usize {
        self.members
            .iter()
            .filter(|(id, _)| *id != except)
            .filter(|(_, m)| m.tx.send(event.clone()).is_ok())
            .count()
    }
}

struct HubInner {
    channels: Mutex<HashMap<String, Channel>>,
    event_counts: Mutex<HashMap<String, u64>>,
    max_message_bytes: usize,
    next_member: AtomicU64,
    messages_sent: AtomicU64,
    messages_rejected: AtomicU64,
}

/// Channel registry. Cheap to clone; clones share the same channels.
#[derive(Clone)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_BYTES)
    }
}

impl LocalHub {
    pub fn new(max_message_bytes: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                channels: Mutex::new(HashMap::new()),
                event_counts: Mutex::new(HashMap::new()),
                max_message_bytes,
                next_member: AtomicU64::new(1),
                messages_sent: AtomicU64::new(0),
                messages_rejected: AtomicU64::new(0),
            }),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, Channel>> {
        self.inner.channels.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Join `channel` as `user`.
    ///
    /// The receiver gets `Here` with the roster (including `user`) first.
    pub fn join(&self, channel: &str, user: User) -> (HubTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let member_id = self.inner.next_member.fetch_add(1, Ordering::Relaxed);

        {
            let mut channels = self.channels();
            let ch = channels.entry(channel.to_string()).or_default();
            if !ch.has_user(&user) {
                ch.send_others(member_id, &TransportEvent::Joining(user.clone()));
            }
            ch.members.push((member_id, Member { user: user.clone(), tx: tx.clone() }));
            let _ = tx.send(TransportEvent::Here(ch.roster()));
        }
        log::debug!("{} joined {channel} (member {member_id})", user.name);

        let transport = HubTransport {
            hub: self.clone(),
            channel: channel.to_string(),
            member_id,
            user,
            left: AtomicBool::new(false),
        };
        (transport, rx)
    }

    fn leave(&self, channel: &str, member_id: u64) {
        let mut channels = self.channels();
        let Some(ch) = channels.get_mut(channel) else {
            return;
        };
        let Some(pos) = ch.members.iter().position(|(id, _)| *id == member_id) else {
            return;
        };
        let (_, member) = ch.members.remove(pos);
        if !ch.has_user(&member.user) {
            ch.send_others(member_id, &TransportEvent::Leaving(member.user.clone()));
        }
        if ch.members.is_empty() {
            channels.remove(channel);
        }
        log::debug!("{} left {channel} (member {member_id})", member.user.name);
    }

    fn whisper(&self, channel: &str, from: u64, event: &str, payload: &str) -> Result<usize, TransportError> {
        let size = event.len() + payload.len();
        if size > self.inner.max_message_bytes {
            self.inner.messages_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::TooLarge { size, limit: self.inner.max_message_bytes });
        }

        let delivered = {
            let channels = self.channels();
            let Some(ch) = channels.get(channel) else {
                return Err(TransportError::Disconnected);
            };
            if !ch.members.iter().any(|(id, _)| *id == from) {
                return Err(TransportError::Disconnected);
            }
            ch.send_others(
                from,
                &TransportEvent::Whisper { event: event.to_string(), payload: payload.to_string() },
            )
        };

        self.inner.messages_sent.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut counts) = self.inner.event_counts.lock() {
            *counts.entry(event.to_string()).or_insert(0) += 1;
        }
        Ok(delivered)
    }

    /// Whispers sent under `event` so far, across all channels.
    pub fn event_count(&self, event: &str) -> u64 {
        self.inner
            .event_counts
            .lock()
            .map(|c| c.get(event).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Users currently on `channel`.
    pub fn roster(&self, channel: &str) -> Vec<User> {
        self.channels().get(channel).map(Channel::roster).unwrap_or_default()
    }

    pub fn member_count(&self, channel: &str) -> usize {
        self.channels().get(channel).map_or(0, |c| c.members.len())
    }

    pub fn stats(&self) -> HubStats {
        let channels = self.channels();
        HubStats {
            messages_sent: self.inner.messages_sent.load(Ordering::Relaxed),
            messages_rejected: self.inner.messages_rejected.load(Ordering::Relaxed),
            channels: channels.len(),
            members: channels.values().map(|c| c.members.len()).sum(),
        }
    }

    pub fn max_message_bytes(&self) -> usize {
        self.inner.max_message_bytes
    }
}

/// One connection to a hub channel. Leaves the channel when dropped.
pub struct HubTransport {
    hub: LocalHub,
    channel: String,
    member_id: u64,
    user: User,
    left: AtomicBool,
}

impl HubTransport {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn leave(&self) {
        if !self.left.swap(true, Ordering::SeqCst) {
            self.hub.leave(&self.channel, self.member_id);
        }
    }
}

impl Transport for HubTransport {
    fn whisper(&self, event: &str, payload: &str) -> Result<(), TransportError> {
        if self.left.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        self.hub.whisper(&self.channel, self.member_id, event, payload)?;
        Ok(())
    }
}

impl Drop for HubTransport {
    fn drop(&mut self) {
        self.leave();
    }
}

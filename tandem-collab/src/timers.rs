//! Cancellable one-shot timers that report back through a channel.
//!
//! Each timer is a spawned `sleep` that posts an event built from its key
//! and a generation number. Re-arming or cancelling aborts the task; the
//! generation check catches a timer that fired just before it was
//! cancelled, whose event is already queued.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::protocol::FieldKind;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Quiet period after an edit before the field is flushed.
    Debounce(FieldKind, String),
    /// Grace period before a remote user's lock is released.
    RemoteUnlock(String),
    /// Grace period before our own blurred field stops counting as focused.
    LocalRelease(String),
    /// Focused field with no edits.
    FieldInactivity(String),
    /// No edits anywhere.
    SessionIdle,
    /// End of the post-join warm-up.
    WarmupEnd,
}

struct Armed {
    generation: u64,
    abort: AbortHandle,
}

pub struct Timers<E> {
    tx: mpsc::UnboundedSender<E>,
    make_event: fn(TimerKey, u64) -> E,
    armed: HashMap<TimerKey, Armed>,
    next_generation: u64,
}

impl<E: Send + 'static> Timers<E> {
    pub fn new(tx: mpsc::UnboundedSender<E>, make_event: fn(TimerKey, u64) -> E) -> Self {
        Self {
            tx,
            make_event,
            armed: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Arm `key`, replacing a timer already armed under it.
    pub fn schedule(&mut self, key: TimerKey, after: Duration) {
        self.cancel(&key);
        self.next_generation += 1;
        let generation = self.next_generation;
        let event = (self.make_event)(key.clone(), generation);
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(event);
        });
        self.armed.insert(key, Armed { generation, abort: task.abort_handle() });
    }

    /// Returns `true` if a timer was armed under `key`.
    pub fn cancel(&mut self, key: &TimerKey) -> bool {
        match self.armed.remove(key) {
            Some(armed) => {
                armed.abort.abort();
                true
            }
            None => false,
        }
    }

    /// Accept a fired event. Stale generations (re-armed or cancelled
    /// since) return `false` and must be ignored.
    pub fn fire(&mut self, key: &TimerKey, generation: u64) -> bool {
        if self.armed.get(key).is_some_and(|a| a.generation == generation) {
            self.armed.remove(key);
            return true;
        }
        false
    }

    pub fn is_armed(&self, key: &TimerKey) -> bool {
        self.armed.contains_key(key)
    }

    pub fn cancel_all(&mut self) {
        for (_, armed) in self.armed.drain() {
            armed.abort.abort();
        }
    }
}

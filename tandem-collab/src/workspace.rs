//! The sync engine for one editing session.
//!
//! ## Architecture
//!
//! ```text
//!  host UI ──WorkspaceHandle──┐
//!  transport ─TransportEvent──┼──► mpsc ──► Workspace (one task)
//!  timers ────TimerFired──────┤               │  presence, locks,
//!  cache calls ─Persisted/────┘               │  changes, merge
//!              Fetched                        ▼
//!                              DocumentStore · StateCache · Transport · Notifier
//! ```
//!
//! Everything the workspace reacts to arrives as a [`WorkspaceEvent`] and is
//! handled to completion before the next one, so its state needs no locking.
//! Slow work (cache requests, timers) runs in spawned tasks that post their
//! outcome back as another event.
//!
//! ## Propagation
//!
//! A local edit marks the field dirty and (re)starts its debounce timer.
//! When the timer fires the field is persisted to the cache; small values
//! also travel directly in a `field-update` whisper, large ones are
//! announced with `fetch-field` once the cache has them. Blur and teardown
//! flush immediately.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::cache::{CacheUpdate, CachedState, StateCache};
use crate::changes::{ChangeCache, DirtyFields, FieldKey, PendingWrite, SaveStatus, SaveTracker};
use crate::config::WorkspaceConfig;
use crate::document::{DocumentStore, FieldChange};
use crate::error::{CacheError, WorkspaceError};
use crate::lifecycle::{self, LifecycleEvent, LifecycleReaction};
use crate::locks::{FieldLocks, LockPhase, RemoteFocus};
use crate::merge::{filter_meta, plan_merge};
use crate::notify::{BlockingModal, Notifier, StatusSnapshot, Toast};
use crate::presence::PresenceTracker;
use crate::protocol::{FieldKind, FieldMap, User, WhisperMessage};
use crate::timers::{TimerKey, Timers};
use crate::transport::{ChunkedChannel, Transport, TransportEvent};
use crate::window::WindowId;

/// Inputs to the workspace task.
#[derive(Debug)]
pub enum WorkspaceEvent {
    Transport(TransportEvent),
    /// The transport's event stream ended.
    TransportClosed,
    Focus(String),
    Blur(String),
    /// `external` is set when the change was reported while merged state
    /// was being written into the document.
    FieldChanged { change: FieldChange, external: bool },
    VisibilityChanged(bool),
    ForceUnlock { handle: String, user: User },
    SiblingDetected(WindowId),
    SiblingGone(WindowId),
    Lifecycle { event: LifecycleEvent, done: Option<oneshot::Sender<()>> },
    TimerFired { key: TimerKey, generation: u64 },
    Persisted { write: PendingWrite, direct: bool, result: Result<(), CacheError> },
    Fetched { target: FetchTarget, result: Result<CachedState, CacheError> },
    Query(oneshot::Sender<WorkspaceStatus>),
    Destroy(oneshot::Sender<()>),
}

/// Why a fetch was issued.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchTarget {
    /// Join, peer notice, visibility or reconnect. One at a time.
    Reconcile,
    /// Last look at the cache before a remote lock on `handle` is released.
    Unlock(String),
}

/// Point-in-time view of a workspace, for the host and for tests.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceStatus {
    pub window_id: WindowId,
    pub save_status: SaveStatus,
    pub users: Vec<User>,
    pub active_windows: usize,
    pub alone: bool,
    pub in_warmup: bool,
    /// `(handle, owner)` of fields held by other users.
    pub locked: Vec<(String, User)>,
    /// Fields focused in this window.
    pub focused: Vec<String>,
    pub dirty_fields: usize,
    pub pending_chunks: usize,
}

/// Set while merged state is written into the document; cleared on drop.
struct ReentrancyGuard(Arc<AtomicBool>);

impl ReentrancyGuard {
    fn enter(flag: &Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag.clone())
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Workspace {
    config: WorkspaceConfig,
    user: User,
    window: WindowId,
    document: Arc<dyn DocumentStore>,
    cache: Arc<dyn StateCache>,
    notifier: Arc<dyn Notifier>,
    channel: ChunkedChannel,
    presence: PresenceTracker,
    locks: FieldLocks,
    seen: ChangeCache,
    dirty: DirtyFields,
    save: SaveTracker,
    timers: Timers<WorkspaceEvent>,
    applying: Arc<AtomicBool>,
    events_tx: mpsc::UnboundedSender<WorkspaceEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<WorkspaceEvent>>,
    fetch_in_flight: bool,
    persisting: HashSet<FieldKey>,
    /// Blurred handles that announce `sync-now` once fully persisted.
    sync_after_persist: HashSet<String>,
    /// A save happened; clear the cache once in-flight persists land.
    clear_pending: bool,
    hidden: bool,
    last_status: Option<StatusSnapshot>,
    closing: Option<oneshot::Sender<()>>,
}

impl Workspace {
    pub fn new(
        config: WorkspaceConfig,
        user: User,
        document: Arc<dyn DocumentStore>,
        cache: Arc<dyn StateCache>,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn Notifier>,
    ) -> (Workspace, WorkspaceHandle) {
        let window = WindowId::generate();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let applying = Arc::new(AtomicBool::new(false));

        let handle = WorkspaceHandle {
            tx: events_tx.clone(),
            applying: applying.clone(),
            window_id: window.clone(),
        };

        let workspace = Workspace {
            channel: ChunkedChannel::new(transport, window.clone(), &config),
            presence: PresenceTracker::new(window.clone(), config.warmup),
            locks: FieldLocks::new(user.clone(), window.clone()),
            seen: ChangeCache::default(),
            dirty: DirtyFields::default(),
            save: SaveTracker::new(document.values(), config.is_saved),
            timers: Timers::new(events_tx.clone(), |key, generation| WorkspaceEvent::TimerFired {
                key,
                generation,
            }),
            applying,
            events_tx,
            events_rx: Some(events_rx),
            fetch_in_flight: false,
            persisting: HashSet::new(),
            sync_after_persist: HashSet::new(),
            clear_pending: false,
            hidden: false,
            last_status: None,
            closing: None,
            config,
            user,
            window,
            document,
            cache,
            notifier,
        };
        (workspace, handle)
    }

    pub fn window_id(&self) -> &WindowId {
        &self.window
    }

    /// Run the workspace on its own task, fed by `transport_rx`.
    pub fn start(self, transport_rx: mpsc::UnboundedReceiver<TransportEvent>) -> JoinHandle<()> {
        tokio::spawn(self.run(transport_rx))
    }

    async fn run(mut self, mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>) {
        let Some(mut events_rx) = self.events_rx.take() else {
            return;
        };
        self.on_start();

        let mut transport_open = true;
        loop {
            let next = tokio::select! {
                event = events_rx.recv() => event,
                event = transport_rx.recv(), if transport_open => Some(match event {
                    Some(e) => WorkspaceEvent::Transport(e),
                    None => WorkspaceEvent::TransportClosed,
                }),
            };
            let Some(event) = next else { break };
            if matches!(event, WorkspaceEvent::TransportClosed) {
                transport_open = false;
            }
            self.handle(event);
            if self.try_finish_close() {
                break;
            }
        }
        log::debug!("Workspace {} stopped", self.window);
    }

    fn on_start(&mut self) {
        log::info!(
            "Workspace {} opening {} as {}",
            self.window,
            self.config.channel_name(),
            self.user.name
        );
        self.seen.seed(FieldKind::Value, &self.document.values());
        self.seen.seed(FieldKind::Meta, &self.document.meta());
        self.timers.schedule(TimerKey::SessionIdle, self.config.session_idle);
        self.publish_status();
    }

    fn handle(&mut self, event: WorkspaceEvent) {
        if self.closing.is_some() && event_is_host_input(&event) {
            log::debug!("Workspace {} closing, ignoring {event:?}", self.window);
            return;
        }
        match event {
            WorkspaceEvent::Transport(event) => self.on_transport(event),
            WorkspaceEvent::TransportClosed => {
                log::warn!("Transport for {} closed", self.config.channel_name());
            }
            WorkspaceEvent::Focus(handle) => self.on_local_focus(&handle),
            WorkspaceEvent::Blur(handle) => self.on_local_blur(&handle),
            WorkspaceEvent::FieldChanged { change, external } => self.on_field_changed(change, external),
            WorkspaceEvent::VisibilityChanged(visible) => self.on_visibility(visible),
            WorkspaceEvent::ForceUnlock { handle, user } => {
                self.send(
                    WhisperMessage::ForceUnlock {
                        handle,
                        target_user: user.id,
                        requester: self.user.clone(),
                        requester_window: self.window.clone(),
                    },
                    false,
                );
            }
            WorkspaceEvent::SiblingDetected(window) => {
                self.presence.sibling_detected(window);
                self.publish_status();
            }
            WorkspaceEvent::SiblingGone(window) => {
                self.presence.sibling_gone(&window);
                self.publish_status();
            }
            WorkspaceEvent::Lifecycle { event, done } => self.on_lifecycle(event, done),
            WorkspaceEvent::TimerFired { key, generation } => {
                if self.timers.fire(&key, generation) {
                    self.on_timer(key);
                }
            }
            WorkspaceEvent::Persisted { write, direct, result } => self.on_persisted(write, direct, result),
            WorkspaceEvent::Fetched { target, result } => self.on_fetched(target, result),
            WorkspaceEvent::Query(reply) => {
                let _ = reply.send(self.status());
            }
            WorkspaceEvent::Destroy(done) => self.begin_close(done),
        }
    }

    // ── transport ────────────────────────────────────────────────

    fn on_transport(&mut self, event: TransportEvent) {
        let now = Instant::now();
        match event {
            TransportEvent::Here(users) => {
                log::info!("Joined {} with {} user(s)", self.config.channel_name(), users.len());
                self.presence.set_users(users, now);
                self.timers.schedule(TimerKey::WarmupEnd, self.config.warmup);
                self.send(
                    WhisperMessage::WindowJoined { window_id: self.window.clone(), user: self.user.clone() },
                    false,
                );
                self.request_fetch();
                self.publish_status();
            }
            TransportEvent::Joining(user) => {
                if self.presence.user_joining(user.clone()) && user != self.user {
                    self.notifier.toast(Toast::UserJoined(user));
                }
                self.publish_status();
            }
            TransportEvent::Leaving(user) => {
                if let Some(user) = self.presence.user_leaving(&user) {
                    if user != self.user {
                        self.notifier.toast(Toast::UserLeft(user.clone()));
                    }
                    for handle in self.locks.user_gone(&user) {
                        self.timers.schedule(TimerKey::RemoteUnlock(handle), self.config.unlock_grace);
                    }
                }
                self.publish_status();
            }
            TransportEvent::Whisper { event, payload } => match self.channel.receive(&event, &payload, now) {
                Ok(Some(msg)) => self.on_message(msg),
                Ok(None) => {}
                Err(e) => log::debug!("Dropping whisper {event}: {e}"),
            },
            TransportEvent::Disconnected => {
                log::warn!("Disconnected from {}", self.config.channel_name());
            }
        }
    }

    fn on_message(&mut self, msg: WhisperMessage) {
        match msg {
            WhisperMessage::WindowJoined { window_id, user } => {
                log::debug!("Window {window_id} of {} joined", user.name);
                self.presence.window_joined(window_id.clone());
                self.send(
                    WhisperMessage::WindowPresent { window_id: self.window.clone(), user: self.user.clone() },
                    false,
                );
                let snapshot = WhisperMessage::StateSnapshot {
                    target: window_id,
                    values: self.document.values(),
                    meta: filter_meta(&self.document.meta(), &self.config.private_meta_keys),
                    focus: self.locks.focus_map(),
                };
                self.send(snapshot, false);
                self.publish_status();
            }
            WhisperMessage::WindowPresent { window_id, .. } => {
                self.presence.window_present(window_id);
                self.publish_status();
            }
            WhisperMessage::WindowLeft { window_id } => {
                self.presence.window_left(&window_id);
                for handle in self.locks.window_gone(&window_id) {
                    self.timers.schedule(TimerKey::RemoteUnlock(handle), self.config.unlock_grace);
                }
                self.publish_status();
            }
            WhisperMessage::StateSnapshot { values, meta, focus, .. } => {
                self.apply_external(Some(&values), Some(&meta), None);
                for entry in focus {
                    self.on_remote_focus(&entry.user, &entry.handle, &entry.window_id);
                }
            }
            WhisperMessage::Focus { user, handle, window_id } => {
                self.presence.window_present(window_id.clone());
                self.on_remote_focus(&user, &handle, &window_id);
            }
            WhisperMessage::Blur { user, handle, window_id } => {
                if self.locks.remote_blur(&user, &handle, &window_id) {
                    self.timers.schedule(TimerKey::RemoteUnlock(handle), self.config.unlock_grace);
                }
            }
            WhisperMessage::FieldUpdate { handle, kind, value, .. } => {
                let mut patch = FieldMap::new();
                patch.insert(handle, value);
                match kind {
                    FieldKind::Value => self.apply_external(Some(&patch), None, None),
                    FieldKind::Meta => self.apply_external(None, Some(&patch), None),
                }
            }
            WhisperMessage::FetchField { .. } | WhisperMessage::SyncNow { .. } => self.request_fetch(),
            WhisperMessage::ForceUnlock { handle, target_user, requester, requester_window } => {
                if target_user != self.user.id || !self.locks.is_locally_focused(&handle) {
                    return;
                }
                log::info!("{} forced {handle} free", requester.name);
                self.document.blur_field(&handle);
                self.on_local_blur(&handle);
                self.timers.cancel(&TimerKey::LocalRelease(handle.clone()));
                self.locks.release_local(&handle);
                self.send(
                    WhisperMessage::ForceUnlocked {
                        handle: handle.clone(),
                        requester_window,
                        user: self.user.clone(),
                    },
                    false,
                );
                self.notifier.toast(Toast::ForceUnlocked { handle, by: requester });
            }
            WhisperMessage::ForceUnlocked { handle, requester_window, user } => {
                if requester_window != self.window {
                    return;
                }
                if self.locks.lock(&handle).is_some_and(|l| l.phase == LockPhase::PendingUnlock) {
                    self.timers.schedule(TimerKey::RemoteUnlock(handle.clone()), Duration::ZERO);
                }
                self.notifier.toast(Toast::ForceUnlockConfirmed { handle, user });
            }
            msg @ (WhisperMessage::Saved { .. }
            | WhisperMessage::Published { .. }
            | WhisperMessage::RevisionRestored { .. }) => match lifecycle::react(&msg, &self.user) {
                Some(LifecycleReaction::MarkSaved(toast)) => {
                    self.save.mark_saved(self.document.values());
                    self.notifier.toast(toast);
                    self.publish_status();
                }
                Some(LifecycleReaction::Block(modal)) => self.notifier.modal(modal),
                None => {}
            },
        }
    }

    fn on_remote_focus(&mut self, user: &User, handle: &str, window: &WindowId) {
        match self.locks.remote_focus(user, handle, window, Instant::now()) {
            RemoteFocus::Locked { previous } => {
                if let Some(previous) = previous {
                    log::debug!("{handle} passed from {} to {}", previous.name, user.name);
                }
                self.timers.cancel(&TimerKey::RemoteUnlock(handle.to_string()));
                self.document.lock_field(user, handle);
            }
            RemoteFocus::Refreshed => {
                self.timers.cancel(&TimerKey::RemoteUnlock(handle.to_string()));
                self.document.lock_field(user, handle);
            }
            RemoteFocus::Tracked | RemoteFocus::Ignored => {}
        }
    }

    // ── local focus ──────────────────────────────────────────────

    fn on_local_focus(&mut self, handle: &str) {
        if self.locks.focus_local(handle) {
            log::debug!("{handle} re-focused during release grace");
        }
        self.timers.cancel(&TimerKey::LocalRelease(handle.to_string()));
        self.timers
            .schedule(TimerKey::FieldInactivity(handle.to_string()), self.config.field_inactivity);
        self.send(
            WhisperMessage::Focus {
                user: self.user.clone(),
                handle: handle.to_string(),
                window_id: self.window.clone(),
            },
            false,
        );
    }

    fn on_local_blur(&mut self, handle: &str) {
        let was_focused = self.locks.blur_local(handle);

        self.flush_field(FieldKind::Value, handle);
        self.flush_field(FieldKind::Meta, handle);
        if self.has_outstanding(handle) {
            self.sync_after_persist.insert(handle.to_string());
        }

        if was_focused {
            self.timers.cancel(&TimerKey::FieldInactivity(handle.to_string()));
            self.timers
                .schedule(TimerKey::LocalRelease(handle.to_string()), self.config.unlock_grace);
            self.send(
                WhisperMessage::Blur {
                    user: self.user.clone(),
                    handle: handle.to_string(),
                    window_id: self.window.clone(),
                },
                false,
            );
        }
    }

    // ── edits and propagation ────────────────────────────────────

    fn on_field_changed(&mut self, change: FieldChange, external: bool) {
        let FieldChange { kind, handle, value } = change;
        if !self.seen.observe(kind, &handle, &value) {
            return;
        }
        self.timers.schedule(TimerKey::SessionIdle, self.config.session_idle);
        if external || self.applying.load(Ordering::SeqCst) {
            self.publish_status();
            return;
        }

        self.dirty.mark(kind, &handle, value, Instant::now());
        if self.locks.is_locally_focused(&handle) {
            self.timers
                .schedule(TimerKey::FieldInactivity(handle.clone()), self.config.field_inactivity);
        }
        self.timers.schedule(TimerKey::Debounce(kind, handle), self.config.debounce);
        self.publish_status();
    }

    /// Persist a dirty field now. Small values are whispered right away.
    fn flush_field(&mut self, kind: FieldKind, handle: &str) {
        self.timers.cancel(&TimerKey::Debounce(kind, handle.to_string()));
        let Some(write) = self.dirty.pending(kind, handle) else {
            return;
        };
        let key = (kind, handle.to_string());
        if self.persisting.contains(&key) {
            // picked up again when the running persist reports back
            return;
        }

        let size = write.value.to_string().len();
        let direct = size <= self.config.direct_update_limit;
        if direct {
            self.send(
                WhisperMessage::FieldUpdate {
                    handle: handle.to_string(),
                    kind,
                    value: write.value.clone(),
                    window_id: self.window.clone(),
                },
                false,
            );
        }

        log::debug!("Persisting {kind:?} {handle} ({size} bytes)");
        self.persisting.insert(key);
        let cache = self.cache.clone();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let update = CacheUpdate::field(write.kind, write.handle.clone(), write.value.clone());
            let result = cache.update(update).await;
            let _ = tx.send(WorkspaceEvent::Persisted { write, direct, result });
        });
    }

    fn flush_all(&mut self) {
        for write in self.dirty.all_pending() {
            self.flush_field(write.kind, &write.handle);
        }
    }

    fn has_outstanding(&self, handle: &str) -> bool {
        !self.dirty.pending_for(handle).is_empty()
            || self.persisting.contains(&(FieldKind::Value, handle.to_string()))
            || self.persisting.contains(&(FieldKind::Meta, handle.to_string()))
    }

    fn on_persisted(&mut self, write: PendingWrite, direct: bool, result: Result<(), CacheError>) {
        let PendingWrite { kind, handle, version, .. } = write;
        self.persisting.remove(&(kind, handle.clone()));

        match result {
            Ok(()) => {
                self.dirty.persisted(kind, &handle, version);
                if !direct {
                    self.send(
                        WhisperMessage::FetchField { handle: handle.clone(), kind, window_id: self.window.clone() },
                        false,
                    );
                }
            }
            Err(e) if e.is_retryable() && self.closing.is_none() => {
                log::warn!("Failed to persist {handle}, retrying: {e}");
                self.timers.schedule(TimerKey::Debounce(kind, handle.clone()), self.config.debounce);
            }
            Err(e) => {
                log::error!("Giving up on persisting {handle}: {e}");
                self.dirty.discard(kind, &handle);
            }
        }

        // edited again while this persist was running
        if self.dirty.is_dirty(kind, &handle) && !self.timers.is_armed(&TimerKey::Debounce(kind, handle.clone())) {
            self.flush_field(kind, &handle);
        }

        if self.sync_after_persist.contains(&handle) && !self.has_outstanding(&handle) {
            self.sync_after_persist.remove(&handle);
            self.send(WhisperMessage::SyncNow { window_id: self.window.clone() }, false);
        }

        if self.clear_pending && self.persisting.is_empty() {
            self.clear_cache();
        }
    }

    // ── reconciliation ───────────────────────────────────────────

    fn request_fetch(&mut self) {
        if self.fetch_in_flight {
            log::debug!("Fetch already in flight");
            return;
        }
        self.fetch_in_flight = true;
        self.spawn_fetch(FetchTarget::Reconcile);
    }

    fn spawn_fetch(&self, target: FetchTarget) {
        let cache = self.cache.clone();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = cache.fetch().await;
            let _ = tx.send(WorkspaceEvent::Fetched { target, result });
        });
    }

    fn on_fetched(&mut self, target: FetchTarget, result: Result<CachedState, CacheError>) {
        match target {
            FetchTarget::Reconcile => {
                self.fetch_in_flight = false;
                match result {
                    Ok(state) if state.exists => {
                        self.apply_external(state.values.as_ref(), state.meta.as_ref(), None);
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("Failed to fetch cached state: {e}"),
                }
            }
            FetchTarget::Unlock(handle) => {
                match result {
                    Ok(state) if state.exists => {
                        self.apply_external(state.values.as_ref(), state.meta.as_ref(), Some(&handle));
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("Failed to fetch {handle} before unlocking: {e}"),
                }
                if let Some(lock) = self.locks.commit_unlock(&handle) {
                    log::debug!("{handle} released by {}", lock.owner.name);
                    self.document.unlock_field(&handle);
                }
            }
        }
    }

    /// Merge state that came from another window or the cache.
    ///
    /// `forced` bypasses local-edit protection for one handle.
    fn apply_external(&mut self, values: Option<&FieldMap>, meta: Option<&FieldMap>, forced: Option<&str>) {
        let now = Instant::now();
        let dirty = &self.dirty;
        let window = self.config.protection_window;
        let plan = plan_merge(&self.document.values(), &self.document.meta(), values, meta, |kind, handle| {
            forced != Some(handle) && (dirty.is_dirty(kind, handle) || dirty.is_protected(kind, handle, now, window))
        });

        for (kind, handle) in &plan.skipped {
            log::debug!("Keeping local {kind:?} {handle}");
        }
        if plan.is_empty() {
            return;
        }

        let changes = {
            let _guard = ReentrancyGuard::enter(&self.applying);
            let mut changes = self.document.set_values(plan.values);
            changes.extend(self.document.set_meta(plan.meta));
            changes
        };
        for change in &changes {
            self.seen.observe(change.kind, &change.handle, &change.value);
        }
        log::debug!("Merged {} field(s)", changes.len());
        self.publish_status();
    }

    // ── timers ───────────────────────────────────────────────────

    fn on_timer(&mut self, key: TimerKey) {
        match key {
            TimerKey::Debounce(kind, handle) => self.flush_field(kind, &handle),
            TimerKey::RemoteUnlock(handle) => {
                if self.locks.lock(&handle).is_some_and(|l| l.phase == LockPhase::PendingUnlock) {
                    self.spawn_fetch(FetchTarget::Unlock(handle));
                }
            }
            TimerKey::LocalRelease(handle) => {
                self.locks.release_local(&handle);
            }
            TimerKey::FieldInactivity(handle) => {
                if self.locks.is_locally_focused(&handle) {
                    log::info!("Releasing {handle} after inactivity");
                    self.document.blur_field(&handle);
                    self.on_local_blur(&handle);
                    self.notifier.toast(Toast::ReleasedForInactivity { handle });
                }
            }
            TimerKey::SessionIdle => self.notifier.modal(BlockingModal::Inactive),
            TimerKey::WarmupEnd => self.publish_status(),
        }
    }

    // ── host lifecycle ───────────────────────────────────────────

    fn on_visibility(&mut self, visible: bool) {
        if !visible {
            self.hidden = true;
            self.flush_all();
        } else if self.hidden {
            self.hidden = false;
            self.request_fetch();
        }
    }

    fn on_lifecycle(&mut self, event: LifecycleEvent, done: Option<oneshot::Sender<()>>) {
        self.send(event.announcement(self.user.clone(), self.window.clone()), true);

        if event.persists_document() {
            self.save.mark_saved(self.document.values());
            self.flush_all();
            self.clear_pending = true;
            if self.persisting.is_empty() {
                self.clear_cache();
            }
            self.publish_status();
        }

        if let Some(done) = done {
            let delay = match event {
                LifecycleEvent::RevisionRestored => self.config.revision_restore_delay,
                _ => Duration::ZERO,
            };
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = done.send(());
            });
        }
    }

    fn clear_cache(&mut self) {
        self.clear_pending = false;
        let cache = self.cache.clone();
        tokio::spawn(async move {
            if let Err(e) = cache.clear().await {
                log::warn!("Failed to clear cached state: {e}");
            }
        });
    }

    fn begin_close(&mut self, done: oneshot::Sender<()>) {
        log::info!("Workspace {} closing", self.window);
        for handle in self.locks.focused_handles() {
            self.on_local_blur(&handle);
        }
        self.flush_all();
        self.closing = Some(done);
    }

    /// Finish teardown once nothing is being persisted.
    fn try_finish_close(&mut self) -> bool {
        if self.closing.is_none() || !self.persisting.is_empty() {
            return false;
        }
        self.send(WhisperMessage::WindowLeft { window_id: self.window.clone() }, false);
        self.timers.cancel_all();
        for handle in self.locks.clear() {
            self.document.unlock_field(&handle);
        }
        self.seen.clear();
        self.dirty.clear();
        if let Some(done) = self.closing.take() {
            let _ = done.send(());
        }
        true
    }

    // ── helpers ──────────────────────────────────────────────────

    fn send(&mut self, msg: WhisperMessage, force: bool) {
        let alone = self.presence.is_alone(Instant::now());
        match self.channel.whisper(&msg, force, alone) {
            Ok(true) => log::trace!("Sent {}", msg.event_name()),
            Ok(false) => log::trace!("Alone, not sending {}", msg.event_name()),
            Err(e) => log::warn!("Failed to send {}: {e}", msg.event_name()),
        }
    }

    fn snapshot(&self) -> StatusSnapshot {
        let occupancy = self.presence.occupancy();
        StatusSnapshot {
            save_status: self.save.status(&self.document.values()),
            users: occupancy.users,
            active_windows: occupancy.active_windows,
            alone: self.presence.is_alone(Instant::now()),
        }
    }

    fn publish_status(&mut self) {
        let status = self.snapshot();
        if self.last_status.as_ref() != Some(&status) {
            self.notifier.status(status.clone());
            self.last_status = Some(status);
        }
    }

    fn status(&self) -> WorkspaceStatus {
        let snapshot = self.snapshot();
        let mut focused = self.locks.focused_handles();
        focused.sort();
        WorkspaceStatus {
            window_id: self.window.clone(),
            save_status: snapshot.save_status,
            users: snapshot.users,
            active_windows: snapshot.active_windows,
            alone: snapshot.alone,
            in_warmup: self.presence.in_warmup(Instant::now()),
            locked: self.locks.locked(),
            focused,
            dirty_fields: self.dirty.len(),
            pending_chunks: self.channel.pending_chunks(),
        }
    }
}

fn event_is_host_input(event: &WorkspaceEvent) -> bool {
    matches!(
        event,
        WorkspaceEvent::Focus(_)
            | WorkspaceEvent::FieldChanged { .. }
            | WorkspaceEvent::ForceUnlock { .. }
            | WorkspaceEvent::Lifecycle { .. }
            | WorkspaceEvent::Destroy(_)
    )
}

// ─── Handle ─────────────────────────────────────────────────────

/// Host-side handle to a running [`Workspace`]. Cheap to clone.
#[derive(Clone)]
pub struct WorkspaceHandle {
    tx: mpsc::UnboundedSender<WorkspaceEvent>,
    applying: Arc<AtomicBool>,
    window_id: WindowId,
}

impl WorkspaceHandle {
    fn post(&self, event: WorkspaceEvent) -> Result<(), WorkspaceError> {
        self.tx.send(event).map_err(|_| WorkspaceError::Stopped)
    }

    pub fn window_id(&self) -> &WindowId {
        &self.window_id
    }

    pub fn focus(&self, handle: &str) -> Result<(), WorkspaceError> {
        self.post(WorkspaceEvent::Focus(handle.to_string()))
    }

    pub fn blur(&self, handle: &str) -> Result<(), WorkspaceError> {
        self.post(WorkspaceEvent::Blur(handle.to_string()))
    }

    /// Report a document mutation. Safe to call from inside
    /// `DocumentStore::set_values`; such calls are recognised as merges.
    pub fn field_changed(&self, change: FieldChange) -> Result<(), WorkspaceError> {
        let external = self.applying.load(Ordering::SeqCst);
        self.post(WorkspaceEvent::FieldChanged { change, external })
    }

    pub fn visibility_changed(&self, visible: bool) -> Result<(), WorkspaceError> {
        self.post(WorkspaceEvent::VisibilityChanged(visible))
    }

    /// Ask `user`'s window to give up `handle`.
    pub fn force_unlock(&self, handle: &str, user: &User) -> Result<(), WorkspaceError> {
        self.post(WorkspaceEvent::ForceUnlock { handle: handle.to_string(), user: user.clone() })
    }

    pub fn sibling_detected(&self, window: WindowId) -> Result<(), WorkspaceError> {
        self.post(WorkspaceEvent::SiblingDetected(window))
    }

    pub fn sibling_gone(&self, window: WindowId) -> Result<(), WorkspaceError> {
        self.post(WorkspaceEvent::SiblingGone(window))
    }

    pub fn saved(&self) -> Result<(), WorkspaceError> {
        self.post(WorkspaceEvent::Lifecycle { event: LifecycleEvent::Saved, done: None })
    }

    pub fn published(&self) -> Result<(), WorkspaceError> {
        self.post(WorkspaceEvent::Lifecycle { event: LifecycleEvent::Published, done: None })
    }

    /// Announce a revision restore. Resolves after a short delay so the
    /// announcement leaves before the host navigates away.
    pub async fn revision_restored(&self) -> Result<(), WorkspaceError> {
        let (done, rx) = oneshot::channel();
        self.post(WorkspaceEvent::Lifecycle { event: LifecycleEvent::RevisionRestored, done: Some(done) })?;
        rx.await.map_err(|_| WorkspaceError::Stopped)
    }

    pub async fn status(&self) -> Result<WorkspaceStatus, WorkspaceError> {
        let (reply, rx) = oneshot::channel();
        self.post(WorkspaceEvent::Query(reply))?;
        rx.await.map_err(|_| WorkspaceError::Stopped)
    }

    /// Flush, leave the channel and stop the workspace.
    pub async fn destroy(&self) -> Result<(), WorkspaceError> {
        let (done, rx) = oneshot::channel();
        self.post(WorkspaceEvent::Destroy(done))?;
        rx.await.map_err(|_| WorkspaceError::Stopped)
    }
}

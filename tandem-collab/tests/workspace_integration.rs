//! End-to-end tests: several workspaces sharing one in-process hub and one
//! cache service, running on paused time.

use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tandem_collab::{
    BlockingModal, CacheUpdate, FieldKind, LocalHub, MemoryCacheService, MemoryDocument, RecordingNotifier,
    SaveStatus, Toast, User, Workspace, WorkspaceConfig, WorkspaceHandle,
};

struct Window {
    handle: WorkspaceHandle,
    document: Arc<MemoryDocument>,
    notifier: Arc<RecordingNotifier>,
}

impl Window {
    /// Edit a field locally and report it, the way the editor host does.
    fn type_in(&self, kind: FieldKind, handle: &str, value: Value) {
        let change = self.document.edit(kind, handle, value);
        self.handle.field_changed(change).unwrap();
    }
}

fn alice() -> User {
    User::new(1, "Alice")
}

fn bob() -> User {
    User::new(2, "Bob")
}

fn config() -> WorkspaceConfig {
    WorkspaceConfig::for_document("1", "default")
}

fn open(hub: &LocalHub, service: &MemoryCacheService, user: User) -> Window {
    open_with(hub, service, user, MemoryDocument::default())
}

fn open_with(hub: &LocalHub, service: &MemoryCacheService, user: User, document: MemoryDocument) -> Window {
    let config = config();
    let (transport, transport_rx) = hub.join(&config.channel_name(), user.clone());
    let document = Arc::new(document);
    let notifier = Arc::new(RecordingNotifier::default());
    let (workspace, handle) = Workspace::new(
        config,
        user,
        document.clone(),
        Arc::new(service.client("1", "default")),
        Arc::new(transport),
        notifier.clone(),
    );
    workspace.start(transport_rx);
    Window { handle, document, notifier }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

async fn sleep_secs(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

#[tokio::test(start_paused = true)]
async fn test_remote_focus_locks_until_grace_passes() {
    let hub = LocalHub::default();
    let service = MemoryCacheService::default();
    let a = open(&hub, &service, alice());
    let b = open(&hub, &service, bob());
    settle().await;

    a.handle.focus("title").unwrap();
    settle().await;
    assert_eq!(b.document.locked_by("title"), Some(alice()));
    assert_eq!(b.handle.status().await.unwrap().locked, vec![("title".to_string(), alice())]);
    assert!(a.document.locked_by("title").is_none());

    a.handle.blur("title").unwrap();
    sleep_secs(2).await;
    assert_eq!(b.document.locked_by("title"), Some(alice()));

    sleep_secs(2).await;
    assert!(b.document.locked_by("title").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_refocus_during_grace_keeps_lock() {
    let hub = LocalHub::default();
    let service = MemoryCacheService::default();
    let a = open(&hub, &service, alice());
    let b = open(&hub, &service, bob());
    settle().await;

    a.handle.focus("title").unwrap();
    settle().await;
    a.handle.blur("title").unwrap();
    sleep_secs(1).await;
    a.handle.focus("title").unwrap();
    sleep_secs(5).await;

    assert_eq!(b.document.locked_by("title"), Some(alice()));
}

#[tokio::test(start_paused = true)]
async fn test_alone_skips_whisper_but_persists() {
    let hub = LocalHub::default();
    let service = MemoryCacheService::default();
    let a = open(&hub, &service, alice());
    sleep_secs(6).await;
    assert!(a.handle.status().await.unwrap().alone);

    a.type_in(FieldKind::Value, "title", json!("Hello"));
    sleep_secs(1).await;

    assert_eq!(hub.event_count("field-update"), 0);
    let cached = service.peek("1", "default").await;
    assert!(cached.exists);
    assert_eq!(cached.values.unwrap().get("title"), Some(&json!("Hello")));
}

#[tokio::test(start_paused = true)]
async fn test_large_change_goes_through_cache() {
    let hub = LocalHub::default();
    let service = MemoryCacheService::default();
    let a = open(&hub, &service, alice());
    let b = open(&hub, &service, bob());
    settle().await;

    let body = json!("x".repeat(10 * 1024));
    a.type_in(FieldKind::Meta, "body", body.clone());
    sleep_secs(1).await;

    assert_eq!(hub.event_count("field-update"), 0);
    assert_eq!(hub.event_count("fetch-field"), 1);
    assert_eq!(
        service.updates_for("1", "default").await,
        vec![CacheUpdate::field(FieldKind::Meta, "body", body.clone())]
    );
    assert_eq!(b.document.meta_value("body"), Some(body));
}

#[tokio::test(start_paused = true)]
async fn test_same_user_windows_never_lock() {
    let hub = LocalHub::default();
    let service = MemoryCacheService::default();
    let first = open(&hub, &service, alice());
    let second = open(&hub, &service, alice());
    settle().await;
    assert_eq!(second.handle.status().await.unwrap().active_windows, 2);

    first.handle.focus("title").unwrap();
    first.type_in(FieldKind::Value, "title", json!("draft"));
    sleep_secs(1).await;

    assert!(second.document.locked_by("title").is_none());
    assert!(second.handle.status().await.unwrap().locked.is_empty());
    assert_eq!(second.document.value("title"), Some(json!("draft")));
}

#[tokio::test(start_paused = true)]
async fn test_keystrokes_collapse_into_one_update() {
    let hub = LocalHub::default();
    let service = MemoryCacheService::default();
    let a = open(&hub, &service, alice());
    let b = open(&hub, &service, bob());
    settle().await;

    for text in ["H", "He", "Hel", "Hell", "Hello"] {
        a.type_in(FieldKind::Value, "title", json!(text));
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    sleep_secs(1).await;

    assert_eq!(hub.event_count("field-update"), 1);
    assert_eq!(service.update_count(), 1);
    assert_eq!(b.document.value("title"), Some(json!("Hello")));
    assert_eq!(b.handle.status().await.unwrap().save_status, SaveStatus::ChangesNotSaved);
}

#[tokio::test(start_paused = true)]
async fn test_recent_local_edit_is_protected() {
    let hub = LocalHub::default();
    let service = MemoryCacheService::default();
    let a = open(&hub, &service, alice());
    let b = open(&hub, &service, bob());
    settle().await;

    b.type_in(FieldKind::Value, "body", json!("bob draft"));
    sleep_secs(1).await;
    assert_eq!(a.document.value("body"), Some(json!("bob draft")));

    a.type_in(FieldKind::Value, "body", json!("alice rewrite"));
    sleep_secs(1).await;
    assert_eq!(b.document.value("body"), Some(json!("bob draft")));

    sleep_secs(4).await;
    a.type_in(FieldKind::Value, "body", json!("alice again"));
    sleep_secs(1).await;
    assert_eq!(b.document.value("body"), Some(json!("alice again")));
}

#[tokio::test(start_paused = true)]
async fn test_joining_window_receives_snapshot() {
    let hub = LocalHub::default();
    let service = MemoryCacheService::default();

    let mut values = Map::new();
    values.insert("title".into(), json!("Hello"));
    let mut meta = Map::new();
    meta.insert("body".into(), json!("y".repeat(20 * 1024)));
    meta.insert("errors".into(), json!({"title": "too short"}));
    let a = open_with(&hub, &service, alice(), MemoryDocument::new(values, meta));
    a.handle.focus("title").unwrap();
    settle().await;

    let b = open(&hub, &service, bob());
    sleep_secs(1).await;

    let snapshot_event = format!("chunked-state-snapshot-{}", b.handle.window_id());
    assert!(hub.event_count(&snapshot_event) > 1);
    assert_eq!(b.document.value("title"), Some(json!("Hello")));
    assert_eq!(b.document.meta_value("body"), Some(json!("y".repeat(20 * 1024))));
    assert!(b.document.meta_value("errors").is_none());
    assert_eq!(b.document.locked_by("title"), Some(alice()));
    assert_eq!(b.handle.status().await.unwrap().pending_chunks, 0);
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_during_release_grace_leaves_field_unlocked() {
    let hub = LocalHub::default();
    let service = MemoryCacheService::default();
    let a = open(&hub, &service, alice());
    a.handle.focus("title").unwrap();
    a.handle.focus("body").unwrap();
    settle().await;
    a.handle.blur("title").unwrap();
    settle().await;

    let b = open(&hub, &service, bob());
    sleep_secs(1).await;
    assert_eq!(b.document.locked_by("body"), Some(alice()));
    assert!(b.document.locked_by("title").is_none());

    sleep_secs(60).await;
    assert!(b.document.locked_by("title").is_none());
    assert!(b.handle.status().await.unwrap().locked.iter().all(|(h, _)| h != "title"));
}

#[tokio::test(start_paused = true)]
async fn test_owner_in_two_windows_keeps_lock_until_last_blur() {
    let hub = LocalHub::default();
    let service = MemoryCacheService::default();
    let a = open(&hub, &service, alice());
    let b1 = open(&hub, &service, bob());
    let b2 = open(&hub, &service, bob());
    settle().await;

    b1.handle.focus("title").unwrap();
    settle().await;
    b2.handle.focus("title").unwrap();
    settle().await;
    assert_eq!(a.document.locked_by("title"), Some(bob()));

    b1.handle.blur("title").unwrap();
    sleep_secs(10).await;
    assert_eq!(a.document.locked_by("title"), Some(bob()));

    b2.handle.blur("title").unwrap();
    sleep_secs(4).await;
    assert!(a.document.locked_by("title").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_force_unlock_frees_field() {
    let hub = LocalHub::default();
    let service = MemoryCacheService::default();
    let a = open(&hub, &service, alice());
    let b = open(&hub, &service, bob());
    settle().await;

    a.handle.focus("title").unwrap();
    settle().await;
    assert_eq!(b.document.locked_by("title"), Some(alice()));

    b.handle.force_unlock("title", &alice()).unwrap();
    settle().await;

    assert!(a.document.blurred().contains(&"title".to_string()));
    assert!(a.handle.status().await.unwrap().focused.is_empty());
    assert!(a
        .notifier
        .toasts()
        .contains(&Toast::ForceUnlocked { handle: "title".into(), by: bob() }));
    assert!(b
        .notifier
        .toasts()
        .contains(&Toast::ForceUnlockConfirmed { handle: "title".into(), user: alice() }));
    assert!(b.document.locked_by("title").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_force_unlock_for_other_user_is_ignored() {
    let hub = LocalHub::default();
    let service = MemoryCacheService::default();
    let a = open(&hub, &service, alice());
    let b = open(&hub, &service, bob());
    settle().await;

    a.handle.focus("title").unwrap();
    settle().await;
    b.handle.force_unlock("title", &User::new(99, "Carol")).unwrap();
    settle().await;

    assert!(a.document.blurred().is_empty());
    assert_eq!(b.document.locked_by("title"), Some(alice()));
}

#[tokio::test(start_paused = true)]
async fn test_save_notifies_and_clears_cache() {
    let hub = LocalHub::default();
    let service = MemoryCacheService::default();
    let a = open(&hub, &service, alice());
    let b = open(&hub, &service, bob());
    settle().await;

    a.type_in(FieldKind::Value, "title", json!("final"));
    sleep_secs(1).await;
    assert!(service.peek("1", "default").await.exists);
    assert_eq!(b.handle.status().await.unwrap().save_status, SaveStatus::ChangesNotSaved);

    a.handle.saved().unwrap();
    settle().await;

    assert!(!service.peek("1", "default").await.exists);
    assert!(b.notifier.toasts().contains(&Toast::SavedBy(alice())));
    assert_eq!(a.handle.status().await.unwrap().save_status, SaveStatus::Saved);
    assert_eq!(b.handle.status().await.unwrap().save_status, SaveStatus::Saved);
}

#[tokio::test(start_paused = true)]
async fn test_save_reaches_own_other_window() {
    let hub = LocalHub::default();
    let service = MemoryCacheService::default();
    let first = open(&hub, &service, alice());
    let second = open(&hub, &service, alice());
    sleep_secs(6).await;

    first.handle.saved().unwrap();
    settle().await;

    assert_eq!(hub.event_count("saved"), 1);
    assert!(second.notifier.toasts().contains(&Toast::SavedElsewhere));
}

#[tokio::test(start_paused = true)]
async fn test_publish_and_restore_block_other_windows() {
    let hub = LocalHub::default();
    let service = MemoryCacheService::default();
    let a = open(&hub, &service, alice());
    let b = open(&hub, &service, bob());
    settle().await;

    a.handle.published().unwrap();
    a.handle.revision_restored().await.unwrap();
    settle().await;

    assert_eq!(
        b.notifier.modals(),
        vec![BlockingModal::Published { by: alice() }, BlockingModal::RevisionRestored { by: alice() }]
    );
    assert!(a.notifier.modals().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_destroy_leaves_and_releases_locks() {
    let hub = LocalHub::default();
    let service = MemoryCacheService::default();
    let a = open(&hub, &service, alice());
    let b = open(&hub, &service, bob());
    settle().await;

    a.handle.focus("title").unwrap();
    a.type_in(FieldKind::Value, "title", json!("closing"));
    settle().await;

    a.handle.destroy().await.unwrap();
    settle().await;

    assert_eq!(hub.event_count("window-left"), 1);
    assert_eq!(b.document.value("title"), Some(json!("closing")));
    assert!(b.notifier.toasts().contains(&Toast::UserLeft(alice())));

    sleep_secs(4).await;
    assert!(b.document.locked_by("title").is_none());
    let status = b.handle.status().await.unwrap();
    assert_eq!(status.users, vec![bob()]);
    assert_eq!(status.active_windows, 1);
}

#[tokio::test(start_paused = true)]
async fn test_idle_field_is_released() {
    let hub = LocalHub::default();
    let service = MemoryCacheService::default();
    let a = open(&hub, &service, alice());
    let b = open(&hub, &service, bob());
    settle().await;

    a.handle.focus("title").unwrap();
    sleep_secs(40).await;
    assert_eq!(b.document.locked_by("title"), Some(alice()));

    sleep_secs(10).await;
    assert!(a
        .notifier
        .toasts()
        .contains(&Toast::ReleasedForInactivity { handle: "title".into() }));
    assert!(a.document.blurred().contains(&"title".to_string()));
    assert!(b.document.locked_by("title").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_returning_to_tab_refetches() {
    let hub = LocalHub::default();
    let service = MemoryCacheService::default();
    let a = open(&hub, &service, alice());
    settle().await;
    let fetches = service.fetch_count();

    a.handle.visibility_changed(false).unwrap();
    settle().await;
    assert_eq!(service.fetch_count(), fetches);

    a.handle.visibility_changed(true).unwrap();
    settle().await;
    assert_eq!(service.fetch_count(), fetches + 1);
}

//! Change detection, dirty tracking and save status.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

use crate::protocol::{FieldKind, FieldMap};

/// A field in one half of the document.
pub type FieldKey = (FieldKind, String);

/// Last seen serialized value per field.
///
/// The UI layer re-emits values that did not really change (new object,
/// same content); comparing serialized text filters that churn out.
#[derive(Debug, Default)]
pub struct ChangeCache {
    last_values: HashMap<String, String>,
    last_meta: HashMap<String, String>,
}

impl ChangeCache {
    fn side(&mut self, kind: FieldKind) -> &mut HashMap<String, String> {
        match kind {
            FieldKind::Value => &mut self.last_values,
            FieldKind::Meta => &mut self.last_meta,
        }
    }

    /// Records `value`; returns `true` if it differs from the last one seen.
    pub fn observe(&mut self, kind: FieldKind, handle: &str, value: &Value) -> bool {
        let serialized = value.to_string();
        let side = self.side(kind);
        if side.get(handle) == Some(&serialized) {
            return false;
        }
        side.insert(handle.to_string(), serialized);
        true
    }

    /// Records every field of `map` without reporting changes.
    pub fn seed(&mut self, kind: FieldKind, map: &FieldMap) {
        let side = self.side(kind);
        for (handle, value) in map {
            side.insert(handle.clone(), value.to_string());
        }
    }

    pub fn clear(&mut self) {
        self.last_values.clear();
        self.last_meta.clear();
    }
}

#[derive(Debug, Clone)]
struct DirtyEntry {
    value: Value,
    version: u64,
}

/// Local edits waiting to be persisted, plus when each field was last
/// edited locally.
#[derive(Debug, Default)]
pub struct DirtyFields {
    dirty: BTreeMap<FieldKey, DirtyEntry>,
    edited_at: HashMap<FieldKey, Instant>,
    next_version: u64,
}

/// A dirty field taken out for persisting.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub kind: FieldKind,
    pub handle: String,
    pub value: Value,
    pub version: u64,
}

impl DirtyFields {
    pub fn mark(&mut self, kind: FieldKind, handle: &str, value: Value, now: Instant) {
        self.next_version += 1;
        let key = (kind, handle.to_string());
        self.edited_at.insert(key.clone(), now);
        self.dirty.insert(key, DirtyEntry { value, version: self.next_version });
    }

    pub fn is_dirty(&self, kind: FieldKind, handle: &str) -> bool {
        self.dirty.contains_key(&(kind, handle.to_string()))
    }

    /// Current write for a dirty field; the field stays dirty until
    /// [`DirtyFields::persisted`] confirms this version.
    pub fn pending(&self, kind: FieldKind, handle: &str) -> Option<PendingWrite> {
        self.dirty.get(&(kind, handle.to_string())).map(|e| PendingWrite {
            kind,
            handle: handle.to_string(),
            value: e.value.clone(),
            version: e.version,
        })
    }

    /// Dirty writes for one handle, values before metadata.
    pub fn pending_for(&self, handle: &str) -> Vec<PendingWrite> {
        [FieldKind::Value, FieldKind::Meta]
            .into_iter()
            .filter_map(|kind| self.pending(kind, handle))
            .collect()
    }

    pub fn all_pending(&self) -> Vec<PendingWrite> {
        self.dirty
            .iter()
            .map(|((kind, handle), e)| PendingWrite {
                kind: *kind,
                handle: handle.clone(),
                value: e.value.clone(),
                version: e.version,
            })
            .collect()
    }

    /// Clears the field unless it was edited again since `version`.
    pub fn persisted(&mut self, kind: FieldKind, handle: &str, version: u64) -> bool {
        let key = (kind, handle.to_string());
        if self.dirty.get(&key).is_some_and(|e| e.version == version) {
            self.dirty.remove(&key);
            return true;
        }
        false
    }

    /// Gives up on a field (e.g. the cache refused it).
    pub fn discard(&mut self, kind: FieldKind, handle: &str) {
        self.dirty.remove(&(kind, handle.to_string()));
    }

    /// Whether a local edit to the field is recent enough to be protected
    /// from merges.
    pub fn is_protected(&self, kind: FieldKind, handle: &str, now: Instant, window: Duration) -> bool {
        self.edited_at
            .get(&(kind, handle.to_string()))
            .is_some_and(|t| now.duration_since(*t) < window)
    }

    pub fn len(&self) -> usize {
        self.dirty.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirty.is_empty()
    }

    pub fn clear(&mut self) {
        self.dirty.clear();
        self.edited_at.clear();
    }
}

/// Status shown next to the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStatus {
    /// Never saved, nothing to compare against.
    NotSaved,
    /// Matches the last save.
    Saved,
    ChangesNotSaved,
}

/// Compares the document against the values it had when it was loaded or
/// last saved.
#[derive(Debug)]
pub struct SaveTracker {
    original_values: FieldMap,
    ever_saved: bool,
}

impl SaveTracker {
    pub fn new(original_values: FieldMap, ever_saved: bool) -> Self {
        Self { original_values, ever_saved }
    }

    pub fn status(&self, current: &FieldMap) -> SaveStatus {
        if *current != self.original_values {
            SaveStatus::ChangesNotSaved
        } else if self.ever_saved {
            SaveStatus::Saved
        } else {
            SaveStatus::NotSaved
        }
    }

    pub fn mark_saved(&mut self, current: FieldMap) {
        self.original_values = current;
        self.ever_saved = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_cache_filters_churn() {
        let mut cache = ChangeCache::default();
        assert!(cache.observe(FieldKind::Value, "title", &json!("Hello")));
        assert!(!cache.observe(FieldKind::Value, "title", &json!("Hello")));
        assert!(cache.observe(FieldKind::Value, "title", &json!("Hello!")));
        // same handle, other half of the document
        assert!(cache.observe(FieldKind::Meta, "title", &json!("Hello!")));
    }

    #[test]
    fn test_change_cache_deep_equality() {
        let mut cache = ChangeCache::default();
        assert!(cache.observe(FieldKind::Meta, "image", &json!({"a": 1, "b": [1, 2]})));
        assert!(!cache.observe(FieldKind::Meta, "image", &json!({"b": [1, 2], "a": 1})));
        assert!(cache.observe(FieldKind::Meta, "image", &json!({"a": 1, "b": [2, 1]})));
    }

    #[test]
    fn test_seed_suppresses_first_observation() {
        let mut cache = ChangeCache::default();
        let mut map = FieldMap::new();
        map.insert("title".into(), json!("Hi"));
        cache.seed(FieldKind::Value, &map);
        assert!(!cache.observe(FieldKind::Value, "title", &json!("Hi")));
    }

    #[test]
    fn test_dirty_keeps_newer_edit() {
        let mut dirty = DirtyFields::default();
        let now = Instant::now();
        dirty.mark(FieldKind::Value, "title", json!("a"), now);
        let write = dirty.pending(FieldKind::Value, "title").unwrap();

        dirty.mark(FieldKind::Value, "title", json!("ab"), now);
        assert!(!dirty.persisted(FieldKind::Value, "title", write.version));
        assert!(dirty.is_dirty(FieldKind::Value, "title"));

        let write = dirty.pending(FieldKind::Value, "title").unwrap();
        assert_eq!(write.value, json!("ab"));
        assert!(dirty.persisted(FieldKind::Value, "title", write.version));
        assert!(dirty.is_empty());
    }

    #[test]
    fn test_pending_for_handle() {
        let mut dirty = DirtyFields::default();
        let now = Instant::now();
        dirty.mark(FieldKind::Meta, "title", json!({"x": 1}), now);
        dirty.mark(FieldKind::Value, "title", json!("t"), now);
        dirty.mark(FieldKind::Value, "body", json!("b"), now);

        let writes = dirty.pending_for("title");
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].kind, FieldKind::Value);
        assert_eq!(dirty.all_pending().len(), 3);
    }

    #[test]
    fn test_protection_window() {
        let mut dirty = DirtyFields::default();
        let t = Instant::now();
        let window = Duration::from_secs(4);
        dirty.mark(FieldKind::Value, "title", json!("x"), t);

        assert!(dirty.is_protected(FieldKind::Value, "title", t + Duration::from_secs(3), window));
        assert!(!dirty.is_protected(FieldKind::Value, "title", t + window, window));
        assert!(!dirty.is_protected(FieldKind::Value, "body", t, window));
        // protection outlives the dirty flag
        let v = dirty.pending(FieldKind::Value, "title").unwrap().version;
        dirty.persisted(FieldKind::Value, "title", v);
        assert!(dirty.is_protected(FieldKind::Value, "title", t, window));
    }

    #[test]
    fn test_save_status_transitions() {
        let mut original = FieldMap::new();
        original.insert("title".into(), json!("A"));
        let mut tracker = SaveTracker::new(original.clone(), false);
        assert_eq!(tracker.status(&original), SaveStatus::NotSaved);

        let mut edited = original.clone();
        edited.insert("title".into(), json!("B"));
        assert_eq!(tracker.status(&edited), SaveStatus::ChangesNotSaved);

        tracker.mark_saved(edited.clone());
        assert_eq!(tracker.status(&edited), SaveStatus::Saved);
        assert_eq!(tracker.status(&original), SaveStatus::ChangesNotSaved);
    }
}

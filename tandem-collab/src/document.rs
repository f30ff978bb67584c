//! The editor document the workspace keeps in sync.
//!
//! The host owns the document; the workspace reads it, writes merged state
//! into it, and tells it which fields to render locked.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::protocol::{FieldKind, FieldMap, User};

/// One field that a bulk write actually changed.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub kind: FieldKind,
    pub handle: String,
    pub value: Value,
}

pub trait DocumentStore: Send + Sync {
    fn values(&self) -> FieldMap;
    fn meta(&self) -> FieldMap;
    /// Write each field of `patch`; returns the fields whose value changed.
    fn set_values(&self, patch: FieldMap) -> Vec<FieldChange>;
    fn set_meta(&self, patch: FieldMap) -> Vec<FieldChange>;
    /// Render `handle` read-only, held by `user`.
    fn lock_field(&self, user: &User, handle: &str);
    fn unlock_field(&self, handle: &str);
    /// Take input focus away from `handle`.
    fn blur_field(&self, handle: &str);
}

#[derive(Debug, Default)]
struct DocumentState {
    values: FieldMap,
    meta: FieldMap,
    locked_by: HashMap<String, User>,
    blurred: Vec<String>,
}

/// In-memory [`DocumentStore`].
#[derive(Debug, Default)]
pub struct MemoryDocument {
    state: Mutex<DocumentState>,
}

impl MemoryDocument {
    pub fn new(values: FieldMap, meta: FieldMap) -> Self {
        Self {
            state: Mutex::new(DocumentState { values, meta, ..Default::default() }),
        }
    }

    fn state(&self) -> MutexGuard<'_, DocumentState> {
        // a panic while holding the lock leaves plain maps behind; keep going
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn value(&self, handle: &str) -> Option<Value> {
        self.state().values.get(handle).cloned()
    }

    pub fn meta_value(&self, handle: &str) -> Option<Value> {
        self.state().meta.get(handle).cloned()
    }

    pub fn locked_by(&self, handle: &str) -> Option<User> {
        self.state().locked_by.get(handle).cloned()
    }

    /// Handles taken away from the user via `blur_field`, in order.
    pub fn blurred(&self) -> Vec<String> {
        self.state().blurred.clone()
    }

    /// A user edit: writes the field and returns the change to report
    /// through `WorkspaceHandle::field_changed`.
    pub fn edit(&self, kind: FieldKind, handle: &str, value: Value) -> FieldChange {
        let mut state = self.state();
        let side = match kind {
            FieldKind::Value => &mut state.values,
            FieldKind::Meta => &mut state.meta,
        };
        side.insert(handle.to_string(), value.clone());
        FieldChange { kind, handle: handle.to_string(), value }
    }
}

fn apply(side: &mut FieldMap, kind: FieldKind, patch: FieldMap) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    for (handle, value) in patch {
        if side.get(&handle) == Some(&value) {
            continue;
        }
        side.insert(handle.clone(), value.clone());
        changes.push(FieldChange { kind, handle, value });
    }
    changes
}

impl DocumentStore for MemoryDocument {
    fn values(&self) -> FieldMap {
        self.state().values.clone()
    }

    fn meta(&self) -> FieldMap {
        self.state().meta.clone()
    }

    fn set_values(&self, patch: FieldMap) -> Vec<FieldChange> {
        apply(&mut self.state().values, FieldKind::Value, patch)
    }

    fn set_meta(&self, patch: FieldMap) -> Vec<FieldChange> {
        apply(&mut self.state().meta, FieldKind::Meta, patch)
    }

    fn lock_field(&self, user: &User, handle: &str) {
        self.state().locked_by.insert(handle.to_string(), user.clone());
    }

    fn unlock_field(&self, handle: &str) {
        self.state().locked_by.remove(handle);
    }

    fn blur_field(&self, handle: &str) {
        self.state().blurred.push(handle.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_values_reports_only_changes() {
        let mut initial = FieldMap::new();
        initial.insert("title".into(), json!("A"));
        let doc = MemoryDocument::new(initial, FieldMap::new());

        let mut patch = FieldMap::new();
        patch.insert("title".into(), json!("A"));
        patch.insert("body".into(), json!("B"));
        let changes = doc.set_values(patch);

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].handle, "body");
        assert_eq!(doc.value("body"), Some(json!("B")));
    }

    #[test]
    fn test_lock_unlock() {
        let doc = MemoryDocument::default();
        doc.lock_field(&User::new(2, "Bob"), "title");
        assert_eq!(doc.locked_by("title").map(|u| u.id), Some(2));
        doc.unlock_field("title");
        assert!(doc.locked_by("title").is_none());
    }

    #[test]
    fn test_edit_meta() {
        let doc = MemoryDocument::default();
        let change = doc.edit(FieldKind::Meta, "image", json!({"alt": "x"}));
        assert_eq!(change.kind, FieldKind::Meta);
        assert_eq!(doc.meta_value("image"), Some(json!({"alt": "x"})));
        assert!(doc.value("image").is_none());
    }
}

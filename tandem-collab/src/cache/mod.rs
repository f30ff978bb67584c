//! Persisted state cache: the rendezvous point between windows.
//!
//! Broadcasts are best effort; the cache is what a window fetches when it
//! joins, regains visibility, or is told a field changed. Entries are keyed
//! by `(reference, site)` and expire after a period of inactivity.
//!
//! - [`http::HttpStateCache`]: client for the HTTP service
//! - [`memory::MemoryCacheService`]: in-process service with the same
//!   semantics, for tests and single-process setups

pub mod http;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CacheError;
use crate::protocol::{FieldKind, FieldMap};

pub use http::HttpStateCache;
pub use memory::{MemoryCacheService, MemoryStateCache};

/// `GET` response body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CachedState {
    pub exists: bool,
    pub values: Option<FieldMap>,
    pub meta: Option<FieldMap>,
}

/// `POST` request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CacheUpdate {
    /// Replace the whole entry.
    Full { values: FieldMap, meta: FieldMap, full: bool },
    /// One field. Metadata deep-merges into what is stored.
    Field {
        handle: String,
        value: Value,
        #[serde(rename = "type")]
        kind: FieldKind,
    },
}

impl CacheUpdate {
    pub fn field(kind: FieldKind, handle: impl Into<String>, value: Value) -> Self {
        CacheUpdate::Field { handle: handle.into(), value, kind }
    }

    pub fn full(values: FieldMap, meta: FieldMap) -> Self {
        CacheUpdate::Full { values, meta, full: true }
    }
}

/// Cache entry for one document, as seen by one workspace.
#[async_trait]
pub trait StateCache: Send + Sync {
    async fn fetch(&self) -> Result<CachedState, CacheError>;
    async fn update(&self, update: CacheUpdate) -> Result<(), CacheError>;
    /// Drop the entry; called after a successful save.
    async fn clear(&self) -> Result<(), CacheError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_update_body() {
        let body = serde_json::to_value(CacheUpdate::field(FieldKind::Meta, "image", json!({"alt": "x"}))).unwrap();
        assert_eq!(body, json!({"handle": "image", "value": {"alt": "x"}, "type": "meta"}));
    }

    #[test]
    fn test_full_update_body() {
        let mut values = FieldMap::new();
        values.insert("title".into(), json!("A"));
        let body = serde_json::to_value(CacheUpdate::full(values, FieldMap::new())).unwrap();
        assert_eq!(body, json!({"values": {"title": "A"}, "meta": {}, "full": true}));
    }

    #[test]
    fn test_update_body_parses_back() {
        let field: CacheUpdate =
            serde_json::from_value(json!({"handle": "t", "value": 1, "type": "value"})).unwrap();
        assert_eq!(field, CacheUpdate::field(FieldKind::Value, "t", json!(1)));

        let full: CacheUpdate =
            serde_json::from_value(json!({"values": {}, "meta": {}, "full": true})).unwrap();
        assert!(matches!(full, CacheUpdate::Full { full: true, .. }));
    }

    #[test]
    fn test_cached_state_missing_entry() {
        let state: CachedState =
            serde_json::from_value(json!({"exists": false, "values": null, "meta": null})).unwrap();
        assert_eq!(state, CachedState::default());
    }
}

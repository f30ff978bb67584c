//! In-process cache service with the HTTP service's semantics.
//!
//! One [`MemoryCacheService`] plays the server; each workspace gets a
//! [`MemoryStateCache`] bound to its `(reference, site)`. Failure injection
//! and counters exist for tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{CacheUpdate, CachedState, StateCache};
use crate::error::CacheError;
use crate::merge::deep_merge;
use crate::protocol::{FieldKind, FieldMap};

/// Entries untouched for this long are gone.
pub const DEFAULT_TTL: Duration = Duration::from_secs(6 * 60 * 60);

type EntryKey = (String, String);

#[derive(Debug)]
struct Entry {
    values: FieldMap,
    meta: FieldMap,
    touched: Instant,
}

struct Inner {
    entries: Mutex<HashMap<EntryKey, Entry>>,
    history: Mutex<Vec<(EntryKey, CacheUpdate)>>,
    ttl: Duration,
    fetches: AtomicU64,
    updates: AtomicU64,
    fail_updates: AtomicUsize,
    forbidden: AtomicBool,
}

#[derive(Clone)]
pub struct MemoryCacheService {
    inner: Arc<Inner>,
}

impl Default for MemoryCacheService {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl MemoryCacheService {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                history: Mutex::new(Vec::new()),
                ttl,
                fetches: AtomicU64::new(0),
                updates: AtomicU64::new(0),
                fail_updates: AtomicUsize::new(0),
                forbidden: AtomicBool::new(false),
            }),
        }
    }

    /// Cache handle for one document.
    pub fn client(&self, reference: &str, site: &str) -> MemoryStateCache {
        MemoryStateCache {
            service: self.clone(),
            key: (reference.to_string(), site.to_string()),
        }
    }

    /// The next `n` updates fail with a retryable error.
    pub fn fail_next_updates(&self, n: usize) {
        self.inner.fail_updates.store(n, Ordering::SeqCst);
    }

    /// Every operation answers 403 while set.
    pub fn set_forbidden(&self, forbidden: bool) {
        self.inner.forbidden.store(forbidden, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> u64 {
        self.inner.fetches.load(Ordering::SeqCst)
    }

    /// Accepted updates (failed ones are not counted).
    pub fn update_count(&self) -> u64 {
        self.inner.updates.load(Ordering::SeqCst)
    }

    /// Accepted updates for one document, oldest first.
    pub async fn updates_for(&self, reference: &str, site: &str) -> Vec<CacheUpdate> {
        let key = (reference.to_string(), site.to_string());
        self.inner
            .history
            .lock()
            .await
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, u)| u.clone())
            .collect()
    }

    /// Current entry, bypassing counters and failure injection.
    pub async fn peek(&self, reference: &str, site: &str) -> CachedState {
        let key = (reference.to_string(), site.to_string());
        let mut entries = self.inner.entries.lock().await;
        self.read(&mut entries, &key)
    }

    pub async fn entry_count(&self) -> usize {
        self.inner.entries.lock().await.len()
    }

    fn check_forbidden(&self) -> Result<(), CacheError> {
        if self.inner.forbidden.load(Ordering::SeqCst) {
            return Err(CacheError::Forbidden);
        }
        Ok(())
    }

    fn read(&self, entries: &mut HashMap<EntryKey, Entry>, key: &EntryKey) -> CachedState {
        let ttl = self.inner.ttl;
        if entries.get(key).is_some_and(|e| e.touched.elapsed() >= ttl) {
            log::debug!("Cache entry {}/{} expired", key.0, key.1);
            entries.remove(key);
        }
        match entries.get(key) {
            Some(entry) => CachedState {
                exists: true,
                values: Some(entry.values.clone()),
                meta: Some(entry.meta.clone()),
            },
            None => CachedState::default(),
        }
    }

    async fn fetch(&self, key: &EntryKey) -> Result<CachedState, CacheError> {
        self.check_forbidden()?;
        self.inner.fetches.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.inner.entries.lock().await;
        Ok(self.read(&mut entries, key))
    }

    async fn update(&self, key: &EntryKey, update: CacheUpdate) -> Result<(), CacheError> {
        self.check_forbidden()?;
        let failing = self
            .inner
            .fail_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CacheError::Unavailable("injected failure".into()));
        }

        let mut entries = self.inner.entries.lock().await;
        self.read(&mut entries, key);
        let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
            values: FieldMap::new(),
            meta: FieldMap::new(),
            touched: Instant::now(),
        });
        entry.touched = Instant::now();

        match &update {
            CacheUpdate::Full { values, meta, .. } => {
                entry.values = values.clone();
                entry.meta = meta.clone();
            }
            CacheUpdate::Field { handle, value, kind: FieldKind::Value } => {
                entry.values.insert(handle.clone(), value.clone());
            }
            CacheUpdate::Field { handle, value, kind: FieldKind::Meta } => {
                let merged = match entry.meta.get(handle) {
                    Some(existing) => deep_merge(existing, value),
                    None => value.clone(),
                };
                entry.meta.insert(handle.clone(), merged);
            }
        }
        drop(entries);

        self.inner.updates.fetch_add(1, Ordering::SeqCst);
        self.inner.history.lock().await.push((key.clone(), update));
        Ok(())
    }

    async fn clear(&self, key: &EntryKey) -> Result<(), CacheError> {
        self.check_forbidden()?;
        self.inner.entries.lock().await.remove(key);
        Ok(())
    }
}

/// [`StateCache`] view of one document in a [`MemoryCacheService`].
#[derive(Clone)]
pub struct MemoryStateCache {
    service: MemoryCacheService,
    key: EntryKey,
}

#[async_trait]
impl StateCache for MemoryStateCache {
    async fn fetch(&self) -> Result<CachedState, CacheError> {
        self.service.fetch(&self.key).await
    }

    async fn update(&self, update: CacheUpdate) -> Result<(), CacheError> {
        self.service.update(&self.key, update).await
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.service.clear(&self.key).await
    }
}

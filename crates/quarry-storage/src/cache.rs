//! The compiled query cache.
//!
//! Maps a [`QueryFingerprint`] to the executor compiled for that shape. The
//! map is a [`DashMap`] of per-key slots; each slot is a mutex around an
//! optional value. A caller first claims the slot for its key (insert-if-
//! absent under the shard lock), then compiles while holding only the slot's
//! mutex. Concurrent callers for the same key wait on that mutex and find the
//! winner's value instead of compiling again. Callers for other keys are not
//! blocked.
//!
//! A failed compilation leaves the slot empty, so the next caller retries.
//! Entries are never evicted.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::StorageError;
use crate::fingerprint::QueryFingerprint;

type Slot<V> = Arc<Mutex<Option<V>>>;

/// Store-owned cache of compiled queries.
pub struct CompiledQueryCache<V> {
    entries: DashMap<QueryFingerprint, Slot<V>>,
}

impl<V: Clone> CompiledQueryCache<V> {
    pub fn new() -> Self {
        CompiledQueryCache {
            entries: DashMap::new(),
        }
    }

    /// Returns the value cached for `key`, running `compile` at most once per
    /// key across all callers to produce it.
    pub fn get_or_add<F>(&self, key: QueryFingerprint, compile: F) -> Result<V, StorageError>
    where
        F: FnOnce() -> Result<V, StorageError>,
    {
        // Clone the slot out so the shard lock is released before compiling.
        let slot = self.entries.entry(key).or_default().value().clone();

        let mut guard = slot.lock();
        if let Some(value) = guard.as_ref() {
            tracing::trace!(fingerprint = ?key, "compiled query cache hit");
            return Ok(value.clone());
        }

        tracing::trace!(fingerprint = ?key, "compiled query cache miss");
        let value = compile()?;
        *guard = Some(value.clone());
        Ok(value)
    }

    /// Number of shapes with a compiled value.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.value().lock().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &QueryFingerprint) -> bool {
        self.entries
            .get(key)
            .map(|slot| slot.lock().is_some())
            .unwrap_or(false)
    }
}

impl<V: Clone> Default for CompiledQueryCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

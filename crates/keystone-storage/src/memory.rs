//! In-memory implementations of [`DurableStore`] and [`SharedCache`].
//!
//! [`InMemoryStore`] is a first-class backend for tests and ephemeral
//! processes, with the same semantics as [`crate::SqliteStore`]: rows are
//! kept in storage-key order, so `find` returns the same "first match" both
//! backends agree on. [`InMemoryCache`] honors TTLs against an injected
//! [`Clock`].

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use dashmap::DashMap;

use keystone_core::{CacheValue, Clock, EntityIdentity, Filter, Record, StorageKey};

use crate::error::{CacheError, StorageError};
use crate::traits::{expiry, DurableStore, SharedCache};

/// Durable store backed by an ordered map.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    rows: RwLock<BTreeMap<StorageKey, Record>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows across all collections.
    pub fn len(&self) -> usize {
        self.rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaces a row wholesale, bypassing duplicate checks. Used to seed
    /// fixtures and to simulate out-of-band tampering.
    pub fn put_raw(&self, key: StorageKey, record: Record) {
        self.rows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, record);
    }
}

impl DurableStore for InMemoryStore {
    fn find(&self, collection: &str, filter: &Filter) -> Result<Record, StorageError> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        rows.iter()
            .find(|(key, record)| key.collection() == collection && filter.matches(record))
            .map(|(_, record)| record.clone())
            .ok_or_else(|| StorageError::NotFound {
                collection: collection.to_string(),
                filter: filter.to_string(),
            })
    }

    fn insert(&self, identity: &EntityIdentity, record: &Record) -> Result<usize, StorageError> {
        let key = identity.storage_key();
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        if rows.contains_key(&key) {
            return Err(StorageError::Duplicate {
                key: key.to_string(),
            });
        }
        rows.insert(key, record.clone());
        Ok(1)
    }

    fn update(
        &self,
        collection: &str,
        changes: &Record,
        key: &Filter,
    ) -> Result<usize, StorageError> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        let mut affected = 0;
        for (storage_key, record) in rows.iter_mut() {
            if storage_key.collection() != collection || !key.matches(record) {
                continue;
            }
            for (field, value) in changes {
                record.insert(field.clone(), value.clone());
            }
            affected += 1;
        }
        Ok(affected)
    }
}

/// Shared cache backed by a concurrent map with per-entry expiry.
pub struct InMemoryCache {
    entries: DashMap<StorageKey, (CacheValue, i64)>,
    clock: Arc<dyn Clock>,
}

impl InMemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        InMemoryCache {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of entries, expired ones included until they are touched.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, (_, expires_at)| *expires_at > now);
        let purged = before - self.entries.len();
        tracing::debug!(purged, "expired cache entries purged");
        purged
    }
}

impl SharedCache for InMemoryCache {
    fn get(&self, key: &StorageKey) -> Result<Option<CacheValue>, CacheError> {
        let now = self.clock.now_millis();
        match self.entries.get(key) {
            None => return Ok(None),
            Some(entry) => {
                let (value, expires_at) = entry.value();
                if *expires_at > now {
                    return Ok(Some(value.clone()));
                }
            }
        }
        // a concurrent set may have refreshed the entry in between
        self.entries
            .remove_if(key, |_, (_, expires_at)| *expires_at <= now);
        Ok(None)
    }

    fn set(&self, key: &StorageKey, value: &CacheValue, ttl: Duration) -> Result<(), CacheError> {
        let expires_at = expiry(self.clock.now_millis(), ttl);
        self.entries.insert(key.clone(), (value.clone(), expires_at));
        Ok(())
    }

    fn delete(&self, key: &StorageKey) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }
}

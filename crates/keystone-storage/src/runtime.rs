//! The per-process runtime tier.
//!
//! Holds live, fully-typed entities keyed by [`StorageKey`]. Entries never
//! expire on their own; they leave only through [`RuntimeTier::purge`] or
//! [`RuntimeTier::clear`]. The tier is owned by one process and never
//! shared with another.

use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;

use keystone_core::{Entity, StorageKey};

#[derive(Default)]
pub struct RuntimeTier {
    entries: DashMap<StorageKey, Arc<dyn Any + Send + Sync>>,
}

impl RuntimeTier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a clone of the entity stored under `key`.
    ///
    /// An entry of a different entity type is reported as a miss.
    pub fn get<E: Entity>(&self, key: &StorageKey) -> Option<E> {
        let entry = self.entries.get(key)?;
        entry.value().downcast_ref::<E>().cloned()
    }

    /// Stores `entity` under `key`, replacing any previous entry.
    pub fn insert<E: Entity>(&self, key: StorageKey, entity: E) {
        self.entries.insert(key, Arc::new(entity));
    }

    /// Evicts `key`. Returns whether an entry was present.
    pub fn purge(&self, key: &StorageKey) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn contains(&self, key: &StorageKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for RuntimeTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeTier")
            .field("entries", &self.entries.len())
            .finish()
    }
}

//! Contracts for the two external tiers.
//!
//! Both traits are synchronous and take `&self`: a call is a single
//! all-or-nothing round trip, and backends own whatever interior locking
//! their transport needs. Retries, if any, belong inside the backend.

use std::time::Duration;

use keystone_core::{CacheValue, EntityIdentity, Filter, Record, StorageKey};

use crate::error::{CacheError, StorageError};

/// The durable store: tier of last resort and the only tier with write
/// authority.
pub trait DurableStore: Send + Sync {
    /// Returns the first row of `collection` matching `filter`.
    ///
    /// A miss is `StorageError::NotFound`, never an empty success.
    fn find(&self, collection: &str, filter: &Filter) -> Result<Record, StorageError>;

    /// Inserts a new row under `identity`. Returns rows affected.
    fn insert(&self, identity: &EntityIdentity, record: &Record) -> Result<usize, StorageError>;

    /// Merges `changes` into every row of `collection` matching `key`.
    /// Returns rows affected.
    fn update(&self, collection: &str, changes: &Record, key: &Filter)
        -> Result<usize, StorageError>;
}

/// The shared cache tier: an opaque key/value transport with TTLs.
pub trait SharedCache: Send + Sync {
    fn get(&self, key: &StorageKey) -> Result<Option<CacheValue>, CacheError>;

    fn set(&self, key: &StorageKey, value: &CacheValue, ttl: Duration) -> Result<(), CacheError>;

    fn delete(&self, key: &StorageKey) -> Result<(), CacheError>;

    /// Stores `alias` as a pointer to `target`.
    fn create_alias(
        &self,
        alias: &StorageKey,
        target: &StorageKey,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.set(alias, &CacheValue::Alias(target.clone()), ttl)
    }
}

/// Absolute expiry in unix millis for an entry written at `now` with
/// `ttl`. TTLs beyond the `i64` range saturate instead of wrapping.
pub(crate) fn expiry(now: i64, ttl: Duration) -> i64 {
    now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

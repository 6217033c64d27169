//! The [`Entity`] contract, resolution provenance and cache payloads.
//!
//! An entity converts to and from a flat [`Record`]. Capabilities are opt-in
//! through defaulted trait methods:
//!
//! - **checksum-aware**: `checksum_fields()` is non-empty and the digest is
//!   carried in the reserved [`CHECKSUM_FIELD`]
//! - **cache-stamped**: `set_cached_on` records when a projection was taken,
//!   carried in [`CACHED_ON_FIELD`]
//! - **runtime-only state**: `runtime_fields()` never reach the shared cache
//! - **lifecycle hooks**: `on_retrieve`, `on_cache_store`, `on_lock_obtained`
//!   return an optional message for the log and cannot fail

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::id::{EntityIdentity, PrimaryKey, StorageKey};
use crate::value::Record;

/// Record field holding the hex checksum digest.
pub const CHECKSUM_FIELD: &str = "checksum";

/// Record field holding the unix-millis time a cache projection was taken.
pub const CACHED_ON_FIELD: &str = "cached_on";

/// Which tier satisfied a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Runtime,
    Cache,
    Database,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Runtime => f.write_str("runtime"),
            Provenance::Cache => f.write_str("cache"),
            Provenance::Database => f.write_str("database"),
        }
    }
}

/// A domain object resolvable through the cache tiers.
pub trait Entity: Clone + Send + Sync + 'static {
    /// Collection (table) the entity lives in.
    const COLLECTION: &'static str;

    fn primary_key(&self) -> PrimaryKey;

    /// Full row, including the checksum and `cached_on` fields when present.
    fn to_record(&self) -> Record;

    fn from_record(record: &Record) -> Result<Self, CoreError>;

    fn identity(&self) -> Result<EntityIdentity, CoreError> {
        EntityIdentity::new(Self::COLLECTION, self.primary_key())
    }

    /// Fields stripped from cacheable projections.
    fn runtime_fields() -> &'static [&'static str] {
        &[]
    }

    /// Ordered fields covered by the integrity digest. Empty means the
    /// entity is not checksum-aware.
    fn checksum_fields() -> &'static [&'static str] {
        &[]
    }

    fn is_checksum_aware() -> bool {
        !Self::checksum_fields().is_empty()
    }

    /// Hex digest currently carried by the entity.
    fn stored_checksum(&self) -> Option<&str> {
        None
    }

    fn set_checksum(&mut self, _digest: String) {}

    fn cached_on(&self) -> Option<i64> {
        None
    }

    fn set_cached_on(&mut self, _millis: i64) {}

    fn on_retrieve(&self, _provenance: Provenance) -> Option<String> {
        None
    }

    fn on_cache_store(&self) -> Option<String> {
        None
    }

    fn on_lock_obtained(&self) -> Option<String> {
        None
    }
}

/// What the shared cache physically holds under a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum CacheValue {
    Direct(Record),
    /// Points at another key; followed at most once.
    Alias(StorageKey),
}

/// The runtime-stripped, time-stamped clone of an entity that is written to
/// the shared cache. The live entity is never cached.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheableProjection {
    key: StorageKey,
    record: Record,
    cached_on: i64,
}

impl CacheableProjection {
    pub fn of<E: Entity>(entity: &E, cached_on: i64) -> Result<Self, CoreError> {
        let key = entity.identity()?.storage_key();
        let mut clone = entity.clone();
        clone.set_cached_on(cached_on);
        let mut record = clone.to_record();
        for field in E::runtime_fields() {
            record.remove(*field);
        }
        Ok(CacheableProjection {
            key,
            record,
            cached_on,
        })
    }

    pub fn key(&self) -> &StorageKey {
        &self.key
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn cached_on(&self) -> i64 {
        self.cached_on
    }

    pub fn into_cache_value(self) -> CacheValue {
        CacheValue::Direct(self.record)
    }
}

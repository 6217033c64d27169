//! Core data model for the keystone entity kernel.
//!
//! Everything the cache tiers, the durable store and the lock coordinator
//! agree on lives here: entity identity and its canonical [`StorageKey`],
//! the flat [`Record`] row shape, the [`Filter`] used to query the durable
//! store, the [`Entity`] trait with its lifecycle hooks, and the injectable
//! [`Clock`].

pub mod clock;
pub mod entity;
pub mod error;
pub mod id;
pub mod value;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use entity::{
    CacheValue, CacheableProjection, Entity, Provenance, CACHED_ON_FIELD, CHECKSUM_FIELD,
};
pub use error::CoreError;
pub use id::{EntityIdentity, PrimaryKey, StorageKey};
pub use value::{FieldValue, Filter, Record, RecordExt};

//! Storage tiers for keystone entities.
//!
//! Provides the two external-collaborator contracts, [`DurableStore`] and
//! [`SharedCache`], each with an in-memory and a SQLite backend, plus the
//! process-local [`RuntimeTier`] and the [`Checksummer`] that guards entity
//! integrity across all of them.
//!
//! # Modules
//!
//! - [`error`]: StorageError, CacheError and IntegrityFault
//! - [`traits`]: DurableStore and SharedCache trait definitions
//! - [`memory`]: InMemoryStore and InMemoryCache
//! - [`schema`]: SQL migrations and connection setup
//! - [`sqlite`]: SqliteStore and SqliteCache
//! - [`runtime`]: the per-process RuntimeTier
//! - [`checksum`]: keyed, iterated entity digests

pub mod checksum;
pub mod error;
pub mod memory;
pub mod runtime;
pub mod schema;
pub mod sqlite;
pub mod traits;

// Re-export key types for ergonomic use.
pub use checksum::{ChecksumDigest, Checksummer, DEFAULT_ITERATIONS};
pub use error::{CacheError, IntegrityFault, StorageError};
pub use memory::{InMemoryCache, InMemoryStore};
pub use runtime::RuntimeTier;
pub use sqlite::{SqliteCache, SqliteStore};
pub use traits::{DurableStore, SharedCache};

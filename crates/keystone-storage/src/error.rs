//! Storage error types for keystone-storage.
//!
//! [`StorageError`] covers the durable store, [`CacheError`] the shared
//! cache tier and [`IntegrityFault`] checksum verification. They are kept
//! apart because callers treat them differently: cache faults may be
//! degraded, integrity faults never are.

use keystone_core::CoreError;
use thiserror::Error;

/// Errors produced by durable store operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// SQLite reported an error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Schema migration failed.
    #[error("migration error: {0}")]
    Migration(String),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No row in `collection` matched the filter.
    #[error("not found: {collection} where {filter}")]
    NotFound { collection: String, filter: String },

    /// A row with the same storage key already exists.
    #[error("duplicate entity: {key}")]
    Duplicate { key: String },

    /// Identity or record validation failed.
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Errors produced by shared cache tier operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// SQLite reported an error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A cached payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The cache transport is unreachable or refused the call.
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Checksum verification failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum IntegrityFault {
    /// The stored digest does not match the recomputed one.
    #[error("checksum mismatch for {key}")]
    ChecksumMismatch { key: String },

    /// A checksum-aware entity carries no digest at all.
    #[error("missing checksum for {key}")]
    MissingChecksum { key: String },

    /// The iteration count must be at least one.
    #[error("checksum iterations must be >= 1, got {0}")]
    InvalidIterations(u32),
}

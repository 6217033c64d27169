//! Error types for keystone-kernel.
//!
//! [`KernelError`] is what callers of the fetcher see. It keeps "not found"
//! apart from integrity, lock and infrastructure failures so callers can
//! treat the first as an expected outcome and alert on the rest.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use keystone_core::{CoreError, StorageKey};
use keystone_storage::{CacheError, IntegrityFault, StorageError};

use crate::snapshot::GraphState;

/// Errors surfaced by the fetch orchestrator and the locked-entity protocol.
#[derive(Debug, Error)]
pub enum KernelError {
    /// The durable store has no row matching the request.
    #[error("entity not found: {key}")]
    EntityNotFound { key: StorageKey },

    /// A checksum did not verify. Never degraded.
    #[error(transparent)]
    Integrity(#[from] IntegrityFault),

    /// A checksum-aware entity was handled without a configured checksummer.
    #[error("collection {collection} is checksum-aware but no checksummer is configured")]
    ChecksumUnavailable { collection: &'static str },

    /// The shared cache tier failed and strict mode was requested.
    #[error("cache tier failure: {0}")]
    CacheTier(#[from] CacheError),

    #[error(transparent)]
    Lock(#[from] LockError),

    /// An update was attempted through a lock that has been released.
    #[error("lock for {key} is no longer held")]
    LockNotHeld { key: StorageKey },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Lock acquisition failures.
#[derive(Debug, Error)]
pub enum LockError {
    /// Non-blocking acquisition found the lock held by another owner.
    #[error("lock for {key} is held by another owner")]
    Unavailable { key: StorageKey },

    /// Blocking acquisition gave up.
    #[error("timed out after {waited:?} waiting for lock on {key}")]
    Timeout { key: StorageKey, waited: Duration },

    #[error("lock i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Snapshot, restore and bootstrap failures. All are fatal at startup.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Wrong magic bytes or an unknown format version.
    #[error("unsupported snapshot format: {reason}")]
    UnsupportedFormat { reason: String },

    /// Truncated artifact, length mismatch or digest mismatch.
    #[error("corrupt snapshot: {reason}")]
    Corrupt { reason: String },

    #[error("snapshot belongs to environment {found}, expected {expected}")]
    EnvironmentMismatch { expected: String, found: String },

    /// A node's type tag or state does not match what the reader expects.
    #[error("restore type mismatch at {path}: {detail}")]
    RestoreTypeMismatch { path: String, detail: String },

    /// A node still has in-flight work that would be lost.
    #[error("snapshot refused: {node} has {pending} pending item(s)")]
    Refused { node: String, pending: usize },

    /// A transient field was accessed before bootstrap re-created it.
    #[error("transient field {field} is not bootstrapped")]
    NotBootstrapped { field: &'static str },

    #[error("cannot {operation} while graph is {state}")]
    InvalidState {
        operation: &'static str,
        state: GraphState,
    },

    #[error("no node at {path}")]
    UnknownNode { path: String },

    #[error("invalid object graph: {reason}")]
    InvalidGraph { reason: String },

    #[error("invalid environment name: {name:?}")]
    InvalidEnvironment { name: String },

    #[error("bootstrap resource {type_name} is not registered")]
    MissingResource { type_name: &'static str },

    /// A node could not re-create its transient resources.
    #[error("bootstrap of {node} failed: {reason}")]
    Bootstrap { node: String, reason: String },

    #[error("snapshot encoding error: {0}")]
    Encode(#[from] postcard::Error),

    #[error("snapshot i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

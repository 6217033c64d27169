//! The keystone entity kernel.
//!
//! Composes the storage tiers into one resolution path and adds the pieces
//! that need process-level coordination: cross-process entity locks, the
//! locked read-modify-write protocol, and whole-graph snapshot/restore for
//! warm starts.
//!
//! # Modules
//!
//! - [`config`]: KernelConfig and its `KEYSTONE_*` environment overrides
//! - [`error`]: KernelError, LockError, SnapshotError, ConfigError
//! - [`diagnostics`]: sinks for recovered lower-tier failures
//! - [`lock`]: LockCoordinator and Lock handles
//! - [`fetch`]: EntityFetcher, the cache-aside orchestrator
//! - [`snapshot`]: object graph, artifact format and SnapshotManager
//! - [`services`]: snapshot-aware nodes wrapping the fetcher and diagnostics

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod fetch;
pub mod lock;
pub mod services;
pub mod snapshot;

// Re-export key types for ergonomic use.
pub use config::KernelConfig;
pub use diagnostics::{BufferedSink, DiagnosticEvent, DiagnosticKind, DiagnosticSink, TracingSink};
pub use error::{ConfigError, KernelError, LockError, SnapshotError};
pub use fetch::{EntityFetcher, EntityFetcherBuilder, LockedEntity, ResolveOptions, Resolved};
pub use lock::{Lock, LockCoordinator, LockOptions};
pub use services::{
    DiagnosticLogNode, DiagnosticLogSettings, EntityServiceNode, ServiceSettings, TierBackends,
};
pub use snapshot::{
    GraphState, NodeRegistry, NodeSlot, ObjectGraph, Resources, Snapshot, SnapshotManager,
    SplitState, StartMode, Transient,
};

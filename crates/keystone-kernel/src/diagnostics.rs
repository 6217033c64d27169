//! Diagnostics for failures the fetcher recovers from.
//!
//! A degraded cache read still returns an entity, so the failure would be
//! invisible without a sink. Every recovered lower-tier failure is handed
//! to a [`DiagnosticSink`]: [`TracingSink`] logs it, [`BufferedSink`] keeps
//! it until drained.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

/// What kind of recovered failure an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    CacheRead,
    CacheWrite,
    CacheDelete,
    /// An alias pointed at another alias.
    AliasDepth,
    /// A cached projection could not be decoded into its entity.
    CacheDecode,
    /// A cached projection failed its checksum and was evicted.
    IntegrityEviction,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiagnosticKind::CacheRead => "cache_read",
            DiagnosticKind::CacheWrite => "cache_write",
            DiagnosticKind::CacheDelete => "cache_delete",
            DiagnosticKind::AliasDepth => "alias_depth",
            DiagnosticKind::CacheDecode => "cache_decode",
            DiagnosticKind::IntegrityEviction => "integrity_eviction",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    pub kind: DiagnosticKind,
    /// Storage key the failure concerns.
    pub key: String,
    pub message: String,
}

impl DiagnosticEvent {
    pub fn new(kind: DiagnosticKind, key: impl Into<String>, message: impl Into<String>) -> Self {
        DiagnosticEvent {
            kind,
            key: key.into(),
            message: message.into(),
        }
    }
}

pub trait DiagnosticSink: Send + Sync {
    fn record(&self, event: DiagnosticEvent);
}

/// Logs every event at `warn`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn record(&self, event: DiagnosticEvent) {
        tracing::warn!(kind = %event.kind, key = %event.key, "{}", event.message);
    }
}

/// Keeps events in memory until [`BufferedSink::drain`] is called.
#[derive(Debug, Default)]
pub struct BufferedSink {
    events: Mutex<Vec<DiagnosticEvent>>,
}

impl BufferedSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn events(&self) -> MutexGuard<'_, Vec<DiagnosticEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of events recorded but not yet drained.
    pub fn pending(&self) -> usize {
        self.events().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    /// Removes and returns every buffered event, oldest first.
    pub fn drain(&self) -> Vec<DiagnosticEvent> {
        std::mem::take(&mut *self.events())
    }

    /// Copies of the buffered events, leaving them in place.
    pub fn snapshot(&self) -> Vec<DiagnosticEvent> {
        self.events().clone()
    }
}

impl DiagnosticSink for BufferedSink {
    fn record(&self, event: DiagnosticEvent) {
        tracing::debug!(kind = %event.kind, key = %event.key, "buffered diagnostic");
        self.events().push(event);
    }
}

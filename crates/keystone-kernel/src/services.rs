//! Snapshot-aware kernel services.
//!
//! [`EntityServiceNode`] owns an [`EntityFetcher`] as a transient field:
//! only its settings are written to the artifact, and the fetcher with its
//! lock coordinator and store handles is rebuilt on bootstrap from the
//! [`TierBackends`] resource. [`DiagnosticLogNode`] exposes the shared
//! [`BufferedSink`] and blocks snapshots while it holds undrained events.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use keystone_core::Clock;
use keystone_storage::{Checksummer, DurableStore, SharedCache};

use crate::config::KernelConfig;
use crate::diagnostics::{BufferedSink, DiagnosticEvent, DiagnosticSink, TracingSink};
use crate::error::SnapshotError;
use crate::fetch::EntityFetcher;
use crate::lock::LockCoordinator;
use crate::snapshot::{BootstrapContext, Snapshot, SplitState, Transient};

/// Live backends handed to [`EntityServiceNode`] at bootstrap.
pub struct TierBackends {
    pub store: Arc<dyn DurableStore>,
    pub cache: Arc<dyn SharedCache>,
    pub clock: Arc<dyn Clock>,
    /// Secret the checksum key is derived from. Never persisted.
    pub checksum_secret: Option<Vec<u8>>,
}

/// Persistent settings of an [`EntityServiceNode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSettings {
    pub default_ttl_ms: u64,
    pub strict_cache: bool,
    pub lock_dir: PathBuf,
    pub lock_check_interval_ms: u64,
    pub lock_max_wait_ms: u64,
    pub checksum_iterations: u32,
}

impl From<&KernelConfig> for ServiceSettings {
    fn from(config: &KernelConfig) -> Self {
        ServiceSettings {
            default_ttl_ms: config.default_ttl.as_millis() as u64,
            strict_cache: config.strict_cache,
            lock_dir: config.lock_dir.clone(),
            lock_check_interval_ms: config.lock_check_interval.as_millis() as u64,
            lock_max_wait_ms: config.lock_max_wait.as_millis() as u64,
            checksum_iterations: config.checksum_iterations,
        }
    }
}

impl ServiceSettings {
    pub fn to_config(&self, environment: &str) -> KernelConfig {
        KernelConfig {
            environment: environment.to_string(),
            default_ttl: Duration::from_millis(self.default_ttl_ms),
            strict_cache: self.strict_cache,
            lock_dir: self.lock_dir.clone(),
            lock_check_interval: Duration::from_millis(self.lock_check_interval_ms),
            lock_max_wait: Duration::from_millis(self.lock_max_wait_ms),
            checksum_iterations: self.checksum_iterations,
            ..KernelConfig::default()
        }
    }
}

pub struct EntityServiceNode {
    settings: ServiceSettings,
    fetcher: Transient<Arc<EntityFetcher>>,
}

impl EntityServiceNode {
    pub fn new(config: &KernelConfig) -> Self {
        EntityServiceNode {
            settings: ServiceSettings::from(config),
            fetcher: Transient::detached("fetcher"),
        }
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    pub fn fetcher(&self) -> Result<&Arc<EntityFetcher>, SnapshotError> {
        self.fetcher.get()
    }
}

impl Snapshot for EntityServiceNode {
    const TYPE_TAG: &'static str = "keystone.entity_service";

    type Persistent = ServiceSettings;

    fn split_state(&mut self) -> SplitState<ServiceSettings> {
        self.fetcher.detach();
        SplitState {
            persistent: self.settings.clone(),
            transient: vec![self.fetcher.field()],
        }
    }

    fn restore(settings: ServiceSettings) -> Self {
        EntityServiceNode {
            settings,
            fetcher: Transient::detached("fetcher"),
        }
    }

    fn bootstrap(&mut self, ctx: &BootstrapContext<'_>) -> Result<(), SnapshotError> {
        let backends = ctx.require::<TierBackends>()?;
        let config = self.settings.to_config(ctx.environment());
        let locks = LockCoordinator::from_config(&config).map_err(|e| ctx.failure(e))?;

        let diagnostics: Arc<dyn DiagnosticSink> = match ctx.resource::<BufferedSink>() {
            Some(sink) => sink as Arc<dyn DiagnosticSink>,
            None => Arc::new(TracingSink),
        };

        let mut builder = EntityFetcher::builder(
            Arc::clone(&backends.store),
            Arc::clone(&backends.cache),
            Arc::new(locks),
        )
        .clock(Arc::clone(&backends.clock))
        .diagnostics(diagnostics)
        .config(config);

        if let Some(secret) = &backends.checksum_secret {
            let checksummer = Checksummer::from_secret(secret, self.settings.checksum_iterations)
                .map_err(|e| ctx.failure(e))?;
            builder = builder.checksummer(checksummer);
        }

        self.fetcher.attach(Arc::new(builder.build()));
        tracing::debug!(path = ctx.path(), "entity service bootstrapped");
        Ok(())
    }
}

/// Persistent settings of a [`DiagnosticLogNode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticLogSettings {
    /// Prefix for flushed entries in the log.
    pub label: String,
}

pub struct DiagnosticLogNode {
    settings: DiagnosticLogSettings,
    sink: Transient<Arc<BufferedSink>>,
}

impl DiagnosticLogNode {
    pub fn new(label: impl Into<String>) -> Self {
        DiagnosticLogNode {
            settings: DiagnosticLogSettings {
                label: label.into(),
            },
            sink: Transient::detached("sink"),
        }
    }

    pub fn sink(&self) -> Result<&Arc<BufferedSink>, SnapshotError> {
        self.sink.get()
    }

    /// Drains the sink into the tracing log. Returns how many entries were
    /// flushed.
    pub fn flush(&self) -> Result<usize, SnapshotError> {
        let events: Vec<DiagnosticEvent> = self.sink.get()?.drain();
        for event in &events {
            tracing::warn!(
                log = %self.settings.label,
                kind = %event.kind,
                key = %event.key,
                "{}",
                event.message
            );
        }
        Ok(events.len())
    }
}

impl Snapshot for DiagnosticLogNode {
    const TYPE_TAG: &'static str = "keystone.diagnostic_log";

    type Persistent = DiagnosticLogSettings;

    fn split_state(&mut self) -> SplitState<DiagnosticLogSettings> {
        self.sink.detach();
        SplitState {
            persistent: self.settings.clone(),
            transient: vec![self.sink.field()],
        }
    }

    fn restore(settings: DiagnosticLogSettings) -> Self {
        DiagnosticLogNode {
            settings,
            sink: Transient::detached("sink"),
        }
    }

    /// Attaches the shared [`BufferedSink`] resource, or a private one if
    /// none was provided.
    fn bootstrap(&mut self, ctx: &BootstrapContext<'_>) -> Result<(), SnapshotError> {
        let sink = match ctx.resource::<BufferedSink>() {
            Some(sink) => sink,
            None => Arc::new(BufferedSink::new()),
        };
        self.sink.attach(sink);
        Ok(())
    }

    fn pending_work(&self) -> usize {
        self.sink.get().map(|sink| sink.pending()).unwrap_or(0)
    }
}

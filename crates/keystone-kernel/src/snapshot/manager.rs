//! Snapshot lifecycle: cold/warm start, checkpoints and discard.
//!
//! One artifact per environment lives at `<dir>/<environment>.snapshot`.
//! Writes go to a temp file in the same directory and are renamed into
//! place, so a crash mid-write leaves the previous artifact intact.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;

use keystone_core::{Clock, SystemClock};

use crate::config::KernelConfig;
use crate::error::SnapshotError;
use crate::snapshot::artifact::{self, ArtifactBody};
use crate::snapshot::graph::{NodeRegistry, ObjectGraph, Resources};

const ARTIFACT_EXTENSION: &str = "snapshot";

/// How [`SnapshotManager::start`] obtained its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Built by application code.
    Cold,
    /// Restored from an artifact.
    Warm,
}

pub struct SnapshotManager {
    dir: PathBuf,
    environment: String,
    registry: NodeRegistry,
    clock: Arc<dyn Clock>,
}

impl SnapshotManager {
    pub fn new(
        dir: impl Into<PathBuf>,
        environment: impl Into<String>,
        registry: NodeRegistry,
    ) -> Result<Self, SnapshotError> {
        let environment = environment.into();
        if !is_valid_environment(&environment) {
            return Err(SnapshotError::InvalidEnvironment { name: environment });
        }
        Ok(SnapshotManager {
            dir: dir.into(),
            environment,
            registry,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn from_config(
        config: &KernelConfig,
        registry: NodeRegistry,
    ) -> Result<Self, SnapshotError> {
        Self::new(&config.snapshot_dir, config.environment.clone(), registry)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.dir
            .join(format!("{}.{}", self.environment, ARTIFACT_EXTENSION))
    }

    pub fn has_artifact(&self) -> bool {
        self.artifact_path().is_file()
    }

    /// Restores and bootstraps the graph when an artifact exists, otherwise
    /// builds it with `build` and bootstraps it.
    ///
    /// A damaged or mismatched artifact is an error; it never falls back to
    /// a cold start.
    pub fn start<F>(
        &self,
        resources: &Resources,
        build: F,
    ) -> Result<(ObjectGraph, StartMode), SnapshotError>
    where
        F: FnOnce() -> Result<ObjectGraph, SnapshotError>,
    {
        let (mut graph, mode) = if self.has_artifact() {
            (self.restore()?, StartMode::Warm)
        } else {
            (build()?, StartMode::Cold)
        };
        graph.bootstrap(&self.environment, resources)?;
        tracing::info!(environment = %self.environment, mode = ?mode, "object graph started");
        Ok((graph, mode))
    }

    /// Freezes `graph` and writes the artifact atomically. The graph is
    /// left `Snapshotted`; bootstrap it again before further use, or call
    /// [`SnapshotManager::checkpoint`] instead.
    pub fn snapshot(&self, graph: &mut ObjectGraph) -> Result<PathBuf, SnapshotError> {
        let root = graph.freeze()?;
        let body = ArtifactBody {
            environment: self.environment.clone(),
            root,
        };
        let bytes = artifact::encode(&body, self.clock.now_millis())?;

        let path = self.artifact_path();
        write_atomic(&self.dir, &path, &bytes)?;
        tracing::info!(
            environment = %self.environment,
            path = %path.display(),
            bytes = bytes.len(),
            "snapshot written"
        );
        Ok(path)
    }

    /// Snapshots `graph`, then bootstraps it again so it stays usable.
    pub fn checkpoint(
        &self,
        graph: &mut ObjectGraph,
        resources: &Resources,
    ) -> Result<PathBuf, SnapshotError> {
        let path = self.snapshot(graph)?;
        graph.bootstrap(&self.environment, resources)?;
        Ok(path)
    }

    /// Reads the artifact into a `Restored` graph. The graph cannot be used
    /// until it is bootstrapped.
    pub fn restore(&self) -> Result<ObjectGraph, SnapshotError> {
        let path = self.artifact_path();
        let bytes = fs::read(&path)?;
        let artifact = artifact::decode(&bytes)?;

        if artifact.body.environment != self.environment {
            return Err(SnapshotError::EnvironmentMismatch {
                expected: self.environment.clone(),
                found: artifact.body.environment,
            });
        }

        let root = self.registry.thaw(&artifact.body.root, None)?;
        let graph = ObjectGraph::restored(root)?;
        tracing::info!(
            environment = %self.environment,
            path = %path.display(),
            created_at = artifact.created_at,
            "snapshot restored"
        );
        Ok(graph)
    }

    /// Deletes the artifact so the next start is cold. Returns whether one
    /// existed.
    pub fn discard(&self) -> Result<bool, SnapshotError> {
        match fs::remove_file(self.artifact_path()) {
            Ok(()) => {
                tracing::info!(environment = %self.environment, "snapshot discarded");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for SnapshotManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotManager")
            .field("dir", &self.dir)
            .field("environment", &self.environment)
            .field("registry", &self.registry)
            .finish()
    }
}

fn is_valid_environment(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<(), SnapshotError> {
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

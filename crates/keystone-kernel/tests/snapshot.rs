//! Warm starts: snapshot, restore and bootstrap of a wired object graph.

mod common;

use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use common::{user, User, SECRET};
use keystone_core::{Entity, ManualClock};
use keystone_kernel::snapshot::artifact::{self, FrozenNode};
use keystone_kernel::snapshot::BootstrapContext;
use keystone_kernel::{
    BufferedSink, DiagnosticEvent, DiagnosticKind, DiagnosticLogNode, DiagnosticSink,
    EntityServiceNode, GraphState, KernelConfig, NodeRegistry, NodeSlot, ObjectGraph,
    ResolveOptions, Resources, Snapshot, SnapshotError, SnapshotManager, SplitState, StartMode,
    TierBackends, Transient,
};
use keystone_storage::{Checksummer, DurableStore, InMemoryCache, InMemoryStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ListenerSettings {
    addr: String,
}

/// Owns a bound socket, which can never be part of a snapshot.
struct Listener {
    settings: ListenerSettings,
    socket: Transient<TcpListener>,
}

impl Listener {
    fn new(addr: &str) -> Self {
        Listener {
            settings: ListenerSettings {
                addr: addr.to_string(),
            },
            socket: Transient::detached("socket"),
        }
    }

    fn local_addr(&self) -> Result<SocketAddr, SnapshotError> {
        Ok(self.socket.get()?.local_addr()?)
    }
}

impl Snapshot for Listener {
    const TYPE_TAG: &'static str = "test.listener";

    type Persistent = ListenerSettings;

    fn split_state(&mut self) -> SplitState<ListenerSettings> {
        self.socket.detach();
        SplitState {
            persistent: self.settings.clone(),
            transient: vec![self.socket.field()],
        }
    }

    fn restore(settings: ListenerSettings) -> Self {
        Listener {
            settings,
            socket: Transient::detached("socket"),
        }
    }

    fn bootstrap(&mut self, ctx: &BootstrapContext<'_>) -> Result<(), SnapshotError> {
        let socket = TcpListener::bind(&self.settings.addr).map_err(|e| ctx.failure(e))?;
        self.socket.attach(socket);
        Ok(())
    }
}

struct World {
    dir: tempfile::TempDir,
    config: KernelConfig,
    store: Arc<InMemoryStore>,
    sink: Arc<BufferedSink>,
    resources: Resources,
}

fn world() -> World {
    let dir = tempfile::tempdir().unwrap();
    let config = KernelConfig {
        environment: "staging".to_string(),
        lock_dir: dir.path().join("locks"),
        snapshot_dir: dir.path().join("snapshots"),
        checksum_iterations: 2,
        ..KernelConfig::default()
    };
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let store = Arc::new(InMemoryStore::new());
    let sink = Arc::new(BufferedSink::new());
    let backends = TierBackends {
        store: store.clone(),
        cache: Arc::new(InMemoryCache::new(clock.clone())),
        clock,
        checksum_secret: Some(SECRET.to_vec()),
    };
    let resources = Resources::new()
        .with(Arc::new(backends))
        .with(Arc::clone(&sink));
    World {
        dir,
        config,
        store,
        sink,
        resources,
    }
}

fn registry() -> NodeRegistry {
    NodeRegistry::new()
        .with::<EntityServiceNode>()
        .with::<DiagnosticLogNode>()
        .with::<Listener>()
}

fn manager(w: &World) -> SnapshotManager {
    SnapshotManager::from_config(&w.config, registry()).unwrap()
}

fn build(config: &KernelConfig) -> Result<ObjectGraph, SnapshotError> {
    ObjectGraph::new(
        NodeSlot::new("app", EntityServiceNode::new(config))
            .with_child(NodeSlot::new("diagnostics", DiagnosticLogNode::new("kernel")))
            .with_child(NodeSlot::new("listener", Listener::new("127.0.0.1:0"))),
    )
}

fn seed(store: &InMemoryStore) {
    let mut alice = user(1, "alice");
    Checksummer::from_secret(SECRET, 2).unwrap().stamp(&mut alice);
    store
        .insert(&alice.identity().unwrap(), &alice.to_record())
        .unwrap();
}

fn frozen(path: &Path) -> FrozenNode {
    let bytes = std::fs::read(path).unwrap();
    artifact::decode(&bytes).unwrap().body.root
}

#[test]
fn cold_then_warm_start() {
    let w = world();
    let m = manager(&w);
    let (mut graph, mode) = m.start(&w.resources, || build(&w.config)).unwrap();
    assert_eq!(mode, StartMode::Cold);
    assert_eq!(graph.state(), GraphState::Bootstrapped);
    assert_eq!(
        graph.paths(),
        vec!["app", "app/diagnostics", "app/listener"]
    );

    m.checkpoint(&mut graph, &w.resources).unwrap();
    assert!(m.has_artifact());

    let built = AtomicBool::new(false);
    let (warm, mode) = m
        .start(&w.resources, || {
            built.store(true, Ordering::SeqCst);
            build(&w.config)
        })
        .unwrap();
    assert_eq!(mode, StartMode::Warm);
    assert!(!built.load(Ordering::SeqCst));
    assert_eq!(warm.state(), GraphState::Bootstrapped);
    assert!(warm.node::<Listener>("app/listener").unwrap().local_addr().is_ok());
}

#[test]
fn resnapshot_of_restored_graph_is_identical() {
    let w = world();
    let m = manager(&w);
    let (mut graph, _) = m.start(&w.resources, || build(&w.config)).unwrap();
    let path = m.snapshot(&mut graph).unwrap();
    let first = std::fs::read(&path).unwrap();

    let (mut warm, mode) = m.start(&w.resources, || build(&w.config)).unwrap();
    assert_eq!(mode, StartMode::Warm);
    m.snapshot(&mut warm).unwrap();
    let second = std::fs::read(&path).unwrap();

    assert_eq!(artifact::stable_bytes(&first), artifact::stable_bytes(&second));
}

#[test]
fn artifact_holds_no_transient_values() {
    let w = world();
    let m = manager(&w);
    let (mut graph, _) = m.start(&w.resources, || build(&w.config)).unwrap();
    let path = m.snapshot(&mut graph).unwrap();

    let root = frozen(&path);
    assert_eq!(root.type_tag, EntityServiceNode::TYPE_TAG);
    assert_eq!(root.transient_fields, vec!["fetcher"]);
    assert_eq!(
        root.find("diagnostics").unwrap().transient_fields,
        vec!["sink"]
    );

    let listener = root.find("listener").unwrap();
    assert_eq!(listener.transient_fields, vec!["socket"]);
    let settings: ListenerSettings = postcard::from_bytes(&listener.state).unwrap();
    assert_eq!(settings.addr, "127.0.0.1:0");

    let bytes = std::fs::read(&path).unwrap();
    assert!(!bytes.windows(SECRET.len()).any(|window| window == SECRET));
}

#[test]
fn snapshot_detaches_every_transient_field() {
    let w = world();
    let m = manager(&w);
    let (mut graph, _) = m.start(&w.resources, || build(&w.config)).unwrap();
    m.snapshot(&mut graph).unwrap();

    assert_eq!(graph.state(), GraphState::Snapshotted);
    assert!(matches!(
        graph.node::<Listener>("app/listener"),
        Err(SnapshotError::InvalidState {
            state: GraphState::Snapshotted,
            ..
        })
    ));

    graph.bootstrap(m.environment(), &w.resources).unwrap();
    assert!(graph.node::<Listener>("app/listener").unwrap().local_addr().is_ok());
}

#[test]
fn restored_nodes_are_unusable_until_bootstrap() {
    let w = world();
    let m = manager(&w);
    let (mut graph, _) = m.start(&w.resources, || build(&w.config)).unwrap();
    m.snapshot(&mut graph).unwrap();

    let mut restored = m.restore().unwrap();
    assert_eq!(restored.state(), GraphState::Restored);
    assert!(matches!(
        restored.node::<Listener>("app/listener"),
        Err(SnapshotError::InvalidState {
            state: GraphState::Restored,
            ..
        })
    ));

    restored.bootstrap(m.environment(), &w.resources).unwrap();
    let listener = restored.node::<Listener>("app/listener").unwrap();
    assert_ne!(listener.local_addr().unwrap().port(), 0);
}

#[test]
fn detached_field_read_names_the_field() {
    let listener = Listener::restore(ListenerSettings {
        addr: "127.0.0.1:0".to_string(),
    });
    assert!(matches!(
        listener.local_addr(),
        Err(SnapshotError::NotBootstrapped { field: "socket" })
    ));
}

#[test]
fn warm_entity_service_serves_reads() {
    let w = world();
    seed(&w.store);
    let m = manager(&w);
    let (mut graph, _) = m.start(&w.resources, || build(&w.config)).unwrap();
    m.snapshot(&mut graph).unwrap();
    drop(graph);

    let (warm, mode) = m.start(&w.resources, || build(&w.config)).unwrap();
    assert_eq!(mode, StartMode::Warm);

    let service = warm.node::<EntityServiceNode>("app").unwrap();
    assert_eq!(service.settings().lock_dir, w.config.lock_dir);
    let fetcher = service.fetcher().unwrap();
    let resolved = fetcher.fetch::<User>(1, &ResolveOptions::default()).unwrap();
    assert_eq!(resolved.entity.username, "alice");
}

#[test]
fn pending_diagnostics_refuse_snapshot() {
    let w = world();
    let m = manager(&w);
    let (mut graph, _) = m.start(&w.resources, || build(&w.config)).unwrap();

    w.sink.record(DiagnosticEvent::new(
        DiagnosticKind::CacheRead,
        "users:1",
        "cache offline",
    ));
    let err = m.snapshot(&mut graph).unwrap_err();
    assert!(matches!(
        err,
        SnapshotError::Refused { ref node, pending: 1 } if node == "app/diagnostics"
    ));
    assert_eq!(graph.state(), GraphState::Bootstrapped);
    assert!(!m.has_artifact());

    let flushed = graph
        .node::<DiagnosticLogNode>("app/diagnostics")
        .unwrap()
        .flush()
        .unwrap();
    assert_eq!(flushed, 1);
    m.snapshot(&mut graph).unwrap();
}

#[test]
fn unregistered_type_is_a_restore_mismatch() {
    let w = world();
    let m = manager(&w);
    let (mut graph, _) = m.start(&w.resources, || build(&w.config)).unwrap();
    m.snapshot(&mut graph).unwrap();

    let partial = NodeRegistry::new()
        .with::<EntityServiceNode>()
        .with::<DiagnosticLogNode>();
    let m2 = SnapshotManager::from_config(&w.config, partial).unwrap();
    let err = m2.restore().unwrap_err();
    assert!(matches!(
        err,
        SnapshotError::RestoreTypeMismatch { ref path, .. } if path == "app/listener"
    ));
}

#[test]
fn typed_access_checks_the_node_type() {
    let w = world();
    let m = manager(&w);
    let (graph, _) = m.start(&w.resources, || build(&w.config)).unwrap();
    assert!(matches!(
        graph.node::<Listener>("app"),
        Err(SnapshotError::RestoreTypeMismatch { .. })
    ));
    assert!(matches!(
        graph.node::<Listener>("app/missing"),
        Err(SnapshotError::UnknownNode { .. })
    ));
}

#[test]
fn artifact_from_another_environment_is_rejected() {
    let w = world();
    let m = manager(&w);
    let (mut graph, _) = m.start(&w.resources, || build(&w.config)).unwrap();
    let path = m.snapshot(&mut graph).unwrap();

    let prod = KernelConfig {
        environment: "production".to_string(),
        ..w.config.clone()
    };
    let m_prod = SnapshotManager::from_config(&prod, registry()).unwrap();
    std::fs::copy(&path, m_prod.artifact_path()).unwrap();

    let err = m_prod
        .start(&w.resources, || build(&prod))
        .unwrap_err();
    assert!(matches!(
        err,
        SnapshotError::EnvironmentMismatch { ref expected, ref found }
            if expected == "production" && found == "staging"
    ));
}

#[test]
fn corrupt_artifact_never_falls_back_to_cold_start() {
    let w = world();
    let m = manager(&w);
    let (mut graph, _) = m.start(&w.resources, || build(&w.config)).unwrap();
    let path = m.snapshot(&mut graph).unwrap();

    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x5a;
    std::fs::write(&path, &bytes).unwrap();

    let built = AtomicBool::new(false);
    let err = m
        .start(&w.resources, || {
            built.store(true, Ordering::SeqCst);
            build(&w.config)
        })
        .unwrap_err();
    assert!(matches!(err, SnapshotError::Corrupt { .. }));
    assert!(!built.load(Ordering::SeqCst));
}

#[test]
fn discard_forces_cold_start() {
    let w = world();
    let m = manager(&w);
    let (mut graph, _) = m.start(&w.resources, || build(&w.config)).unwrap();
    m.checkpoint(&mut graph, &w.resources).unwrap();

    assert!(m.discard().unwrap());
    assert!(!m.discard().unwrap());
    let (_, mode) = m.start(&w.resources, || build(&w.config)).unwrap();
    assert_eq!(mode, StartMode::Cold);
}

#[test]
fn bootstrap_needs_its_resources() {
    let w = world();
    let m = manager(&w);
    let (mut graph, _) = m.start(&w.resources, || build(&w.config)).unwrap();
    m.snapshot(&mut graph).unwrap();

    let mut restored = m.restore().unwrap();
    let err = restored
        .bootstrap(m.environment(), &Resources::new())
        .unwrap_err();
    assert!(matches!(err, SnapshotError::MissingResource { .. }));
}

#[test]
fn failing_bootstrap_names_the_node() {
    let w = world();
    let mut graph = ObjectGraph::new(
        NodeSlot::new("app", DiagnosticLogNode::new("kernel"))
            .with_child(NodeSlot::new("listener", Listener::new("not-an-address"))),
    )
    .unwrap();
    let err = graph.bootstrap("staging", &w.resources).unwrap_err();
    assert!(matches!(
        err,
        SnapshotError::Bootstrap { ref node, .. } if node == "app/listener"
    ));
    assert_eq!(graph.state(), GraphState::Cold);
}

#[test]
fn bootstrapped_graph_cannot_bootstrap_again() {
    let w = world();
    let m = manager(&w);
    let (mut graph, _) = m.start(&w.resources, || build(&w.config)).unwrap();
    assert!(matches!(
        graph.bootstrap(m.environment(), &w.resources),
        Err(SnapshotError::InvalidState {
            operation: "bootstrap",
            ..
        })
    ));
}

#[test]
fn snapshot_before_bootstrap_is_refused() {
    let w = world();
    let m = manager(&w);
    let mut graph = build(&w.config).unwrap();
    assert!(matches!(
        m.snapshot(&mut graph),
        Err(SnapshotError::InvalidState {
            state: GraphState::Cold,
            ..
        })
    ));
}

#[test]
fn duplicate_child_names_are_rejected() {
    let err = ObjectGraph::new(
        NodeSlot::new("app", DiagnosticLogNode::new("a"))
            .with_child(NodeSlot::new("log", DiagnosticLogNode::new("b")))
            .with_child(NodeSlot::new("log", DiagnosticLogNode::new("c"))),
    )
    .unwrap_err();
    assert!(matches!(err, SnapshotError::InvalidGraph { .. }));
}

#[test]
fn artifacts_are_per_environment() {
    let w = world();
    let m = manager(&w);
    assert_eq!(
        m.artifact_path(),
        w.dir.path().join("snapshots").join("staging.snapshot")
    );
}

//! The object graph: named nodes, their children, and the lifecycle state
//! the whole graph is in.
//!
//! ```text
//! Cold ──bootstrap──▶ Bootstrapped ──snapshot──▶ Snapshotted
//!                         ▲                          │
//!                         └───────bootstrap──────────┘
//! Restored ──bootstrap──▶ Bootstrapped
//! ```
//!
//! Typed node access is only allowed while the graph is `Bootstrapped`, so
//! a node is never used between restore and the end of its bootstrap.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::error::SnapshotError;
use crate::snapshot::artifact::FrozenNode;
use crate::snapshot::node::{restore_node, GraphNode, Snapshot};

/// Path separator between node names.
pub const PATH_SEPARATOR: char = '/';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphState {
    /// Built by application code, transient resources not yet created.
    Cold,
    Bootstrapped,
    /// Frozen; every transient field is detached.
    Snapshotted,
    /// Thawed from an artifact, transient resources not yet created.
    Restored,
}

impl fmt::Display for GraphState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GraphState::Cold => "cold",
            GraphState::Bootstrapped => "bootstrapped",
            GraphState::Snapshotted => "snapshotted",
            GraphState::Restored => "restored",
        };
        f.write_str(s)
    }
}

/// One node of the graph and its explicitly registered children.
pub struct NodeSlot {
    name: String,
    node: Box<dyn GraphNode>,
    children: Vec<NodeSlot>,
}

impl NodeSlot {
    pub fn new<T: Snapshot>(name: impl Into<String>, node: T) -> Self {
        NodeSlot {
            name: name.into(),
            node: Box::new(node),
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: NodeSlot) -> Self {
        self.children.push(child);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_tag(&self) -> &'static str {
        self.node.type_tag()
    }

    pub fn children(&self) -> &[NodeSlot] {
        &self.children
    }
}

impl fmt::Debug for NodeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSlot")
            .field("name", &self.name)
            .field("type_tag", &self.type_tag())
            .field("children", &self.children)
            .finish()
    }
}

/// Shared handles handed to nodes during bootstrap, keyed by type.
#[derive(Default, Clone)]
pub struct Resources {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<R: Any + Send + Sync>(&mut self, resource: Arc<R>) -> &mut Self {
        self.entries.insert(TypeId::of::<R>(), resource);
        self
    }

    pub fn with<R: Any + Send + Sync>(mut self, resource: Arc<R>) -> Self {
        self.insert(resource);
        self
    }

    pub fn get<R: Any + Send + Sync>(&self) -> Option<Arc<R>> {
        let entry = self.entries.get(&TypeId::of::<R>())?;
        Arc::clone(entry).downcast::<R>().ok()
    }
}

impl fmt::Debug for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resources")
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// What a node sees while it bootstraps.
pub struct BootstrapContext<'a> {
    environment: &'a str,
    path: &'a str,
    resources: &'a Resources,
}

impl<'a> BootstrapContext<'a> {
    pub fn environment(&self) -> &'a str {
        self.environment
    }

    /// Path of the node being bootstrapped.
    pub fn path(&self) -> &'a str {
        self.path
    }

    pub fn resource<R: Any + Send + Sync>(&self) -> Option<Arc<R>> {
        self.resources.get::<R>()
    }

    pub fn require<R: Any + Send + Sync>(&self) -> Result<Arc<R>, SnapshotError> {
        self.resource::<R>().ok_or(SnapshotError::MissingResource {
            type_name: std::any::type_name::<R>(),
        })
    }

    /// A bootstrap failure attributed to the current node.
    pub fn failure(&self, reason: impl fmt::Display) -> SnapshotError {
        SnapshotError::Bootstrap {
            node: self.path.to_string(),
            reason: reason.to_string(),
        }
    }
}

type RestoreFn = fn(&[u8]) -> Result<Box<dyn GraphNode>, postcard::Error>;

/// Maps type tags to restore functions. Restore only accepts tags that
/// were registered.
#[derive(Default, Clone)]
pub struct NodeRegistry {
    factories: HashMap<&'static str, RestoreFn>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Snapshot>(&mut self) -> &mut Self {
        self.factories.insert(T::TYPE_TAG, restore_node::<T>);
        self
    }

    pub fn with<T: Snapshot>(mut self) -> Self {
        self.register::<T>();
        self
    }

    pub fn contains(&self, type_tag: &str) -> bool {
        self.factories.contains_key(type_tag)
    }

    pub(crate) fn thaw(
        &self,
        frozen: &FrozenNode,
        parent: Option<&str>,
    ) -> Result<NodeSlot, SnapshotError> {
        let path = join_path(parent, &frozen.name);
        let factory = self.factories.get(frozen.type_tag.as_str()).ok_or_else(|| {
            SnapshotError::RestoreTypeMismatch {
                path: path.clone(),
                detail: format!("unregistered type tag {}", frozen.type_tag),
            }
        })?;
        let node = factory(&frozen.state).map_err(|e| SnapshotError::RestoreTypeMismatch {
            path: path.clone(),
            detail: format!("state does not decode as {}: {}", frozen.type_tag, e),
        })?;

        let children = frozen
            .children
            .iter()
            .map(|child| self.thaw(child, Some(&path)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(NodeSlot {
            name: frozen.name.clone(),
            node,
            children,
        })
    }
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.factories.keys().collect();
        tags.sort();
        f.debug_struct("NodeRegistry").field("tags", &tags).finish()
    }
}

fn join_path(parent: Option<&str>, name: &str) -> String {
    match parent {
        Some(parent) => format!("{}{}{}", parent, PATH_SEPARATOR, name),
        None => name.to_string(),
    }
}

/// The wired application: a rooted tree of snapshot-aware nodes.
#[derive(Debug)]
pub struct ObjectGraph {
    root: NodeSlot,
    state: GraphState,
}

impl ObjectGraph {
    /// Wraps a freshly constructed tree. The graph starts `Cold`.
    pub fn new(root: NodeSlot) -> Result<Self, SnapshotError> {
        Self::with_state(root, GraphState::Cold)
    }

    pub(crate) fn restored(root: NodeSlot) -> Result<Self, SnapshotError> {
        Self::with_state(root, GraphState::Restored)
    }

    fn with_state(root: NodeSlot, state: GraphState) -> Result<Self, SnapshotError> {
        validate_names(&root)?;
        Ok(ObjectGraph { root, state })
    }

    pub fn state(&self) -> GraphState {
        self.state
    }

    pub fn root(&self) -> &NodeSlot {
        &self.root
    }

    /// Every node path, depth-first from the root.
    pub fn paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_paths(&self.root, None, &mut out);
        out
    }

    /// Re-creates transient resources on every node, depth-first from the
    /// root. Refused on a graph that is already bootstrapped.
    pub fn bootstrap(
        &mut self,
        environment: &str,
        resources: &Resources,
    ) -> Result<(), SnapshotError> {
        if self.state == GraphState::Bootstrapped {
            return Err(SnapshotError::InvalidState {
                operation: "bootstrap",
                state: self.state,
            });
        }
        bootstrap_slot(&mut self.root, None, environment, resources)?;
        self.state = GraphState::Bootstrapped;
        tracing::debug!(environment, "object graph bootstrapped");
        Ok(())
    }

    /// Nodes reporting in-flight work, with their counts.
    pub fn pending_work(&self) -> Vec<(String, usize)> {
        let mut out = Vec::new();
        collect_pending(&self.root, None, &mut out);
        out
    }

    pub fn node<T: Snapshot>(&self, path: &str) -> Result<&T, SnapshotError> {
        self.require_bootstrapped("access nodes")?;
        let slot = self.find(path)?;
        let found = slot.node.type_tag();
        slot.node
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| type_mismatch::<T>(path, found))
    }

    pub fn node_mut<T: Snapshot>(&mut self, path: &str) -> Result<&mut T, SnapshotError> {
        self.require_bootstrapped("access nodes")?;
        let slot = self.find_mut(path)?;
        let found = slot.node.type_tag();
        slot.node
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| type_mismatch::<T>(path, found))
    }

    /// Detaches all transient state and returns the persistent tree.
    ///
    /// Refused unless the graph is bootstrapped and no node reports
    /// pending work. The graph is left `Snapshotted`.
    pub(crate) fn freeze(&mut self) -> Result<FrozenNode, SnapshotError> {
        self.require_bootstrapped("snapshot")?;
        if let Some((node, pending)) = self.pending_work().into_iter().next() {
            return Err(SnapshotError::Refused { node, pending });
        }
        self.state = GraphState::Snapshotted;
        freeze_slot(&mut self.root)
    }

    fn require_bootstrapped(&self, operation: &'static str) -> Result<(), SnapshotError> {
        if self.state != GraphState::Bootstrapped {
            return Err(SnapshotError::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    fn find(&self, path: &str) -> Result<&NodeSlot, SnapshotError> {
        let unknown = || SnapshotError::UnknownNode {
            path: path.to_string(),
        };
        let mut segments = path.split(PATH_SEPARATOR);
        if segments.next() != Some(self.root.name.as_str()) {
            return Err(unknown());
        }
        let mut slot = &self.root;
        for segment in segments {
            slot = slot
                .children
                .iter()
                .find(|c| c.name == segment)
                .ok_or_else(unknown)?;
        }
        Ok(slot)
    }

    fn find_mut(&mut self, path: &str) -> Result<&mut NodeSlot, SnapshotError> {
        let unknown = || SnapshotError::UnknownNode {
            path: path.to_string(),
        };
        let mut segments = path.split(PATH_SEPARATOR);
        if segments.next() != Some(self.root.name.as_str()) {
            return Err(unknown());
        }
        let mut slot = &mut self.root;
        for segment in segments {
            slot = slot
                .children
                .iter_mut()
                .find(|c| c.name == segment)
                .ok_or_else(unknown)?;
        }
        Ok(slot)
    }
}

fn type_mismatch<T: Snapshot>(path: &str, found: &str) -> SnapshotError {
    SnapshotError::RestoreTypeMismatch {
        path: path.to_string(),
        detail: format!("expected {}, found {}", T::TYPE_TAG, found),
    }
}

fn validate_names(root: &NodeSlot) -> Result<(), SnapshotError> {
    fn check(slot: &NodeSlot) -> Result<(), SnapshotError> {
        if slot.name.is_empty() || slot.name.contains(PATH_SEPARATOR) {
            return Err(SnapshotError::InvalidGraph {
                reason: format!("invalid node name {:?}", slot.name),
            });
        }
        let mut seen = HashSet::new();
        for child in &slot.children {
            if !seen.insert(child.name.as_str()) {
                return Err(SnapshotError::InvalidGraph {
                    reason: format!("duplicate child {:?} under {:?}", child.name, slot.name),
                });
            }
            check(child)?;
        }
        Ok(())
    }
    check(root)
}

fn collect_paths(slot: &NodeSlot, parent: Option<&str>, out: &mut Vec<String>) {
    let path = join_path(parent, &slot.name);
    out.push(path.clone());
    for child in &slot.children {
        collect_paths(child, Some(&path), out);
    }
}

fn collect_pending(slot: &NodeSlot, parent: Option<&str>, out: &mut Vec<(String, usize)>) {
    let path = join_path(parent, &slot.name);
    let pending = slot.node.pending_work();
    if pending > 0 {
        out.push((path.clone(), pending));
    }
    for child in &slot.children {
        collect_pending(child, Some(&path), out);
    }
}

fn bootstrap_slot(
    slot: &mut NodeSlot,
    parent: Option<&str>,
    environment: &str,
    resources: &Resources,
) -> Result<(), SnapshotError> {
    let path = join_path(parent, &slot.name);
    let ctx = BootstrapContext {
        environment,
        path: &path,
        resources,
    };
    slot.node.bootstrap(&ctx)?;
    for child in &mut slot.children {
        bootstrap_slot(child, Some(&path), environment, resources)?;
    }
    Ok(())
}

fn freeze_slot(slot: &mut NodeSlot) -> Result<FrozenNode, SnapshotError> {
    let (state, transient_fields) = slot.node.freeze()?;
    let children = slot
        .children
        .iter_mut()
        .map(freeze_slot)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(FrozenNode {
        name: slot.name.clone(),
        type_tag: slot.node.type_tag().to_string(),
        state,
        transient_fields,
        children,
    })
}

//! Snapshot-aware graph nodes.
//!
//! A node states its own split between persistent and transient state via
//! [`Snapshot::split_state`]; nothing is discovered by introspection.
//! Transient fields are wrapped in [`Transient`], which is emptied at
//! snapshot time and refilled by [`Snapshot::bootstrap`].

use std::any::Any;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::SnapshotError;
use crate::snapshot::graph::BootstrapContext;

/// The persistent half of a node plus the names of the transient fields
/// that were detached to produce it.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitState<P> {
    pub persistent: P,
    pub transient: Vec<&'static str>,
}

/// A node that can be frozen into a snapshot and thawed back.
pub trait Snapshot: Any + Send + Sync + Sized {
    /// Stable tag written into the artifact and checked on restore.
    const TYPE_TAG: &'static str;

    type Persistent: Serialize + DeserializeOwned;

    /// Detaches every transient field and returns the persistent state.
    fn split_state(&mut self) -> SplitState<Self::Persistent>;

    /// Rebuilds the node from persistent state. Transient fields start
    /// detached.
    fn restore(state: Self::Persistent) -> Self;

    /// Re-creates transient resources from the persistent state.
    fn bootstrap(&mut self, ctx: &BootstrapContext<'_>) -> Result<(), SnapshotError>;

    /// Items of in-flight work that a snapshot would lose.
    fn pending_work(&self) -> usize {
        0
    }
}

/// Object-safe view of a [`Snapshot`] node, as stored in the graph.
pub trait GraphNode: Any + Send + Sync {
    fn type_tag(&self) -> &'static str;

    /// Detaches transient fields and encodes the persistent state.
    fn freeze(&mut self) -> Result<(Vec<u8>, Vec<String>), SnapshotError>;

    fn bootstrap(&mut self, ctx: &BootstrapContext<'_>) -> Result<(), SnapshotError>;

    fn pending_work(&self) -> usize;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Snapshot> GraphNode for T {
    fn type_tag(&self) -> &'static str {
        T::TYPE_TAG
    }

    fn freeze(&mut self) -> Result<(Vec<u8>, Vec<String>), SnapshotError> {
        let split = self.split_state();
        let state = postcard::to_allocvec(&split.persistent)?;
        let transient = split.transient.into_iter().map(String::from).collect();
        Ok((state, transient))
    }

    fn bootstrap(&mut self, ctx: &BootstrapContext<'_>) -> Result<(), SnapshotError> {
        Snapshot::bootstrap(self, ctx)
    }

    fn pending_work(&self) -> usize {
        Snapshot::pending_work(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Decodes persistent state and restores a `T`. Registered per type tag.
pub(crate) fn restore_node<T: Snapshot>(
    state: &[u8],
) -> Result<Box<dyn GraphNode>, postcard::Error> {
    let persistent: T::Persistent = postcard::from_bytes(state)?;
    Ok(Box::new(T::restore(persistent)))
}

/// A field that only exists between bootstrap and snapshot.
///
/// Reading a detached field is an error naming the field, never a stale
/// value.
pub struct Transient<T> {
    field: &'static str,
    value: Option<T>,
}

impl<T> Transient<T> {
    /// A detached field.
    pub fn detached(field: &'static str) -> Self {
        Transient { field, value: None }
    }

    pub fn live(field: &'static str, value: T) -> Self {
        Transient {
            field,
            value: Some(value),
        }
    }

    pub fn field(&self) -> &'static str {
        self.field
    }

    pub fn is_live(&self) -> bool {
        self.value.is_some()
    }

    pub fn get(&self) -> Result<&T, SnapshotError> {
        self.value
            .as_ref()
            .ok_or(SnapshotError::NotBootstrapped { field: self.field })
    }

    pub fn get_mut(&mut self) -> Result<&mut T, SnapshotError> {
        self.value
            .as_mut()
            .ok_or(SnapshotError::NotBootstrapped { field: self.field })
    }

    pub fn attach(&mut self, value: T) {
        self.value = Some(value);
    }

    /// Empties the field, returning the value it held.
    pub fn detach(&mut self) -> Option<T> {
        self.value.take()
    }
}

impl<T> fmt::Debug for Transient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_live() { "live" } else { "detached" };
        write!(f, "Transient({}: {})", self.field, state)
    }
}

//! Whole-graph snapshot and restore.
//!
//! # Modules
//!
//! - [`node`]: the [`Snapshot`] trait nodes implement and [`Transient`]
//! - [`graph`]: [`ObjectGraph`], bootstrap resources and the node registry
//! - [`artifact`]: the binary artifact format
//! - [`manager`]: [`SnapshotManager`] start/checkpoint/restore/discard

pub mod artifact;
pub mod graph;
pub mod manager;
pub mod node;

pub use artifact::{Artifact, ArtifactBody, FrozenNode};
pub use graph::{BootstrapContext, GraphState, NodeRegistry, NodeSlot, ObjectGraph, Resources};
pub use manager::{SnapshotManager, StartMode};
pub use node::{GraphNode, Snapshot, SplitState, Transient};

//! Immutable computation graph: node specs, validation, topological order.
//!
//! A [`Graph`] is an arena of nodes addressed by dense indices. Edges are
//! stored twice (inputs and dependents) as index lists, so traversal in either
//! direction needs no owning references between nodes.

pub mod dot;
pub mod error;
pub mod graph;
pub mod spec;
pub mod topo;

pub use error::GraphError;
pub use graph::{Graph, Node};
pub use spec::{GraphSpec, NodeSpec, Placement};
pub use topo::TopologicalOrder;

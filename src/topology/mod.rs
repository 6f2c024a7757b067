//! Topology declaration and its resolved execution-time graph.

pub mod declaration;
pub mod graph;
pub mod placement;

#[cfg(test)]
mod graph_test;

pub use declaration::{
  ComponentConfig, ComponentDeclaration, ComponentKind, CustomGrouping, Grouping,
  InputDeclaration, StreamDeclaration, TopologyDeclaration,
};
pub use graph::{ComponentInfo, EdgeId, StreamEdge, TaskInstance, TopologyGraph};
pub use placement::{InstanceSlot, Placement, RoundRobinPlacement};

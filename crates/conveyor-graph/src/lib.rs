//! Pipeline diagram construction for Conveyor.
//!
//! Turns a [`PipelineSnapshot`](conveyor_types::PipelineSnapshot) into a
//! positioned node/edge graph:
//! - [`StateClassifier`] maps raw producer tokens to canonical states
//! - [`GraphBuilder`] emits nodes, edges, groups, and fan-in/fan-out waypoints
//! - [`LayoutEngine`] assigns layers and coordinates, left to right
//! - [`ExpansionController`] tracks the single expanded node

pub mod builder;
pub mod classifier;
pub mod expansion;
pub mod layout;
pub mod view;

pub use builder::{
    BuildOutput, EdgeKind, EdgeStyle, GraphBuilder, GraphEdge, GraphNode, Group, NodeData,
    NodeKind, NodeSizing, Position, SidecarReserve, Size,
};
pub use classifier::{classify, ClassifierConfig, ReadyTokenPolicy, StateClassifier};
pub use expansion::{ExpandKind, Expanded, ExpansionController, FitRequest};
pub use layout::{Bounds, LayoutConfig, LayoutEngine, PositionedGraph};
pub use view::{GraphView, ViewConfig};

//! Structural errors for graph construction and mutation.
//!
//! Uses `thiserror` for matchable variants. Every variant that can be
//! localized carries the offending [`NodeId`]. A rejected mutation never
//! leaves the graph partially modified.

use thiserror::Error;

use crate::id::NodeId;
use crate::node::NodeKind;

/// Errors produced while building or mutating a [`Graph`](crate::graph::Graph).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    /// The node does not exist in the graph.
    #[error("node not found: {node}")]
    NodeNotFound { node: NodeId },

    /// The node's slot was vacated (and possibly reused) since the handle was issued.
    #[error("stale node handle: {node}")]
    StaleNode { node: NodeId },

    /// The handle belongs to a different graph.
    #[error("node {node} belongs to another graph")]
    ForeignNode { node: NodeId },

    /// A dependency passed to `add_node` is not a live member of the graph.
    #[error("invalid dependency: {node} is not a member of the graph")]
    InvalidDependency { node: NodeId },

    /// The same dependency was listed twice for one node.
    #[error("duplicate dependency on {node}")]
    DuplicateDependency { node: NodeId },

    /// The edge would create a cycle (including a self-edge).
    #[error("edge {from} -> {to} would create a cycle")]
    CycleDetected { from: NodeId, to: NodeId },

    /// The edge already exists.
    #[error("duplicate edge {from} -> {to}")]
    DuplicateEdge { from: NodeId, to: NodeId },

    /// The edge to remove does not exist.
    #[error("edge not found: {from} -> {to}")]
    EdgeNotFound { from: NodeId, to: NodeId },

    /// The mutation is not permitted on this graph.
    #[error("unsupported: {reason}")]
    Unsupported { reason: String },

    /// Parameters of one kind were supplied for a node of another kind.
    #[error("node {node} is a {expected} node, got {actual} parameters")]
    KindMismatch {
        node: NodeId,
        expected: NodeKind,
        actual: NodeKind,
    },

    /// Parameter block is malformed.
    #[error("invalid parameters: {reason}")]
    InvalidParameters { reason: String },
}

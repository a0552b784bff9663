//! Error types for the cluster state model.

use routegrid_core::{NodeId, SlotKind};
use thiserror::Error;

/// Result type alias for state operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur while mutating cluster state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("node already registered: {0}")]
    DuplicateNode(NodeId),

    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("invalid metrics for node {node}: {reason}")]
    InvalidMetric { node: NodeId, reason: String },

    #[error("no free {kind} slot on node {node}")]
    NoFreeSlot { node: NodeId, kind: SlotKind },

    #[error("no free device on node {node} has {required} bytes available")]
    NoFittingDevice { node: NodeId, required: u64 },
}

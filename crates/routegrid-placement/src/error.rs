//! Routing errors.

use thiserror::Error;

use crate::decision::Rejection;

/// Result type alias for routing operations.
pub type RoutingResult<T> = Result<T, RoutingError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RoutingError {
    /// No node could ever run the task as submitted.
    #[error("no capable node ({} candidates rejected)", rejected.len())]
    NoCapableNode { rejected: Vec<Rejection> },

    /// Capable nodes exist but none can take the task right now.
    #[error("all capable candidates are busy ({} candidates rejected)", rejected.len())]
    AllCandidatesBusy { rejected: Vec<Rejection> },

    /// The snapshot predates the last topology change; fetch a new one.
    #[error("snapshot version {snapshot} is older than freshness floor {floor}")]
    StaleSnapshot {
        snapshot: u64,
        floor: u64,
        rejected: Vec<Rejection>,
    },
}

impl RoutingError {
    pub fn rejected(&self) -> &[Rejection] {
        match self {
            RoutingError::NoCapableNode { rejected }
            | RoutingError::AllCandidatesBusy { rejected }
            | RoutingError::StaleSnapshot { rejected, .. } => rejected,
        }
    }

    /// Whether retrying later could succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, RoutingError::NoCapableNode { .. })
    }
}

//! routegrid-placement: the routing agent.
//!
//! Given one task and an immutable cluster snapshot, pick the node the
//! task should run on, or explain why none can take it.
//!
//! # Components
//!
//! - **`scorer`**: candidate filtering and weighted scoring
//! - **`router`**: tie-break, preferred-node and warm-only rules, fallback chain
//! - **`decision`**: the `RoutingDecision` record kept for diagnostics

pub mod decision;
pub mod error;
pub mod router;
pub mod scorer;

pub use decision::{Rejection, RejectReason, RoutingDecision};
pub use error::{RoutingError, RoutingResult};
pub use router::RoutingAgent;
pub use scorer::{ScoreBreakdown, ScoredCandidate, check_node, score_candidates};

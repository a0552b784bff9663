//! routegrid-state: the in-memory state model of the cluster.
//!
//! # Architecture
//!
//! ```text
//! ClusterState
//!   ├── HardwareRegistry (declared node specs, versioned writes)
//!   ├── Live node state (telemetry, freshness, slot occupancy)
//!   └── snapshot() → ClusterSnapshot (immutable, versioned copy)
//!
//! WarmStateTracker
//!   └── (node, model) → WarmEntry, TTL and memory-pressure eviction
//! ```
//!
//! `ClusterState` and `WarmStateTracker` are `Send + Sync`; share them
//! behind an `Arc`. Readers get owned snapshots, so a routing decision
//! never observes a half-applied update.

pub mod cluster;
pub mod error;
pub mod registry;
pub mod snapshot;
pub mod warm;

pub use cluster::{ApplyOutcome, ClusterState, SlotAssignment, TelemetryUpdate};
pub use error::{StateError, StateResult};
pub use registry::{HardwareRegistry, NodeUpdate};
pub use snapshot::{ClusterSnapshot, NodeView};
pub use warm::{WarmEntry, WarmStateTracker, WarmView};

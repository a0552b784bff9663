//! Routing decisions and candidate rejections.

use std::fmt;

use serde::Serialize;

use routegrid_core::*;

use crate::scorer::ScoreBreakdown;

/// Why a node was not chosen.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    MissingCapabilities { missing: Vec<Capability> },
    /// Listed in the task's `excluded_nodes`.
    ExcludedByTask,
    /// The node has no slot of the requested kind at all.
    NoSlotKind { requested: SlotRequest },
    AcceleratorMemoryTooSmall { required: u64, largest: Option<u64> },
    LatencyTooHigh { latency_ms: u32, max_latency_ms: u32 },
    PoweredDown { state: PowerState },
    Stale { last_seen: Timestamp },
    NoFreeSlot { kind: SlotKind },
    InsufficientMemory { required: u64, free: Option<u64> },
    /// A warm candidate exists and the task requires one.
    ColdModel,
    /// The reservation failed at dispatch time.
    ReservationFailed,
}

impl RejectReason {
    /// Whether this rejection holds regardless of current load.
    pub fn is_incapable(&self) -> bool {
        matches!(
            self,
            RejectReason::MissingCapabilities { .. }
                | RejectReason::ExcludedByTask
                | RejectReason::NoSlotKind { .. }
                | RejectReason::AcceleratorMemoryTooSmall { .. }
                | RejectReason::LatencyTooHigh { .. }
        )
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::MissingCapabilities { missing } => {
                let tags: Vec<&str> = missing.iter().map(Capability::as_str).collect();
                write!(f, "missing capabilities: {}", tags.join(", "))
            }
            RejectReason::ExcludedByTask => f.write_str("excluded by task constraints"),
            RejectReason::NoSlotKind { requested } => write!(f, "no {requested:?} slots"),
            RejectReason::AcceleratorMemoryTooSmall { required, largest } => write!(
                f,
                "largest accelerator has {} bytes, {required} required",
                largest.unwrap_or(0)
            ),
            RejectReason::LatencyTooHigh {
                latency_ms,
                max_latency_ms,
            } => write!(f, "latency {latency_ms}ms exceeds {max_latency_ms}ms"),
            RejectReason::PoweredDown { state } => write!(f, "power state {state:?}"),
            RejectReason::Stale { last_seen } => write!(f, "stale since {last_seen}"),
            RejectReason::NoFreeSlot { kind } => write!(f, "no free {kind} slot"),
            RejectReason::InsufficientMemory { required, free } => match free {
                Some(free) => write!(f, "{free} bytes free, {required} required"),
                None => write!(f, "free memory unknown, {required} required"),
            },
            RejectReason::ColdModel => f.write_str("model not warm"),
            RejectReason::ReservationFailed => f.write_str("reservation failed"),
        }
    }
}

/// A rejected candidate and the reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub node_id: NodeId,
    #[serde(flatten)]
    pub reason: RejectReason,
}

impl Rejection {
    pub fn new(node_id: impl Into<String>, reason: RejectReason) -> Self {
        Self {
            node_id: node_id.into(),
            reason,
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.node_id, self.reason)
    }
}

/// The outcome of routing one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingDecision {
    pub task_id: TaskId,
    pub node_id: NodeId,
    pub score: f64,
    pub slot: SlotKind,
    pub breakdown: ScoreBreakdown,
    pub rejected: Vec<Rejection>,
    pub decided_at: Timestamp,
    pub snapshot_version: u64,
    /// The node was stale and picked only because nothing fresh qualified.
    pub degraded: bool,
}

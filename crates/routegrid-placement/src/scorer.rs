//! Candidate filtering and scoring.
//!
//! A node is scored as
//!
//! ```text
//! w_util * (1 - utilization) + w_warm * warm - w_latency * latency_penalty - w_cost * cost
//! ```
//!
//! where every component lies in `[0, 1]`:
//! - **utilization**: busy fraction of the capacity behind the slot kind (unknown = 0.5)
//! - **warm**: 1 if the task's preferred model is warm on the node
//! - **latency_penalty**: declared latency over the latency budget, clamped
//! - **cost**: declared cost over the highest cost among the candidates

use std::cmp::Ordering;

use serde::Serialize;

use routegrid_core::*;
use routegrid_state::{NodeView, WarmView};

use crate::decision::RejectReason;

/// Utilization assumed when telemetry has not reported it.
const UNKNOWN_UTILIZATION: f64 = 0.5;

/// Individual score components for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub utilization: f64,
    pub warm: f64,
    pub latency_penalty: f64,
    pub cost: f64,
}

/// A node that passed the filter, with its score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub node_id: NodeId,
    pub slot: SlotKind,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
    pub queue_depth: u32,
    pub warm: bool,
    pub stale: bool,
}

impl ScoredCandidate {
    /// Best first: higher score, then fewer running tasks, then lower id.
    pub fn rank(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| self.queue_depth.cmp(&other.queue_depth))
            .then_with(|| self.node_id.cmp(&other.node_id))
    }
}

/// Check whether `view` can take `task` right now.
///
/// Constraints that hold regardless of load are checked first, so the
/// returned reason tells incapable nodes apart from busy ones. Staleness
/// is left to the caller. On success returns the slot kind the task
/// would occupy.
pub fn check_node(view: &NodeView, task: &TaskSpec) -> Result<SlotKind, RejectReason> {
    let spec = &view.spec;
    let constraints = &task.constraints;

    if constraints.excluded_nodes.contains(&spec.id) {
        return Err(RejectReason::ExcludedByTask);
    }
    if !spec.advertises(&task.capabilities) {
        let missing = task
            .capabilities
            .difference(&spec.capabilities)
            .cloned()
            .collect();
        return Err(RejectReason::MissingCapabilities { missing });
    }
    let Some(kind) = view.resolve_slot(constraints.slot) else {
        return Err(RejectReason::NoSlotKind {
            requested: constraints.slot,
        });
    };
    if let Some(required) = constraints.min_accelerator_memory_bytes {
        let largest = spec.max_accelerator_memory();
        if largest.is_none_or(|m| m < required) {
            return Err(RejectReason::AcceleratorMemoryTooSmall { required, largest });
        }
    }
    if let (Some(max), Some(latency)) = (constraints.max_latency_ms, spec.latency_ms) {
        if latency > max {
            return Err(RejectReason::LatencyTooHigh {
                latency_ms: latency,
                max_latency_ms: max,
            });
        }
    }

    if !spec.power_state.is_available() {
        return Err(RejectReason::PoweredDown {
            state: spec.power_state,
        });
    }
    if !view.has_free(kind) {
        return Err(RejectReason::NoFreeSlot { kind });
    }
    if let Some(required) = constraints.required_memory_bytes {
        let free = view.free_memory(kind);
        if free.is_none_or(|f| f < required) {
            return Err(RejectReason::InsufficientMemory { required, free });
        }
    }
    Ok(kind)
}

/// Score filtered candidates and sort them best first.
pub fn score_candidates(
    candidates: &[(&NodeView, SlotKind)],
    task: &TaskSpec,
    warm: &WarmView,
    weights: &RoutingWeights,
    latency_budget_ms: f64,
) -> Vec<ScoredCandidate> {
    let max_cost = candidates
        .iter()
        .filter_map(|(v, _)| v.spec.cost_per_hour)
        .fold(0.0_f64, f64::max);

    let mut scored: Vec<ScoredCandidate> = candidates
        .iter()
        .map(|(view, slot)| {
            let is_warm = task
                .preferred_model
                .as_deref()
                .is_some_and(|m| warm.is_warm(view.id(), m));
            let breakdown = ScoreBreakdown {
                utilization: view.utilization(*slot).unwrap_or(UNKNOWN_UTILIZATION),
                warm: if is_warm { 1.0 } else { 0.0 },
                latency_penalty: latency_penalty(view.spec.latency_ms, latency_budget_ms),
                cost: match view.spec.cost_per_hour {
                    Some(cost) if max_cost > 0.0 => cost / max_cost,
                    _ => 0.0,
                },
            };
            ScoredCandidate {
                node_id: view.spec.id.clone(),
                slot: *slot,
                score: combine(&breakdown, weights),
                breakdown,
                queue_depth: view.queue_depth(),
                warm: is_warm,
                stale: view.stale,
            }
        })
        .collect();

    scored.sort_by(ScoredCandidate::rank);
    scored
}

fn combine(b: &ScoreBreakdown, w: &RoutingWeights) -> f64 {
    w.utilization * (1.0 - b.utilization) + w.warm * b.warm
        - w.latency * b.latency_penalty
        - w.cost * b.cost
}

fn latency_penalty(latency_ms: Option<u32>, budget_ms: f64) -> f64 {
    match latency_ms {
        Some(l) if budget_ms > 0.0 => (f64::from(l) / budget_ms).clamp(0.0, 1.0),
        Some(l) if l > 0 => 1.0,
        _ => 0.0,
    }
}

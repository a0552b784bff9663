//! The routing agent: filter, score, tie-break, fall back.
//!
//! Routing is a pure function of its inputs. Two calls with the same
//! task, snapshot, warm view and exclusions return the same decision.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use tracing::{debug, warn};

use routegrid_core::*;
use routegrid_state::{ClusterSnapshot, NodeView, WarmView};

use crate::decision::{RejectReason, Rejection, RoutingDecision};
use crate::error::{RoutingError, RoutingResult};
use crate::scorer::{check_node, score_candidates};

/// Picks a target node per task.
#[derive(Debug, Clone)]
pub struct RoutingAgent {
    weights: RoutingWeights,
    fallback_chain: u32,
    allow_degraded: bool,
    latency_budget: Duration,
}

impl Default for RoutingAgent {
    fn default() -> Self {
        Self::new(&RoutingConfig::default())
    }
}

impl RoutingAgent {
    pub fn new(config: &RoutingConfig) -> Self {
        Self {
            weights: config.weights.clone(),
            fallback_chain: config.fallback_chain.max(1),
            allow_degraded: config.allow_degraded,
            latency_budget: config.latency_budget,
        }
    }

    pub fn with_weights(mut self, weights: RoutingWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_degraded_routing(mut self, allow: bool) -> Self {
        self.allow_degraded = allow;
        self
    }

    pub fn weights(&self) -> &RoutingWeights {
        &self.weights
    }

    pub fn fallback_chain(&self) -> u32 {
        self.fallback_chain
    }

    /// Route one task against a snapshot.
    ///
    /// `excluded` names nodes to skip because a reservation on them
    /// already failed for this task.
    #[allow(clippy::too_many_arguments)]
    pub fn route(
        &self,
        task_id: &str,
        task: &TaskSpec,
        snapshot: &ClusterSnapshot,
        warm: &WarmView,
        freshness_floor: u64,
        excluded: &BTreeSet<NodeId>,
        now: Timestamp,
    ) -> RoutingResult<RoutingDecision> {
        if snapshot.version < freshness_floor {
            return Err(RoutingError::StaleSnapshot {
                snapshot: snapshot.version,
                floor: freshness_floor,
                rejected: Vec::new(),
            });
        }

        let mut rejected = Vec::new();
        let mut fresh: Vec<(&NodeView, SlotKind)> = Vec::new();
        let mut stale: Vec<(&NodeView, SlotKind)> = Vec::new();
        let mut any_capable = false;

        for view in &snapshot.nodes {
            if excluded.contains(&view.spec.id) {
                any_capable = true;
                rejected.push(Rejection::new(&view.spec.id, RejectReason::ReservationFailed));
                continue;
            }
            match check_node(view, task) {
                Ok(kind) => {
                    any_capable = true;
                    if view.stale {
                        stale.push((view, kind));
                    } else {
                        fresh.push((view, kind));
                    }
                }
                Err(reason) => {
                    any_capable |= !reason.is_incapable();
                    rejected.push(Rejection::new(&view.spec.id, reason));
                }
            }
        }

        let degraded = fresh.is_empty() && self.allow_degraded && !stale.is_empty();
        let pool = if degraded {
            warn!(task = %task_id, candidates = stale.len(), "no fresh candidate, routing degraded");
            stale
        } else {
            rejected.extend(stale.iter().map(|(view, _)| {
                Rejection::new(
                    &view.spec.id,
                    RejectReason::Stale {
                        last_seen: view.last_seen,
                    },
                )
            }));
            fresh
        };

        if pool.is_empty() {
            return Err(if any_capable {
                RoutingError::AllCandidatesBusy { rejected }
            } else {
                RoutingError::NoCapableNode { rejected }
            });
        }

        let budget_ms = task
            .constraints
            .max_latency_ms
            .map(f64::from)
            .unwrap_or(self.latency_budget.as_millis() as f64);
        let mut scored = score_candidates(&pool, task, warm, &self.weights, budget_ms);

        if task.constraints.require_warm_model && scored.iter().any(|c| c.warm) {
            scored.retain(|c| {
                if !c.warm {
                    rejected.push(Rejection::new(&c.node_id, RejectReason::ColdModel));
                }
                c.warm
            });
        }

        let chosen_idx = task
            .constraints
            .preferred_node
            .as_deref()
            .and_then(|preferred| scored.iter().position(|c| c.node_id == preferred))
            .unwrap_or(0);
        let chosen = scored.swap_remove(chosen_idx);

        debug!(
            task = %task_id,
            node = %chosen.node_id,
            score = chosen.score,
            slot = %chosen.slot,
            warm = chosen.warm,
            degraded,
            rejected = rejected.len(),
            "routing decision"
        );

        Ok(RoutingDecision {
            task_id: task_id.to_string(),
            node_id: chosen.node_id,
            score: chosen.score,
            slot: chosen.slot,
            breakdown: chosen.breakdown,
            rejected,
            decided_at: now,
            snapshot_version: snapshot.version,
            degraded,
        })
    }

    /// Route and reserve, excluding each node whose reservation fails and
    /// re-routing up to the fallback chain length.
    ///
    /// Returns the decision together with whatever `reserve` produced.
    #[allow(clippy::too_many_arguments)]
    pub fn route_with_fallback<T, E, F>(
        &self,
        task_id: &str,
        task: &TaskSpec,
        snapshot: &ClusterSnapshot,
        warm: &WarmView,
        freshness_floor: u64,
        now: Timestamp,
        mut reserve: F,
    ) -> RoutingResult<(RoutingDecision, T)>
    where
        F: FnMut(&RoutingDecision) -> Result<T, E>,
        E: fmt::Display,
    {
        let mut excluded = BTreeSet::new();
        let mut last_rejected = Vec::new();

        for attempt in 0..self.fallback_chain {
            let decision = self.route(task_id, task, snapshot, warm, freshness_floor, &excluded, now)?;
            match reserve(&decision) {
                Ok(reservation) => return Ok((decision, reservation)),
                Err(err) => {
                    debug!(
                        task = %task_id,
                        node = %decision.node_id,
                        attempt,
                        error = %err,
                        "reservation failed, falling back"
                    );
                    excluded.insert(decision.node_id.clone());
                    last_rejected = decision.rejected;
                    last_rejected.push(Rejection::new(decision.node_id, RejectReason::ReservationFailed));
                }
            }
        }

        Err(RoutingError::AllCandidatesBusy {
            rejected: last_rejected,
        })
    }
}

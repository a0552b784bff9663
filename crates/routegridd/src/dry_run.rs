//! Execution adapter that runs nothing.
//!
//! Accepts every dispatch, waits a fixed delay, then reports success with
//! a small JSON receipt. A task asking for a model reports that model as
//! loaded first, so warm-state affinity behaves as it would on a real node.

use std::time::Duration;

use tracing::{debug, info};

use routegrid_core::NodeSpec;
use routegrid_scheduler::{AdapterFuture, DispatchAck, DispatchRequest, ExecutionAdapter};

/// Footprint reported for models loaded by a dry run.
const DRY_RUN_MODEL_FOOTPRINT: u64 = 1 << 30;

pub struct DryRunAdapter {
    delay: Duration,
}

impl DryRunAdapter {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl ExecutionAdapter for DryRunAdapter {
    fn name(&self) -> &str {
        "dry-run"
    }

    fn dispatch(&self, request: DispatchRequest) -> AdapterFuture<'_, DispatchAck> {
        let delay = self.delay;
        Box::pin(async move {
            let DispatchRequest {
                task_id,
                attempt,
                spec,
                node,
                slot,
                reporter,
            } = request;
            info!(task = %task_id, node = %node.id, slot = %slot.kind, attempt, "dry run accepted");

            tokio::spawn(async move {
                if let Some(model) = &spec.preferred_model {
                    reporter.model_loaded(&node.id, model, DRY_RUN_MODEL_FOOTPRINT);
                }
                tokio::time::sleep(delay).await;
                reporter.completed(
                    &task_id,
                    attempt,
                    serde_json::json!({
                        "node": node.id,
                        "slot": slot.kind.to_string(),
                        "index": slot.index,
                        "kind": spec.kind,
                    }),
                );
            });
            DispatchAck::Accepted
        })
    }

    fn cancel<'a>(&'a self, task_id: &'a str, node: &'a NodeSpec) -> AdapterFuture<'a, bool> {
        Box::pin(async move {
            debug!(task = %task_id, node = %node.id, "dry run cancelled");
            true
        })
    }
}

//! Liveness reports for nodes driven by the dry-run adapter.
//!
//! No telemetry driver runs alongside the daemon, so without this loop
//! every node would go stale one staleness window after startup.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use routegrid_core::{NodeId, NodeMetrics};
use routegrid_scheduler::{EngineHandle, SchedulerError};
use routegrid_state::TelemetryUpdate;

/// Floor for the heartbeat period.
const MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Period that keeps a node fresh: three reports per staleness window.
pub fn heartbeat_interval(staleness_window: Duration) -> Duration {
    (staleness_window / 3).max(MIN_INTERVAL)
}

/// Report every node in `node_ids` as alive once per `interval` until
/// `shutdown` fires or the engine stops.
pub async fn run_heartbeat(
    handle: EngineHandle,
    node_ids: Vec<NodeId>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(nodes = node_ids.len(), ?interval, "heartbeat loop started");
    let mut version = 0u64;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                version += 1;
                for node_id in &node_ids {
                    let update = TelemetryUpdate {
                        node_id: node_id.clone(),
                        version,
                        metrics: NodeMetrics::default(),
                    };
                    match handle.ingest_telemetry(update).await {
                        Ok(outcome) => debug!(node = %node_id, version, ?outcome, "heartbeat sent"),
                        Err(SchedulerError::Shutdown) => {
                            debug!("engine stopped, heartbeat loop exiting");
                            return;
                        }
                        Err(e) => warn!(node = %node_id, error = %e, "heartbeat failed"),
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("heartbeat loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use routegrid_core::{EngineConfig, NodeSpec};
    use routegrid_scheduler::{AdapterSet, Engine};
    use routegrid_state::{ClusterState, WarmStateTracker};

    use super::*;
    use crate::dry_run::DryRunAdapter;

    #[test]
    fn interval_is_a_third_of_the_window() {
        assert_eq!(heartbeat_interval(Duration::from_secs(30)), Duration::from_secs(10));
        assert_eq!(heartbeat_interval(Duration::from_millis(90)), MIN_INTERVAL);
    }

    #[tokio::test]
    async fn nodes_stay_fresh_past_the_staleness_window() {
        let window = Duration::from_millis(300);
        let cluster = Arc::new(ClusterState::new().with_staleness_window(window));
        let (handle, engine) = Engine::start(
            &EngineConfig::default(),
            cluster,
            Arc::new(WarmStateTracker::new()),
            AdapterSet::new(Arc::new(DryRunAdapter::new(Duration::from_millis(10)))),
        );
        handle
            .register_node(NodeSpec::new("cpu-1", "10.0.0.5").with_capabilities(["batch"]))
            .await
            .unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let beats = tokio::spawn(run_heartbeat(
            handle.clone(),
            vec!["cpu-1".to_string()],
            heartbeat_interval(window),
            stop_rx,
        ));

        tokio::time::sleep(window * 3).await;
        let view = handle.cluster_snapshot().node("cpu-1").cloned().unwrap();
        assert!(!view.stale);
        assert!(view.telemetry_version >= 2);

        stop_tx.send(true).unwrap();
        beats.await.unwrap();
        handle.shutdown();
        engine.await.unwrap();
    }
}

//! Engine: the async coordinator that owns the scheduler.
//!
//! One tokio task holds the [`Scheduler`] and is its only writer. Client
//! calls arrive as requests over a bounded channel, adapter outcomes as
//! [`ExecutionEvent`]s over an unbounded one, and a ticker drives
//! timeouts. After every wake-up the engine runs a dispatch pass and
//! hands the resulting actions to adapters on spawned tasks, so a slow
//! node never stalls the loop.
//!
//! [`EngineHandle`] is the cloneable client side. Telemetry and snapshot
//! reads bypass the loop and go straight to the shared cluster state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use routegrid_core::*;
use routegrid_placement::RoutingDecision;
use routegrid_state::{
    ApplyOutcome, ClusterSnapshot, ClusterState, NodeUpdate, TelemetryUpdate,
    WarmStateTracker,
};

use crate::adapter::{AdapterSet, DispatchRequest, ExecutionEvent, ResultReporter};
use crate::error::{SchedulerError, SchedulerResult};
use crate::scheduler::{Action, Scheduler};
use crate::task::Task;

type Reply<T> = oneshot::Sender<T>;

enum Request {
    Submit {
        spec: TaskSpec,
        reply: Reply<SchedulerResult<TaskId>>,
    },
    Cancel {
        task_id: TaskId,
        reply: Reply<SchedulerResult<()>>,
    },
    Task {
        task_id: TaskId,
        reply: Reply<Option<Task>>,
    },
    Tasks {
        reply: Reply<Vec<Task>>,
    },
    Decisions {
        limit: usize,
        reply: Reply<Vec<RoutingDecision>>,
    },
    QueueDepth {
        reply: Reply<usize>,
    },
    RegisterNode {
        spec: NodeSpec,
        reply: Reply<SchedulerResult<()>>,
    },
    UpdateNode {
        node_id: NodeId,
        update: NodeUpdate,
        reply: Reply<SchedulerResult<()>>,
    },
    DeregisterNode {
        node_id: NodeId,
        reply: Reply<SchedulerResult<()>>,
    },
    Telemetry {
        update: TelemetryUpdate,
        reply: Reply<SchedulerResult<ApplyOutcome>>,
    },
}

pub struct Engine {
    scheduler: Scheduler,
    adapters: AdapterSet,
    requests: mpsc::Receiver<Request>,
    events_tx: mpsc::UnboundedSender<ExecutionEvent>,
    events_rx: mpsc::UnboundedReceiver<ExecutionEvent>,
    shutdown: watch::Receiver<bool>,
    tick_interval: Duration,
}

impl Engine {
    /// Build an engine and its handle. Nothing runs until [`Engine::run`]
    /// is awaited or [`Engine::spawn`] is called.
    pub fn new(
        config: &EngineConfig,
        cluster: Arc<ClusterState>,
        warm: Arc<WarmStateTracker>,
        adapters: AdapterSet,
    ) -> (Self, EngineHandle) {
        let (requests_tx, requests) = mpsc::channel(config.scheduler.request_buffer.max(1));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown) = watch::channel(false);

        let handle = EngineHandle {
            requests: requests_tx,
            events: events_tx.clone(),
            cluster: cluster.clone(),
            shutdown: Arc::new(shutdown_tx),
        };
        let engine = Self {
            scheduler: Scheduler::new(config, cluster, warm),
            adapters,
            requests,
            events_tx,
            events_rx,
            shutdown,
            tick_interval: config.scheduler.tick_interval,
        };
        (engine, handle)
    }

    /// Build an engine and run it on a background task.
    pub fn start(
        config: &EngineConfig,
        cluster: Arc<ClusterState>,
        warm: Arc<WarmStateTracker>,
        adapters: AdapterSet,
    ) -> (EngineHandle, JoinHandle<()>) {
        let (engine, handle) = Self::new(config, cluster, warm, adapters);
        (handle, engine.spawn())
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until shutdown is signalled or every handle is dropped.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(tick_ms = self.tick_interval.as_millis() as u64, "scheduler engine started");

        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.handle_request(request),
                    None => {
                        info!("all engine handles dropped, stopping");
                        break;
                    }
                },
                Some(event) = self.events_rx.recv() => {
                    let actions = self.scheduler.handle_event(event, epoch_millis());
                    self.execute(actions);
                }
                _ = ticker.tick() => {
                    let actions = self.scheduler.tick(epoch_millis());
                    self.execute(actions);
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }

            let actions = self.scheduler.run_pass(epoch_millis());
            self.execute(actions);
        }
    }

    fn handle_request(&mut self, request: Request) {
        let now = epoch_millis();
        // A dropped reply receiver means the caller gave up waiting.
        match request {
            Request::Submit { spec, reply } => {
                let _ = reply.send(self.scheduler.submit(spec, now));
            }
            Request::Cancel { task_id, reply } => {
                let result = self.scheduler.cancel(&task_id, now).map(|actions| self.execute(actions));
                let _ = reply.send(result);
            }
            Request::Task { task_id, reply } => {
                let _ = reply.send(self.scheduler.task(&task_id).cloned());
            }
            Request::Tasks { reply } => {
                let _ = reply.send(self.scheduler.tasks().into_iter().cloned().collect());
            }
            Request::Decisions { limit, reply } => {
                let _ = reply.send(self.scheduler.decisions(limit));
            }
            Request::QueueDepth { reply } => {
                let _ = reply.send(self.scheduler.queue_depth());
            }
            Request::RegisterNode { spec, reply } => {
                let _ = reply.send(self.scheduler.register_node(spec, now));
            }
            Request::UpdateNode {
                node_id,
                update,
                reply,
            } => {
                let _ = reply.send(self.scheduler.update_node(&node_id, update, now));
            }
            Request::DeregisterNode { node_id, reply } => {
                let result = self
                    .scheduler
                    .deregister_node(&node_id, now)
                    .map(|actions| self.execute(actions));
                let _ = reply.send(result);
            }
            Request::Telemetry { update, reply } => {
                let _ = reply.send(self.scheduler.ingest_telemetry(update, now));
            }
        }
    }

    /// Hand actions to their adapters. Outcomes come back as events.
    fn execute(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Dispatch {
                    task_id,
                    attempt,
                    spec,
                    node,
                    slot,
                } => {
                    let adapter = self.adapters.for_node(&node);
                    let reporter = ResultReporter::new(self.events_tx.clone());
                    debug!(task = %task_id, node = %node.id, adapter = adapter.name(), attempt, "dispatching");
                    tokio::spawn(async move {
                        let request = DispatchRequest {
                            task_id: task_id.clone(),
                            attempt,
                            spec,
                            node,
                            slot,
                            reporter: reporter.clone(),
                        };
                        let ack = adapter.dispatch(request).await;
                        reporter.send(ExecutionEvent::DispatchAck {
                            task_id,
                            attempt,
                            ack,
                        });
                    });
                }
                Action::Cancel {
                    task_id,
                    attempt,
                    node,
                } => {
                    let adapter = self.adapters.for_node(&node);
                    let reporter = ResultReporter::new(self.events_tx.clone());
                    debug!(task = %task_id, node = %node.id, adapter = adapter.name(), attempt, "cancelling");
                    tokio::spawn(async move {
                        let acknowledged = adapter.cancel(&task_id, &node).await;
                        if !acknowledged {
                            warn!(task = %task_id, node = %node.id, "adapter did not confirm cancellation");
                        }
                        reporter.send(ExecutionEvent::CancelSettled {
                            task_id,
                            attempt,
                            acknowledged,
                        });
                    });
                }
            }
        }
    }
}

/// Cloneable client for a running [`Engine`].
#[derive(Clone)]
pub struct EngineHandle {
    requests: mpsc::Sender<Request>,
    events: mpsc::UnboundedSender<ExecutionEvent>,
    cluster: Arc<ClusterState>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl EngineHandle {
    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Request) -> SchedulerResult<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(build(tx))
            .await
            .map_err(|_| SchedulerError::Shutdown)?;
        rx.await.map_err(|_| SchedulerError::Shutdown)
    }

    /// Submit a task; returns its id once admitted.
    pub async fn submit(&self, spec: TaskSpec) -> SchedulerResult<TaskId> {
        self.call(|reply| Request::Submit { spec, reply }).await?
    }

    pub async fn cancel(&self, task_id: &str) -> SchedulerResult<()> {
        let task_id = task_id.to_string();
        self.call(|reply| Request::Cancel { task_id, reply }).await?
    }

    pub async fn task(&self, task_id: &str) -> SchedulerResult<Option<Task>> {
        let task_id = task_id.to_string();
        self.call(|reply| Request::Task { task_id, reply }).await
    }

    pub async fn tasks(&self) -> SchedulerResult<Vec<Task>> {
        self.call(|reply| Request::Tasks { reply }).await
    }

    /// Most recent routing decisions, newest first.
    pub async fn decisions(&self, limit: usize) -> SchedulerResult<Vec<RoutingDecision>> {
        self.call(|reply| Request::Decisions { limit, reply }).await
    }

    pub async fn queue_depth(&self) -> SchedulerResult<usize> {
        self.call(|reply| Request::QueueDepth { reply }).await
    }

    pub async fn register_node(&self, spec: NodeSpec) -> SchedulerResult<()> {
        self.call(|reply| Request::RegisterNode { spec, reply }).await?
    }

    pub async fn update_node(&self, node_id: &str, update: NodeUpdate) -> SchedulerResult<()> {
        let node_id = node_id.to_string();
        self.call(|reply| Request::UpdateNode {
            node_id,
            update,
            reply,
        })
        .await?
    }

    pub async fn deregister_node(&self, node_id: &str) -> SchedulerResult<()> {
        let node_id = node_id.to_string();
        self.call(|reply| Request::DeregisterNode { node_id, reply }).await?
    }

    /// Apply a telemetry report. Goes through the engine loop so a node
    /// coming back wakes held tasks before the next dispatch pass.
    pub async fn ingest_telemetry(&self, update: TelemetryUpdate) -> SchedulerResult<ApplyOutcome> {
        self.call(|reply| Request::Telemetry { update, reply }).await?
    }

    pub fn cluster_snapshot(&self) -> ClusterSnapshot {
        self.cluster.snapshot(epoch_millis())
    }

    /// Reporter for events that do not belong to a dispatch, such as
    /// models loaded out of band.
    pub fn reporter(&self) -> ResultReporter {
        ResultReporter::new(self.events.clone())
    }

    /// Ask the engine loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterFuture, DispatchAck, ExecutionAdapter};
    use crate::task::TaskState;

    /// Accepts every dispatch and completes it with the node id.
    struct Echo;

    impl ExecutionAdapter for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn dispatch(&self, request: DispatchRequest) -> AdapterFuture<'_, DispatchAck> {
            Box::pin(async move {
                request.reporter.completed(
                    &request.task_id,
                    request.attempt,
                    serde_json::json!({ "node": request.node.id }),
                );
                DispatchAck::Accepted
            })
        }

        fn cancel<'a>(&'a self, _task_id: &'a str, _node: &'a NodeSpec) -> AdapterFuture<'a, bool> {
            Box::pin(async { true })
        }
    }

    fn engine() -> (EngineHandle, JoinHandle<()>) {
        let mut config = EngineConfig::default();
        config.scheduler.tick_interval = Duration::from_millis(10);
        Engine::start(
            &config,
            Arc::new(ClusterState::new()),
            Arc::new(WarmStateTracker::new()),
            AdapterSet::new(Arc::new(Echo)),
        )
    }

    async fn wait_terminal(handle: &EngineHandle, id: &str) -> Task {
        for _ in 0..200 {
            let task = handle.task(id).await.unwrap().unwrap();
            if task.state.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {id} never finished");
    }

    #[tokio::test]
    async fn runs_task_to_completion() {
        let (handle, join) = engine();
        handle
            .register_node(NodeSpec::new("cpu-1", "10.0.0.5").with_capabilities(["batch"]))
            .await
            .unwrap();

        let id = handle.submit(TaskSpec::new(["batch"])).await.unwrap();
        let task = wait_terminal(&handle, &id).await;
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.result, Some(serde_json::json!({ "node": "cpu-1" })));
        assert_eq!(handle.decisions(10).await.unwrap().len(), 1);

        handle.shutdown();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn calls_after_shutdown_fail() {
        let (handle, join) = engine();
        handle.shutdown();
        join.await.unwrap();
        assert_eq!(
            handle.submit(TaskSpec::new(["batch"])).await.unwrap_err(),
            SchedulerError::Shutdown
        );
    }

    #[tokio::test]
    async fn cancelling_unknown_task_errors() {
        let (handle, _join) = engine();
        assert_eq!(
            handle.cancel("task-99").await.unwrap_err(),
            SchedulerError::UnknownTask("task-99".to_string())
        );
    }

    #[tokio::test]
    async fn telemetry_goes_through_the_engine() {
        let (handle, join) = engine();
        handle
            .register_node(NodeSpec::new("cpu-1", "10.0.0.5").with_capabilities(["batch"]))
            .await
            .unwrap();

        let update = TelemetryUpdate {
            node_id: "cpu-1".to_string(),
            version: 1,
            metrics: NodeMetrics {
                cpu: Some(0.25),
                ..Default::default()
            },
        };
        assert_eq!(handle.ingest_telemetry(update.clone()).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(handle.ingest_telemetry(update).await.unwrap(), ApplyOutcome::Discarded);

        let snapshot = handle.cluster_snapshot();
        assert_eq!(snapshot.node("cpu-1").unwrap().metrics.cpu, Some(0.25));

        handle.shutdown();
        join.await.unwrap();
    }
}

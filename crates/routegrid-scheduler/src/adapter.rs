//! Execution adapter interface.
//!
//! An adapter knows how to start and stop a task on a node through one
//! execution strategy (container, VM, SSH, HTTP). The scheduler never
//! waits on an adapter: dispatch and cancel run on spawned tasks and
//! their outcomes come back as [`ExecutionEvent`]s through the
//! coordinator's event stream. Terminal results are pushed later through
//! the [`ResultReporter`] handed over with each dispatch.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::trace;

use routegrid_core::*;
use routegrid_state::SlotAssignment;

/// Boxed future returned by adapter operations.
pub type AdapterFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Everything an adapter needs to start one task attempt.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub task_id: TaskId,
    /// Must be echoed back on every result for this run.
    pub attempt: u32,
    pub spec: TaskSpec,
    pub node: NodeSpec,
    pub slot: SlotAssignment,
    pub reporter: ResultReporter,
}

/// The adapter's answer to a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchAck {
    Accepted,
    Rejected(String),
}

/// Starts and stops tasks on nodes.
pub trait ExecutionAdapter: Send + Sync {
    /// Strategy name, matched against `NodeSpec::executor`.
    fn name(&self) -> &str;

    /// Hand a task to the node. Resolves once the node accepted or refused
    /// it, not when the task finishes.
    fn dispatch(&self, request: DispatchRequest) -> AdapterFuture<'_, DispatchAck>;

    /// Ask the node to abort a task. Resolves to `true` once the abort is
    /// confirmed; `false` leaves the scheduler to wait out its grace period.
    fn cancel<'a>(&'a self, task_id: &'a str, node: &'a NodeSpec) -> AdapterFuture<'a, bool>;
}

/// Adapters keyed by strategy name, with a fallback for nodes that name
/// none or an unknown one.
#[derive(Clone)]
pub struct AdapterSet {
    by_name: HashMap<String, Arc<dyn ExecutionAdapter>>,
    default: Arc<dyn ExecutionAdapter>,
}

impl AdapterSet {
    pub fn new(default: Arc<dyn ExecutionAdapter>) -> Self {
        Self {
            by_name: HashMap::new(),
            default,
        }
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn ExecutionAdapter>) -> Self {
        self.by_name.insert(adapter.name().to_string(), adapter);
        self
    }

    /// The adapter for a node's declared executor.
    pub fn for_node(&self, node: &NodeSpec) -> Arc<dyn ExecutionAdapter> {
        node.executor
            .as_deref()
            .and_then(|name| self.by_name.get(name))
            .unwrap_or(&self.default)
            .clone()
    }
}

/// Something that happened outside the coordinator and must be applied
/// to scheduler state.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    DispatchAck {
        task_id: TaskId,
        attempt: u32,
        ack: DispatchAck,
    },
    Completed {
        task_id: TaskId,
        attempt: u32,
        output: serde_json::Value,
    },
    Failed {
        task_id: TaskId,
        attempt: u32,
        error: String,
    },
    CancelSettled {
        task_id: TaskId,
        attempt: u32,
        acknowledged: bool,
    },
    ModelLoaded {
        node_id: NodeId,
        model: ModelId,
        footprint_bytes: u64,
    },
    ModelUnloaded {
        node_id: NodeId,
        model: ModelId,
    },
}

/// Handle adapters use to report results back to the coordinator.
#[derive(Debug, Clone)]
pub struct ResultReporter {
    tx: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ResultReporter {
    pub fn new(tx: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
        Self { tx }
    }

    pub fn completed(&self, task_id: &str, attempt: u32, output: serde_json::Value) {
        self.send(ExecutionEvent::Completed {
            task_id: task_id.to_string(),
            attempt,
            output,
        });
    }

    pub fn failed(&self, task_id: &str, attempt: u32, error: impl Into<String>) {
        self.send(ExecutionEvent::Failed {
            task_id: task_id.to_string(),
            attempt,
            error: error.into(),
        });
    }

    pub fn model_loaded(&self, node_id: &str, model: &str, footprint_bytes: u64) {
        self.send(ExecutionEvent::ModelLoaded {
            node_id: node_id.to_string(),
            model: model.to_string(),
            footprint_bytes,
        });
    }

    pub fn model_unloaded(&self, node_id: &str, model: &str) {
        self.send(ExecutionEvent::ModelUnloaded {
            node_id: node_id.to_string(),
            model: model.to_string(),
        });
    }

    pub(crate) fn send(&self, event: ExecutionEvent) {
        if self.tx.send(event).is_err() {
            trace!("engine gone, dropping execution event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl ExecutionAdapter for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn dispatch(&self, _request: DispatchRequest) -> AdapterFuture<'_, DispatchAck> {
            Box::pin(async { DispatchAck::Accepted })
        }

        fn cancel<'a>(&'a self, _task_id: &'a str, _node: &'a NodeSpec) -> AdapterFuture<'a, bool> {
            Box::pin(async { true })
        }
    }

    #[test]
    fn selects_adapter_by_executor() {
        let set = AdapterSet::new(Arc::new(Named("default"))).with_adapter(Arc::new(Named("ssh")));

        let mut node = NodeSpec::new("a", "h");
        assert_eq!(set.for_node(&node).name(), "default");

        node.executor = Some("ssh".to_string());
        assert_eq!(set.for_node(&node).name(), "ssh");

        node.executor = Some("vm".to_string());
        assert_eq!(set.for_node(&node).name(), "default");
    }

    #[tokio::test]
    async fn reporter_forwards_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reporter = ResultReporter::new(tx);
        reporter.completed("t1", 2, serde_json::json!({"tokens": 3}));
        reporter.model_loaded("a", "m1", 10);

        assert!(matches!(
            rx.recv().await,
            Some(ExecutionEvent::Completed { attempt: 2, .. })
        ));
        assert!(matches!(rx.recv().await, Some(ExecutionEvent::ModelLoaded { .. })));
    }
}

//! Scheduler error types.

use routegrid_core::TaskId;
use routegrid_placement::RoutingError;
use routegrid_state::StateError;
use thiserror::Error;

/// Errors returned synchronously by scheduler and engine operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchedulerError {
    #[error("task queue is full ({capacity} tasks)")]
    QueueFull { capacity: usize },

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("task {task} already finished ({state})")]
    TaskFinished { task: TaskId, state: &'static str },

    #[error("task {task}: illegal transition {from} -> {to}")]
    InvalidTransition {
        task: TaskId,
        from: &'static str,
        to: &'static str,
    },

    #[error("preemption target {0} is no longer executing")]
    PreemptionConflict(TaskId),

    #[error("scheduling engine has shut down")]
    Shutdown,

    #[error("cluster state error: {0}")]
    State(#[from] StateError),

    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

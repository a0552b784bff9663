//! routegrid-scheduler: task lifecycle, queueing, preemption and dispatch.
//!
//! ```text
//!  EngineHandle ──requests──►┌──────────────────────────┐
//!                            │ Engine (one tokio task)  │
//!  adapters ─────events─────►│   Scheduler              │──actions──► adapters
//!                            │   ├─ TaskQueue           │   (spawned)
//!  ticker ───────────────────►   ├─ RoutingAgent        │
//!                            │   └─ DecisionLog         │
//!                            └────────────┬─────────────┘
//!                                         │ snapshot / reserve / release
//!                                  ClusterState + WarmStateTracker
//! ```
//!
//! # Components
//!
//! - **`scheduler`**: synchronous core; every operation takes `now`
//! - **`engine`**: async coordinator and its cloneable handle
//! - **`task`**: task records and the state machine
//! - **`queue`**: priority-ordered, FIFO-within-priority queue
//! - **`adapter`**: the execution adapter interface and result reporting
//! - **`backoff`**: retry delays for tasks that found every node busy
//! - **`history`**: bounded log of routing decisions

pub mod adapter;
pub mod backoff;
pub mod engine;
pub mod error;
pub mod history;
pub mod queue;
pub mod scheduler;
pub mod task;

pub use adapter::{
    AdapterFuture, AdapterSet, DispatchAck, DispatchRequest, ExecutionAdapter, ExecutionEvent,
    ResultReporter,
};
pub use backoff::Backoff;
pub use engine::{Engine, EngineHandle};
pub use error::{SchedulerError, SchedulerResult};
pub use history::DecisionLog;
pub use queue::TaskQueue;
pub use scheduler::{Action, Scheduler};
pub use task::{CancelCause, FailureReason, PendingCancel, Task, TaskState, Transition};

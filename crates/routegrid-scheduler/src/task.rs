//! Task records and the task state machine.
//!
//! ```text
//! Submitted ─► Queued ─► Routed ─► Executing ─► Completed | Failed
//!                ▲  ▲       │          │
//!                │  └───────┘          ▼
//!                └───────────────── Preempted
//!
//! any non-terminal state ─► Cancelled
//! ```
//!
//! `Routed ─► Queued` happens when the adapter rejects a dispatch. The
//! scheduler is the only writer; every change goes through
//! [`Task::transition`], which refuses anything not in the table above.

use std::fmt;

use serde::Serialize;

use routegrid_core::*;
use routegrid_state::SlotAssignment;

use crate::error::{SchedulerError, SchedulerResult};

/// Why a task ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    NoCapableNode,
    Timeout,
    DeadlineExceeded,
    ExecutionFailure(String),
    RetriesExhausted,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NoCapableNode => f.write_str("no capable node"),
            FailureReason::Timeout => f.write_str("timeout"),
            FailureReason::DeadlineExceeded => f.write_str("deadline exceeded"),
            FailureReason::ExecutionFailure(err) => write!(f, "execution failure: {err}"),
            FailureReason::RetriesExhausted => f.write_str("retries exhausted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum TaskState {
    Submitted,
    Queued,
    Routed,
    Executing,
    Completed,
    Failed(FailureReason),
    Cancelled,
    Preempted,
}

impl TaskState {
    pub fn name(&self) -> &'static str {
        match self {
            TaskState::Submitted => "submitted",
            TaskState::Queued => "queued",
            TaskState::Routed => "routed",
            TaskState::Executing => "executing",
            TaskState::Completed => "completed",
            TaskState::Failed(_) => "failed",
            TaskState::Cancelled => "cancelled",
            TaskState::Preempted => "preempted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed(_) | TaskState::Cancelled
        )
    }

    /// Whether the task currently holds (or is acquiring) a slot.
    pub fn is_placed(&self) -> bool {
        matches!(self, TaskState::Routed | TaskState::Executing)
    }

    pub fn can_transition_to(&self, next: &TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Submitted, Queued | Failed(_) | Cancelled) => true,
            (Queued, Routed | Failed(_) | Cancelled) => true,
            (Routed, Executing | Queued | Failed(_) | Cancelled) => true,
            (Executing, Completed | Failed(_) | Cancelled | Preempted) => true,
            (Preempted, Queued | Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Failed(reason) => write!(f, "failed ({reason})"),
            other => f.write_str(other.name()),
        }
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub from: &'static str,
    pub to: &'static str,
    pub at: Timestamp,
}

/// Who asked for a running task to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelCause {
    User,
    ExecutionTimeout,
}

/// A cancellation sent to the adapter and not yet settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PendingCancel {
    pub cause: CancelCause,
    pub requested_at: Timestamp,
}

/// A task as tracked by the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub spec: TaskSpec,
    pub state: TaskState,
    /// Submission order; the tie-break within a priority band.
    pub seq: u64,
    pub submitted_at: Timestamp,
    /// Last time the task entered `Queued`.
    pub queued_at: Option<Timestamp>,
    pub node_id: Option<NodeId>,
    pub slot: Option<SlotAssignment>,
    /// Preemptions plus rejected dispatches.
    pub retry_count: u32,
    /// Dispatch attempt number; results for older attempts are ignored.
    pub attempt: u32,
    /// Consecutive busy routing outcomes.
    pub busy_streak: u32,
    /// Held by backoff until this time.
    pub not_before: Option<Timestamp>,
    pub routed_at: Option<Timestamp>,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub pending_cancel: Option<PendingCancel>,
    pub transitions: Vec<Transition>,
}

impl Task {
    pub fn new(id: TaskId, spec: TaskSpec, seq: u64, now: Timestamp) -> Self {
        Self {
            id,
            spec,
            state: TaskState::Submitted,
            seq,
            submitted_at: now,
            queued_at: None,
            node_id: None,
            slot: None,
            retry_count: 0,
            attempt: 0,
            busy_streak: 0,
            not_before: None,
            routed_at: None,
            started_at: None,
            completed_at: None,
            result: None,
            last_error: None,
            pending_cancel: None,
            transitions: Vec::new(),
        }
    }

    pub fn priority(&self) -> Priority {
        self.spec.priority
    }

    /// Move to `next`, refusing transitions the state machine does not allow.
    pub fn transition(&mut self, next: TaskState, now: Timestamp) -> SchedulerResult<()> {
        if !self.state.can_transition_to(&next) {
            return Err(SchedulerError::InvalidTransition {
                task: self.id.clone(),
                from: self.state.name(),
                to: next.name(),
            });
        }
        self.transitions.push(Transition {
            from: self.state.name(),
            to: next.name(),
            at: now,
        });
        match next {
            TaskState::Queued => self.queued_at = Some(now),
            TaskState::Routed => {
                // A new attempt has not started yet.
                self.routed_at = Some(now);
                self.started_at = None;
            }
            TaskState::Executing => self.started_at = Some(now),
            _ => {}
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
            self.pending_cancel = None;
            self.not_before = None;
        }
        self.state = next;
        Ok(())
    }

    /// Fail with `reason`, recording `message` as the last error.
    pub fn fail(&mut self, reason: FailureReason, message: impl Into<String>, now: Timestamp) -> SchedulerResult<()> {
        self.last_error = Some(message.into());
        self.transition(TaskState::Failed(reason), now)
    }

    /// Whether backoff currently holds the task.
    pub fn is_held(&self, now: Timestamp) -> bool {
        self.not_before.is_some_and(|t| now < t)
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end.saturating_sub(start)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new("t1".to_string(), TaskSpec::new(["llm-inference"]), 1, 0)
    }

    #[test]
    fn happy_path_transitions() {
        let mut t = task();
        for (i, next) in [
            TaskState::Queued,
            TaskState::Routed,
            TaskState::Executing,
            TaskState::Completed,
        ]
        .into_iter()
        .enumerate()
        {
            t.transition(next, i as u64 * 10).unwrap();
        }
        assert!(t.state.is_terminal());
        assert_eq!(t.duration_ms(), Some(10));
        let path: Vec<_> = t.transitions.iter().map(|tr| tr.to).collect();
        assert_eq!(path, vec!["queued", "routed", "executing", "completed"]);
    }

    #[test]
    fn cannot_skip_states() {
        let mut t = task();
        let err = t.transition(TaskState::Executing, 0).unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::InvalidTransition { from: "submitted", to: "executing", .. }
        ));
        t.transition(TaskState::Queued, 0).unwrap();
        assert!(t.transition(TaskState::Preempted, 0).is_err());
        assert!(t.transition(TaskState::Completed, 0).is_err());
    }

    #[test]
    fn terminal_states_are_final() {
        let mut t = task();
        t.transition(TaskState::Cancelled, 0).unwrap();
        assert!(t.transition(TaskState::Queued, 0).is_err());
        assert!(t.transition(TaskState::Cancelled, 0).is_err());
    }

    #[test]
    fn preemption_path() {
        let mut t = task();
        t.transition(TaskState::Queued, 0).unwrap();
        t.transition(TaskState::Routed, 0).unwrap();
        t.transition(TaskState::Executing, 0).unwrap();
        t.transition(TaskState::Preempted, 5).unwrap();
        t.transition(TaskState::Queued, 5).unwrap();
        assert_eq!(t.queued_at, Some(5));
    }

    #[test]
    fn rerouting_clears_previous_start() {
        let mut t = task();
        t.transition(TaskState::Queued, 0).unwrap();
        t.transition(TaskState::Routed, 0).unwrap();
        t.transition(TaskState::Executing, 1).unwrap();
        t.transition(TaskState::Preempted, 5).unwrap();
        t.transition(TaskState::Queued, 5).unwrap();
        t.transition(TaskState::Routed, 9).unwrap();
        assert_eq!(t.routed_at, Some(9));
        assert_eq!(t.started_at, None);
    }

    #[test]
    fn every_non_terminal_state_can_cancel() {
        for state in [
            TaskState::Submitted,
            TaskState::Queued,
            TaskState::Routed,
            TaskState::Executing,
            TaskState::Preempted,
        ] {
            assert!(state.can_transition_to(&TaskState::Cancelled), "{state}");
        }
    }

    #[test]
    fn fail_records_reason_and_message() {
        let mut t = task();
        t.fail(FailureReason::NoCapableNode, "no node advertises fpga-accel", 3)
            .unwrap();
        assert_eq!(t.state, TaskState::Failed(FailureReason::NoCapableNode));
        assert_eq!(t.last_error.as_deref(), Some("no node advertises fpga-accel"));
        assert_eq!(t.completed_at, Some(3));
    }

    #[test]
    fn held_until_not_before() {
        let mut t = task();
        t.not_before = Some(100);
        assert!(t.is_held(99));
        assert!(!t.is_held(100));
    }
}

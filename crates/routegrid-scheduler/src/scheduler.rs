//! The scheduler core: admission, dispatch passes, preemption, events,
//! timeouts.
//!
//! `Scheduler` is synchronous and takes the current time as an argument,
//! so every decision is reproducible in tests. It never talks to an
//! adapter directly; operations that need the outside world return
//! [`Action`]s for the coordinator to carry out.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use routegrid_core::duration::format_duration;
use routegrid_core::*;
use routegrid_placement::{RoutingAgent, RoutingDecision, RoutingError, check_node};
use routegrid_state::warm::warm_budget;
use routegrid_state::{
    ApplyOutcome, ClusterState, NodeUpdate, SlotAssignment, TelemetryUpdate, WarmStateTracker,
};

use crate::adapter::{DispatchAck, ExecutionEvent};
use crate::backoff::Backoff;
use crate::error::{SchedulerError, SchedulerResult};
use crate::history::DecisionLog;
use crate::queue::TaskQueue;
use crate::task::{CancelCause, FailureReason, PendingCancel, Task, TaskState};

/// Work for the coordinator to hand to an execution adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Dispatch {
        task_id: TaskId,
        attempt: u32,
        spec: TaskSpec,
        node: NodeSpec,
        slot: SlotAssignment,
    },
    Cancel {
        task_id: TaskId,
        attempt: u32,
        node: NodeSpec,
    },
}

pub struct Scheduler {
    config: SchedulerConfig,
    cluster: Arc<ClusterState>,
    warm: Arc<WarmStateTracker>,
    router: RoutingAgent,
    backoff: Backoff,
    tasks: HashMap<TaskId, Task>,
    queue: TaskQueue,
    idempotency: HashMap<String, TaskId>,
    decisions: DecisionLog,
    next_seq: u64,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Scheduler {
    pub fn new(config: &EngineConfig, cluster: Arc<ClusterState>, warm: Arc<WarmStateTracker>) -> Self {
        Self {
            router: RoutingAgent::new(&config.routing),
            backoff: Backoff::from_config(&config.scheduler),
            queue: TaskQueue::new(config.scheduler.queue_capacity),
            decisions: DecisionLog::new(config.scheduler.decision_log_capacity),
            config: config.scheduler.clone(),
            cluster,
            warm,
            tasks: HashMap::new(),
            idempotency: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn cluster(&self) -> &Arc<ClusterState> {
        &self.cluster
    }

    pub fn warm(&self) -> &Arc<WarmStateTracker> {
        &self.warm
    }

    // ── Admission ────────────────────────────────────────────────

    /// Admit a task. Returns its id immediately; routing happens on the
    /// next dispatch pass.
    ///
    /// A task no registered node could ever run is recorded as
    /// `Failed(NoCapableNode)` and its id is still returned.
    pub fn submit(&mut self, spec: TaskSpec, now: Timestamp) -> SchedulerResult<TaskId> {
        if spec.capabilities.is_empty() {
            return Err(SchedulerError::InvalidTask(
                "at least one capability is required".to_string(),
            ));
        }
        if spec.capabilities.iter().any(|c| c.as_str().trim().is_empty()) {
            return Err(SchedulerError::InvalidTask("empty capability tag".to_string()));
        }
        if let Some(key) = &spec.idempotency_key {
            if let Some(existing) = self.idempotency.get(key) {
                debug!(task = %existing, key = %key, "duplicate submission, returning existing task");
                return Ok(existing.clone());
            }
        }
        if self.queue.is_full() {
            warn!(capacity = self.queue.capacity(), "queue full, rejecting submission");
            return Err(SchedulerError::QueueFull {
                capacity: self.queue.capacity(),
            });
        }

        self.next_seq += 1;
        let seq = self.next_seq;
        let id = format!("task-{seq}");
        let mut task = Task::new(id.clone(), spec, seq, now);

        if self.cluster.any_advertises(&task.spec.capabilities) {
            task.transition(TaskState::Queued, now)?;
            self.queue.push(task.priority(), seq, id.clone())?;
            info!(task = %id, priority = %task.priority(), "task queued");
        } else {
            let tags: Vec<&str> = task.spec.capabilities.iter().map(Capability::as_str).collect();
            let message = format!("no registered node advertises [{}]", tags.join(", "));
            warn!(task = %id, %message, "rejected at admission");
            task.fail(FailureReason::NoCapableNode, message, now)?;
        }

        if let Some(key) = &task.spec.idempotency_key {
            self.idempotency.insert(key.clone(), id.clone());
        }
        self.tasks.insert(id.clone(), task);
        Ok(id)
    }

    /// Cancel a task. Queued tasks are cancelled at once; placed tasks get
    /// an abort request and settle on acknowledgement or after the grace
    /// period.
    pub fn cancel(&mut self, task_id: &str, now: Timestamp) -> SchedulerResult<Vec<Action>> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::UnknownTask(task_id.to_string()))?;
        if task.state.is_terminal() {
            return Err(SchedulerError::TaskFinished {
                task: task_id.to_string(),
                state: task.state.name(),
            });
        }

        if !task.state.is_placed() {
            self.queue.remove(task.priority(), task.seq);
            task.transition(TaskState::Cancelled, now)?;
            info!(task = %task_id, "task cancelled before placement");
            return Ok(Vec::new());
        }

        if task.pending_cancel.is_some() {
            return Ok(Vec::new());
        }
        task.pending_cancel = Some(PendingCancel {
            cause: CancelCause::User,
            requested_at: now,
        });
        info!(task = %task_id, state = task.state.name(), "cancellation requested");

        match cancel_action(&self.cluster, task) {
            Some(action) => Ok(vec![action]),
            None => {
                self.settle_cancel(task_id, now);
                Ok(Vec::new())
            }
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────

    /// Try to place every queued task that is not held by backoff, in
    /// queue order.
    ///
    /// A hold only throttles routing attempts; it never lets a later task
    /// take capacity an earlier one could use. Before a later task is
    /// tried, held tasks ahead of it get first claim if they fit now.
    pub fn run_pass(&mut self, now: Timestamp) -> Vec<Action> {
        let queued: Vec<TaskId> = self.queue.iter().cloned().collect();

        let mut actions = Vec::new();
        let mut held: Vec<TaskId> = Vec::new();
        for id in queued {
            let Some(task) = self.tasks.get(&id) else {
                continue;
            };
            if task.is_held(now) {
                held.push(id);
                continue;
            }
            for earlier in std::mem::take(&mut held) {
                if self.fits_now(&earlier, now) {
                    debug!(task = %earlier, "capacity available, releasing hold");
                    self.try_dispatch(&earlier, now, &mut actions);
                }
            }
            self.try_dispatch(&id, now, &mut actions);
        }
        actions
    }

    /// Whether a queued task would route right now, without reserving.
    fn fits_now(&self, task_id: &str, now: Timestamp) -> bool {
        let Some(task) = self.tasks.get(task_id) else {
            return false;
        };
        let snapshot = self.cluster.snapshot(now);
        let warm = self.warm.view(now);
        self.router
            .route(
                task_id,
                &task.spec,
                &snapshot,
                &warm,
                self.cluster.topology_floor(),
                &BTreeSet::new(),
                now,
            )
            .is_ok()
    }

    fn try_dispatch(&mut self, task_id: &str, now: Timestamp, actions: &mut Vec<Action>) {
        let spec = match self.tasks.get(task_id) {
            Some(task) if task.state == TaskState::Queued => task.spec.clone(),
            _ => return,
        };

        let err = match self.place(task_id, &spec, now) {
            Ok((decision, slot)) => {
                self.commit(task_id, decision, slot, now, actions);
                return;
            }
            Err(err) => err,
        };

        if let RoutingError::NoCapableNode { rejected } = &err {
            let summary: Vec<String> = rejected.iter().map(ToString::to_string).collect();
            if let Some(task) = self.tasks.get_mut(task_id) {
                self.queue.remove(task.priority(), task.seq);
                let message = format!("no capable node at dispatch: {}", summary.join("; "));
                warn!(task = %task_id, %message, "task failed");
                if let Err(e) = task.fail(FailureReason::NoCapableNode, message, now) {
                    error!(task = %task_id, error = %e, "failed to record failure");
                }
            }
            return;
        }

        if let Some(victim) = self.find_victim(task_id, &spec, now) {
            let streak = self.tasks.get(task_id).map_or(0, |t| t.busy_streak);
            match self.preempt(&victim, now) {
                Ok(cancel) => {
                    actions.extend(cancel);
                    if let Ok((decision, slot)) = self.place(task_id, &spec, now) {
                        self.commit(task_id, decision, slot, now, actions);
                        return;
                    }
                    // Preemption woke every held task; keep this one's backoff.
                    if let Some(task) = self.tasks.get_mut(task_id) {
                        task.busy_streak = streak;
                    }
                }
                Err(e) => warn!(task = %task_id, victim = %victim, error = %e, "preemption failed"),
            }
        }

        self.mark_busy(task_id, &err, now);
    }

    /// Route and reserve, re-fetching the snapshot when it predates the
    /// last topology change.
    fn place(
        &self,
        task_id: &str,
        spec: &TaskSpec,
        now: Timestamp,
    ) -> Result<(RoutingDecision, SlotAssignment), RoutingError> {
        let mut refetches = 0;
        loop {
            let snapshot = self.cluster.snapshot(now);
            let floor = self.cluster.topology_floor();
            let warm = self.warm.view(now);
            let cluster = &self.cluster;
            let result = self.router.route_with_fallback(
                task_id,
                spec,
                &snapshot,
                &warm,
                floor,
                now,
                |decision| {
                    cluster.reserve(
                        &decision.node_id,
                        decision.slot,
                        task_id,
                        spec.constraints.required_memory_bytes,
                    )
                },
            );
            match result {
                Err(RoutingError::StaleSnapshot { snapshot, floor, .. })
                    if refetches < self.config.stale_snapshot_retries =>
                {
                    refetches += 1;
                    debug!(task = %task_id, snapshot, floor, "stale snapshot, re-fetching");
                }
                other => return other,
            }
        }
    }

    fn commit(
        &mut self,
        task_id: &str,
        decision: RoutingDecision,
        slot: SlotAssignment,
        now: Timestamp,
        actions: &mut Vec<Action>,
    ) {
        let Some(node) = self.cluster.get_node(&decision.node_id) else {
            self.cluster.release(&decision.node_id, task_id);
            return;
        };
        let Some(task) = self.tasks.get_mut(task_id) else {
            self.cluster.release(&decision.node_id, task_id);
            return;
        };
        if let Err(e) = task.transition(TaskState::Routed, now) {
            error!(task = %task_id, error = %e, "cannot route task");
            self.cluster.release(&decision.node_id, task_id);
            return;
        }

        self.queue.remove(task.priority(), task.seq);
        task.node_id = Some(node.id.clone());
        task.slot = Some(slot.clone());
        task.attempt += 1;
        task.busy_streak = 0;
        task.not_before = None;
        if let Some(model) = &task.spec.preferred_model {
            self.warm.touch(&node.id, model, now);
        }

        info!(
            task = %task_id,
            node = %node.id,
            slot = %slot.kind,
            index = ?slot.index,
            score = decision.score,
            attempt = task.attempt,
            "task routed"
        );
        actions.push(Action::Dispatch {
            task_id: task_id.to_string(),
            attempt: task.attempt,
            spec: task.spec.clone(),
            node,
            slot,
        });
        self.decisions.push(decision);
    }

    fn mark_busy(&mut self, task_id: &str, err: &RoutingError, now: Timestamp) {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return;
        };
        task.busy_streak += 1;
        task.last_error = Some(err.to_string());
        if task.busy_streak >= self.config.max_busy_retries {
            let delay = self
                .backoff
                .delay(task.busy_streak - self.config.max_busy_retries);
            task.not_before = Some(now.saturating_add(millis(delay)));
            debug!(
                task = %task_id,
                streak = task.busy_streak,
                delay_ms = millis(delay),
                "all candidates busy, holding task"
            );
        } else {
            trace!(task = %task_id, streak = task.busy_streak, "all candidates busy");
        }
    }

    // ── Preemption ───────────────────────────────────────────────

    /// The running task to evict so `spec` can take its exclusive slot.
    ///
    /// Candidates are preemptible, sit more than `preemption_gap`
    /// priority levels below the task, and hold an exclusive slot on a
    /// fresh node that rejects the task now but would accept it with that
    /// slot released. The lowest priority goes first, then the most
    /// recently submitted.
    fn find_victim(&self, task_id: &str, spec: &TaskSpec, now: Timestamp) -> Option<TaskId> {
        let snapshot = self.cluster.snapshot(now);
        let mut candidates: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Executing && t.pending_cancel.is_none())
            .filter(|t| t.spec.preemptible)
            .filter(|t| spec.priority.gap_over(t.priority()) > self.config.preemption_gap)
            .collect();
        candidates.sort_by_key(|t| (t.priority(), Reverse(t.seq)));

        let victim = candidates.into_iter().find(|t| {
            let Some(SlotAssignment {
                node_id,
                kind: SlotKind::Exclusive,
                index: Some(index),
            }) = &t.slot
            else {
                return false;
            };
            snapshot.node(node_id).is_some_and(|view| {
                !view.stale
                    && check_node(view, spec).is_err()
                    && check_node(&view.without_exclusive(*index), spec) == Ok(SlotKind::Exclusive)
            })
        })?;

        debug!(
            task = %task_id,
            victim = %victim.id,
            victim_priority = %victim.priority(),
            "preemption candidate found"
        );
        Some(victim.id.clone())
    }

    /// Evict a running task: `Executing → Preempted → Queued`. Returns the
    /// abort request for its adapter.
    pub fn preempt(&mut self, victim_id: &str, now: Timestamp) -> SchedulerResult<Vec<Action>> {
        let task = self
            .tasks
            .get_mut(victim_id)
            .ok_or_else(|| SchedulerError::UnknownTask(victim_id.to_string()))?;
        if task.state != TaskState::Executing {
            return Err(SchedulerError::PreemptionConflict(victim_id.to_string()));
        }

        let action = cancel_action(&self.cluster, task);
        task.transition(TaskState::Preempted, now)?;
        release_slot(&self.cluster, task);
        task.retry_count += 1;
        task.node_id = None;
        task.busy_streak = 0;
        task.transition(TaskState::Queued, now)?;
        self.queue.requeue(task.priority(), task.seq, task.id.clone());
        warn!(
            task = %victim_id,
            priority = %task.priority(),
            retries = task.retry_count,
            "task preempted and requeued"
        );

        self.wake_held();
        Ok(action.into_iter().collect())
    }

    // ── Events ───────────────────────────────────────────────────

    /// Apply an adapter-reported event.
    pub fn handle_event(&mut self, event: ExecutionEvent, now: Timestamp) -> Vec<Action> {
        match event {
            ExecutionEvent::DispatchAck {
                task_id,
                attempt,
                ack,
            } => self.on_dispatch_ack(&task_id, attempt, ack, now),
            ExecutionEvent::Completed {
                task_id,
                attempt,
                output,
            } => {
                self.on_completed(&task_id, attempt, output, now);
                Vec::new()
            }
            ExecutionEvent::Failed {
                task_id,
                attempt,
                error,
            } => {
                self.on_failed(&task_id, attempt, error, now);
                Vec::new()
            }
            ExecutionEvent::CancelSettled {
                task_id,
                attempt,
                acknowledged,
            } => {
                if current_attempt(&mut self.tasks, &task_id, attempt).is_some() {
                    if acknowledged {
                        self.settle_cancel(&task_id, now);
                    } else {
                        debug!(task = %task_id, "cancel not acknowledged, waiting for grace period");
                    }
                }
                Vec::new()
            }
            ExecutionEvent::ModelLoaded {
                node_id,
                model,
                footprint_bytes,
            } => {
                self.warm.mark_loaded(&node_id, &model, footprint_bytes, now);
                if let Some(budget) = self.cluster.get_node(&node_id).as_ref().and_then(warm_budget) {
                    self.warm.evict_for_memory(&node_id, budget);
                }
                Vec::new()
            }
            ExecutionEvent::ModelUnloaded { node_id, model } => {
                self.warm.mark_unloaded(&node_id, &model);
                Vec::new()
            }
        }
    }

    fn on_dispatch_ack(&mut self, task_id: &str, attempt: u32, ack: DispatchAck, now: Timestamp) -> Vec<Action> {
        let max_retries = self.config.max_dispatch_retries;
        let Some(task) = current_attempt(&mut self.tasks, task_id, attempt) else {
            return Vec::new();
        };
        if task.state != TaskState::Routed {
            return Vec::new();
        }

        match ack {
            DispatchAck::Accepted => {
                if let Err(e) = task.transition(TaskState::Executing, now) {
                    error!(task = %task_id, error = %e, "cannot start task");
                    return Vec::new();
                }
                info!(task = %task_id, node = ?task.node_id, attempt, "task executing");
                // An abort sent before the node accepted may have been lost.
                if task.pending_cancel.is_some() {
                    return cancel_action(&self.cluster, task).into_iter().collect();
                }
                Vec::new()
            }
            DispatchAck::Rejected(reason) => {
                if task.pending_cancel.is_some() {
                    self.settle_cancel(task_id, now);
                    return Vec::new();
                }
                release_slot(&self.cluster, task);
                task.node_id = None;
                task.retry_count += 1;
                task.last_error = Some(format!("dispatch rejected: {reason}"));
                let result = if task.retry_count > max_retries {
                    warn!(task = %task_id, retries = task.retry_count, %reason, "dispatch retries exhausted");
                    task.transition(TaskState::Failed(FailureReason::RetriesExhausted), now)
                } else {
                    debug!(task = %task_id, retries = task.retry_count, %reason, "dispatch rejected, requeueing");
                    self.queue.requeue(task.priority(), task.seq, task.id.clone());
                    task.transition(TaskState::Queued, now)
                };
                if let Err(e) = result {
                    error!(task = %task_id, error = %e, "cannot requeue task");
                }
                self.wake_held();
                Vec::new()
            }
        }
    }

    fn on_completed(&mut self, task_id: &str, attempt: u32, output: serde_json::Value, now: Timestamp) {
        let Some(task) = current_attempt(&mut self.tasks, task_id, attempt) else {
            return;
        };
        let result = (|| {
            if task.state == TaskState::Routed {
                task.transition(TaskState::Executing, now)?;
            }
            task.transition(TaskState::Completed, now)
        })();
        if let Err(e) = result {
            error!(task = %task_id, error = %e, "cannot complete task");
            return;
        }
        task.result = Some(output);
        release_slot(&self.cluster, task);
        if let (Some(node), Some(model)) = (task.node_id.as_deref(), task.spec.preferred_model.as_deref()) {
            self.warm.touch(node, model, now);
        }
        info!(task = %task_id, node = ?task.node_id, duration_ms = ?task.duration_ms(), "task completed");
        self.wake_held();
    }

    fn on_failed(&mut self, task_id: &str, attempt: u32, error: String, now: Timestamp) {
        let Some(task) = current_attempt(&mut self.tasks, task_id, attempt) else {
            return;
        };
        if task.pending_cancel.is_some() {
            self.settle_cancel(task_id, now);
            return;
        }
        warn!(task = %task_id, node = ?task.node_id, %error, "task failed");
        let message = error.clone();
        if let Err(e) = task.fail(FailureReason::ExecutionFailure(error), message, now) {
            error!(task = %task_id, error = %e, "cannot record failure");
        }
        release_slot(&self.cluster, task);
        self.wake_held();
    }

    /// Finish a pending cancellation: release the slot and move to the
    /// terminal state matching its cause.
    fn settle_cancel(&mut self, task_id: &str, now: Timestamp) {
        let max_execution = self.config.max_execution_time;
        let Some(task) = self.tasks.get_mut(task_id) else {
            return;
        };
        let Some(pending) = task.pending_cancel else {
            return;
        };
        release_slot(&self.cluster, task);
        let result = match pending.cause {
            CancelCause::User => task.transition(TaskState::Cancelled, now),
            CancelCause::ExecutionTimeout => task.fail(
                FailureReason::Timeout,
                format!("execution exceeded {}", format_duration(max_execution)),
                now,
            ),
        };
        match result {
            Ok(()) => info!(task = %task_id, state = %task.state, "cancellation settled"),
            Err(e) => error!(task = %task_id, error = %e, "cannot settle cancellation"),
        }
        self.wake_held();
    }

    // ── Timers ───────────────────────────────────────────────────

    /// Enforce queue wait, deadlines, execution time and cancel grace;
    /// evict stale warm entries; purge expired history.
    pub fn tick(&mut self, now: Timestamp) -> Vec<Action> {
        let mut ids: Vec<(u64, TaskId)> = self
            .tasks
            .values()
            .filter(|t| !t.state.is_terminal())
            .map(|t| (t.seq, t.id.clone()))
            .collect();
        ids.sort();

        let max_wait = millis(self.config.max_queue_wait);
        let max_execution = millis(self.config.max_execution_time);
        let grace = millis(self.config.cancel_grace);
        let mut actions = Vec::new();
        let mut settle = Vec::new();

        for (_, id) in ids {
            let Some(task) = self.tasks.get_mut(&id) else {
                continue;
            };
            match task.state {
                TaskState::Queued => {
                    let expired = if task.spec.constraints.deadline.is_some_and(|d| now > d) {
                        Some((FailureReason::DeadlineExceeded, "deadline passed while queued".to_string()))
                    } else if task.queued_at.is_some_and(|q| now.saturating_sub(q) > max_wait) {
                        let waited = format_duration(self.config.max_queue_wait);
                        let message = match &task.last_error {
                            Some(last) => format!("queued longer than {waited}: {last}"),
                            None => format!("queued longer than {waited}"),
                        };
                        Some((FailureReason::Timeout, message))
                    } else {
                        None
                    };
                    if let Some((reason, message)) = expired {
                        self.queue.remove(task.priority(), task.seq);
                        warn!(task = %id, %reason, "queued task expired");
                        if let Err(e) = task.fail(reason, message, now) {
                            error!(task = %id, error = %e, "cannot expire task");
                        }
                    }
                }
                TaskState::Routed | TaskState::Executing => match task.pending_cancel {
                    Some(pending) => {
                        if now.saturating_sub(pending.requested_at) >= grace {
                            warn!(task = %id, "cancel grace period elapsed");
                            settle.push(id);
                        }
                    }
                    None => {
                        let since = match task.state {
                            TaskState::Executing => task.started_at,
                            _ => task.routed_at,
                        }
                        .unwrap_or(now);
                        if now.saturating_sub(since) > max_execution {
                            warn!(task = %id, node = ?task.node_id, "execution time exceeded, cancelling");
                            task.pending_cancel = Some(PendingCancel {
                                cause: CancelCause::ExecutionTimeout,
                                requested_at: now,
                            });
                            match cancel_action(&self.cluster, task) {
                                Some(action) => actions.push(action),
                                None => settle.push(id),
                            }
                        }
                    }
                },
                _ => {}
            }
        }

        for id in settle {
            self.settle_cancel(&id, now);
        }
        self.warm.evict_stale(now);
        self.purge(now);
        actions
    }

    /// Forget terminal tasks older than the retention window.
    fn purge(&mut self, now: Timestamp) {
        let retention = millis(self.config.history_retention);
        let expired: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.state.is_terminal())
            .filter(|t| t.completed_at.is_some_and(|c| now.saturating_sub(c) > retention))
            .map(|t| t.id.clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        for id in &expired {
            if let Some(task) = self.tasks.remove(id) {
                if let Some(key) = task.spec.idempotency_key {
                    self.idempotency.remove(&key);
                }
            }
        }
        debug!(purged = expired.len(), "purged finished tasks");
    }

    /// Release every backoff hold; called whenever capacity frees up.
    fn wake_held(&mut self) {
        for id in self.queue.iter() {
            if let Some(task) = self.tasks.get_mut(id) {
                task.not_before = None;
                task.busy_streak = 0;
            }
        }
    }

    // ── Topology ─────────────────────────────────────────────────

    /// Apply a telemetry update. A node coming back from stale adds
    /// capacity, so held tasks are woken.
    pub fn ingest_telemetry(&mut self, update: TelemetryUpdate, now: Timestamp) -> SchedulerResult<ApplyOutcome> {
        let node_id = update.node_id.clone();
        let was_stale = self.cluster.is_stale(&node_id, now).unwrap_or(false);
        let outcome = self.cluster.apply(update, now)?;
        if outcome == ApplyOutcome::Applied && was_stale {
            info!(node = %node_id, "node fresh again");
            self.wake_held();
        }
        Ok(outcome)
    }

    /// Register a node and seed warm state from its healthy services.
    pub fn register_node(&mut self, spec: NodeSpec, now: Timestamp) -> SchedulerResult<()> {
        self.cluster.register(spec.clone(), now)?;
        self.warm.seed_from_spec(&spec, now);
        self.wake_held();
        Ok(())
    }

    pub fn update_node(&mut self, node_id: &str, update: NodeUpdate, now: Timestamp) -> SchedulerResult<()> {
        let reseed = update.services.is_some();
        self.cluster.update_node(node_id, update)?;
        if reseed {
            if let Some(spec) = self.cluster.get_node(node_id) {
                self.warm.seed_from_spec(&spec, now);
            }
        }
        self.wake_held();
        Ok(())
    }

    /// Remove a node. Tasks placed on it go back to the queue.
    pub fn deregister_node(&mut self, node_id: &str, now: Timestamp) -> SchedulerResult<Vec<Action>> {
        let (spec, holders) = self.cluster.deregister(node_id)?;
        self.warm.remove_node(node_id);

        let mut actions = Vec::new();
        let mut settle = Vec::new();
        for id in holders {
            let Some(task) = self.tasks.get_mut(&id) else {
                continue;
            };
            if task.pending_cancel.is_some() {
                settle.push(id);
                continue;
            }
            let attempt = task.attempt;
            let result = (|| {
                if task.state == TaskState::Executing {
                    task.transition(TaskState::Preempted, now)?;
                }
                task.transition(TaskState::Queued, now)
            })();
            if let Err(e) = result {
                error!(task = %id, error = %e, "cannot requeue task from removed node");
                continue;
            }
            if task.started_at.is_some() {
                actions.push(Action::Cancel {
                    task_id: id.clone(),
                    attempt,
                    node: spec.clone(),
                });
            }
            task.slot = None;
            task.node_id = None;
            task.retry_count += 1;
            self.queue.requeue(task.priority(), task.seq, id.clone());
            warn!(task = %id, node = %node_id, "node removed, task requeued");
        }
        for id in settle {
            self.settle_cancel(&id, now);
        }
        Ok(actions)
    }

    // ── Queries ──────────────────────────────────────────────────

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    /// All known tasks in submission order.
    pub fn tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    pub fn decisions(&self, limit: usize) -> Vec<RoutingDecision> {
        self.decisions.recent(limit)
    }

    pub fn decisions_for(&self, task_id: &str) -> Vec<RoutingDecision> {
        self.decisions.for_task(task_id)
    }

    /// Tasks waiting in the queue.
    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Queued task ids in dispatch order.
    pub fn queued(&self) -> Vec<TaskId> {
        self.queue.iter().cloned().collect()
    }
}

/// The task if `attempt` is its current, still placed attempt.
fn current_attempt<'a>(
    tasks: &'a mut HashMap<TaskId, Task>,
    task_id: &str,
    attempt: u32,
) -> Option<&'a mut Task> {
    match tasks.get_mut(task_id) {
        Some(task) if task.attempt == attempt && task.state.is_placed() => Some(task),
        _ => {
            debug!(task = %task_id, attempt, "ignoring event for a superseded attempt");
            None
        }
    }
}

/// The abort request for a placed task, if its node is still known.
fn cancel_action(cluster: &ClusterState, task: &Task) -> Option<Action> {
    let node = cluster.get_node(task.node_id.as_deref()?)?;
    Some(Action::Cancel {
        task_id: task.id.clone(),
        attempt: task.attempt,
        node,
    })
}

fn release_slot(cluster: &ClusterState, task: &mut Task) {
    if let Some(node) = task.node_id.as_deref() {
        cluster.release(node, &task.id);
    }
    task.slot = None;
}

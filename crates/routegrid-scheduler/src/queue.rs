//! Priority-ordered admission queue.
//!
//! Keyed by `(priority desc, submission sequence asc)`, so iteration
//! order is the dispatch order and equal-priority tasks stay FIFO.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use routegrid_core::{Priority, TaskId};

use crate::error::{SchedulerError, SchedulerResult};

type QueueKey = (Reverse<Priority>, u64);

#[derive(Debug, Clone)]
pub struct TaskQueue {
    entries: BTreeMap<QueueKey, TaskId>,
    capacity: usize,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity,
        }
    }

    /// Admit a new task. Fails with `QueueFull` at capacity.
    pub fn push(&mut self, priority: Priority, seq: u64, task_id: TaskId) -> SchedulerResult<()> {
        if self.is_full() {
            return Err(SchedulerError::QueueFull {
                capacity: self.capacity,
            });
        }
        self.entries.insert((Reverse(priority), seq), task_id);
        Ok(())
    }

    /// Put back a task that was already admitted (preempted, rejected by
    /// its adapter, or evicted from a node). Never refused.
    pub fn requeue(&mut self, priority: Priority, seq: u64, task_id: TaskId) {
        self.entries.insert((Reverse(priority), seq), task_id);
    }

    pub fn remove(&mut self, priority: Priority, seq: u64) -> Option<TaskId> {
        self.entries.remove(&(Reverse(priority), seq))
    }

    /// Task ids in dispatch order.
    pub fn iter(&self) -> impl Iterator<Item = &TaskId> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

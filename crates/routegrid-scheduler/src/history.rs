//! Bounded log of routing decisions, newest last.

use std::collections::VecDeque;

use routegrid_placement::RoutingDecision;

#[derive(Debug, Clone)]
pub struct DecisionLog {
    entries: VecDeque<RoutingDecision>,
    capacity: usize,
}

impl DecisionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, decision: RoutingDecision) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(decision);
    }

    /// Up to `limit` most recent decisions, newest first.
    pub fn recent(&self, limit: usize) -> Vec<RoutingDecision> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }

    /// Decisions made for one task, oldest first.
    pub fn for_task(&self, task_id: &str) -> Vec<RoutingDecision> {
        self.entries
            .iter()
            .filter(|d| d.task_id == task_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use routegrid_core::SlotKind;
    use routegrid_placement::ScoreBreakdown;

    fn decision(task: &str) -> RoutingDecision {
        RoutingDecision {
            task_id: task.to_string(),
            node_id: "n".to_string(),
            score: 0.0,
            slot: SlotKind::Shared,
            breakdown: ScoreBreakdown::default(),
            rejected: Vec::new(),
            decided_at: 0,
            snapshot_version: 0,
            degraded: false,
        }
    }

    #[test]
    fn drops_oldest_past_capacity() {
        let mut log = DecisionLog::new(2);
        log.push(decision("a"));
        log.push(decision("b"));
        log.push(decision("c"));
        let ids: Vec<_> = log.recent(10).into_iter().map(|d| d.task_id).collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[test]
    fn recent_respects_limit() {
        let mut log = DecisionLog::new(10);
        for t in ["a", "b", "c"] {
            log.push(decision(t));
        }
        assert_eq!(log.recent(1)[0].task_id, "c");
        assert_eq!(log.for_task("b").len(), 1);
    }
}

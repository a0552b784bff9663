//! Task intents: what users submit to the engine.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{CapabilitySet, ModelId, NodeId, Timestamp, capability_set};

/// Task priority. Higher values are more important.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub u8);

impl Priority {
    pub const LOW: Priority = Priority(0);
    pub const NORMAL: Priority = Priority(5);
    pub const HIGH: Priority = Priority(8);
    pub const CRITICAL: Priority = Priority(10);

    /// How far `self` sits above `other` (zero if not above).
    pub fn gap_over(self, other: Priority) -> u8 {
        self.0.saturating_sub(other.0)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which kind of slot a task asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotRequest {
    /// Exclusive slot if the node has any, otherwise a shared slot.
    #[default]
    Auto,
    Exclusive,
    Shared,
}

/// The kind of slot a task actually occupies on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    Exclusive,
    Shared,
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotKind::Exclusive => f.write_str("exclusive"),
            SlotKind::Shared => f.write_str("shared"),
        }
    }
}

/// Constraints on where and how a task can run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaskConstraints {
    pub max_latency_ms: Option<u32>,
    /// Free memory the task needs on its slot.
    pub required_memory_bytes: Option<u64>,
    /// Latest start time; a task still queued past it fails.
    pub deadline: Option<Timestamp>,
    /// Node that wins whenever it passes the filter.
    pub preferred_node: Option<NodeId>,
    pub excluded_nodes: BTreeSet<NodeId>,
    /// The node must own an accelerator with at least this much memory.
    pub min_accelerator_memory_bytes: Option<u64>,
    /// Reject cold candidates whenever a warm candidate is available.
    pub require_warm_model: bool,
    pub slot: SlotRequest,
}

/// A task intent as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSpec {
    /// Free-form label ("chat", "transcribe") for diagnostics.
    #[serde(default)]
    pub kind: Option<String>,
    pub capabilities: CapabilitySet,
    #[serde(default)]
    pub preferred_model: Option<ModelId>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub constraints: TaskConstraints,
    /// Whether a higher-priority task may preempt this one.
    #[serde(default = "default_preemptible")]
    pub preemptible: bool,
    /// Re-submissions with the same key return the original task.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// Opaque payload handed to the execution adapter.
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

fn default_preemptible() -> bool {
    true
}

impl TaskSpec {
    pub fn new<I, S>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: None,
            capabilities: capability_set(capabilities),
            preferred_model: None,
            priority: Priority::NORMAL,
            constraints: TaskConstraints::default(),
            preemptible: true,
            idempotency_key: None,
            input: serde_json::Value::Null,
            params: serde_json::Map::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.preferred_model = Some(model.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_constraints(mut self, constraints: TaskConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn non_preemptible(mut self) -> Self {
        self.preemptible = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_and_gap() {
        assert!(Priority::CRITICAL > Priority::HIGH);
        assert!(Priority::LOW < Priority::NORMAL);
        assert_eq!(Priority(10).gap_over(Priority(1)), 9);
        assert_eq!(Priority(1).gap_over(Priority(10)), 0);
        assert_eq!(Priority::default(), Priority::NORMAL);
    }

    #[test]
    fn task_spec_parses_with_defaults() {
        let spec: TaskSpec = serde_json::from_str(
            r#"{ "capabilities": ["llm-inference"], "preferred_model": "m1" }"#,
        )
        .unwrap();
        assert_eq!(spec.priority, Priority::NORMAL);
        assert!(spec.preemptible);
        assert_eq!(spec.constraints.slot, SlotRequest::Auto);
        assert_eq!(spec.preferred_model.as_deref(), Some("m1"));
        assert!(spec.input.is_null());
    }

    #[test]
    fn task_spec_rejects_unknown_fields() {
        let result: Result<TaskSpec, _> =
            serde_json::from_str(r#"{ "capabilities": ["x"], "gpu": true }"#);
        assert!(result.is_err());
    }

    #[test]
    fn builder_sets_fields() {
        let spec = TaskSpec::new(["embeddings"])
            .with_priority(Priority::HIGH)
            .with_model("bge")
            .with_idempotency_key("req-1")
            .non_preemptible();
        assert_eq!(spec.priority, Priority::HIGH);
        assert_eq!(spec.idempotency_key.as_deref(), Some("req-1"));
        assert!(!spec.preemptible);
        assert_eq!(spec.capabilities.len(), 1);
    }
}

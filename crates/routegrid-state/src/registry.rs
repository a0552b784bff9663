//! Hardware capability registry: the declared attributes of every node.
//!
//! The registry is the source of truth for what operators configured:
//! host, type tag, accelerators, capability tags, slot limits. It never
//! polls hardware. Versioning lives in the cluster state model, which
//! raises its freshness floor on every registry write.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use routegrid_core::*;

use crate::error::{StateError, StateResult};

/// Partial update of a node's declared attributes. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeUpdate {
    pub host: Option<String>,
    pub kind: Option<String>,
    pub accelerators: Option<Vec<Accelerator>>,
    pub capabilities: Option<CapabilitySet>,
    pub shared_slots: Option<u32>,
    pub memory_bytes: Option<u64>,
    pub latency_ms: Option<u32>,
    pub cost_per_hour: Option<f64>,
    pub executor: Option<String>,
    pub power_state: Option<PowerState>,
    pub services: Option<Vec<ServiceEndpoint>>,
}

impl NodeUpdate {
    pub fn is_empty(&self) -> bool {
        *self == NodeUpdate::default()
    }

    fn apply_to(self, spec: &mut NodeSpec) {
        if let Some(host) = self.host {
            spec.host = host;
        }
        if let Some(kind) = self.kind {
            spec.kind = kind;
        }
        if let Some(accelerators) = self.accelerators {
            spec.accelerators = accelerators;
        }
        if let Some(capabilities) = self.capabilities {
            spec.capabilities = capabilities;
        }
        if let Some(slots) = self.shared_slots {
            spec.shared_slots = slots;
        }
        if let Some(memory) = self.memory_bytes {
            spec.memory_bytes = Some(memory);
        }
        if let Some(latency) = self.latency_ms {
            spec.latency_ms = Some(latency);
        }
        if let Some(cost) = self.cost_per_hour {
            spec.cost_per_hour = Some(cost);
        }
        if let Some(executor) = self.executor {
            spec.executor = Some(executor);
        }
        if let Some(power) = self.power_state {
            spec.power_state = power;
        }
        if let Some(services) = self.services {
            spec.services = services;
        }
    }
}

/// Declared node specs keyed by node id.
#[derive(Debug, Clone, Default)]
pub struct HardwareRegistry {
    nodes: BTreeMap<NodeId, NodeSpec>,
}

impl HardwareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new node. Fails if the id is already taken.
    pub fn register(&mut self, spec: NodeSpec) -> StateResult<()> {
        if self.nodes.contains_key(&spec.id) {
            return Err(StateError::DuplicateNode(spec.id));
        }
        info!(
            node = %spec.id,
            host = %spec.host,
            kind = %spec.kind,
            exclusive_slots = spec.exclusive_slots(),
            shared_slots = spec.shared_slots,
            "node registered"
        );
        self.nodes.insert(spec.id.clone(), spec);
        Ok(())
    }

    /// Apply a partial update to a registered node.
    pub fn update(&mut self, node_id: &str, update: NodeUpdate) -> StateResult<()> {
        let spec = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| StateError::UnknownNode(node_id.to_string()))?;
        update.apply_to(spec);
        debug!(node = %node_id, "node spec updated");
        Ok(())
    }

    /// Remove a node. Returns its last declared spec.
    pub fn deregister(&mut self, node_id: &str) -> StateResult<NodeSpec> {
        let spec = self
            .nodes
            .remove(node_id)
            .ok_or_else(|| StateError::UnknownNode(node_id.to_string()))?;
        info!(node = %node_id, "node deregistered");
        Ok(spec)
    }

    /// All registered nodes, ordered by id.
    pub fn list(&self) -> Vec<NodeSpec> {
        self.nodes.values().cloned().collect()
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeSpec> {
        self.nodes.get(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether any registered node advertises all of `required`,
    /// regardless of its current load.
    pub fn any_advertises(&self, required: &CapabilitySet) -> bool {
        self.nodes.values().any(|n| n.advertises(required))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.values()
    }
}

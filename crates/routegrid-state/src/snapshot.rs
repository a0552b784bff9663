//! Immutable point-in-time views of the cluster.

use std::collections::BTreeSet;

use serde::Serialize;

use routegrid_core::*;

/// One node as seen at snapshot time.
#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub spec: NodeSpec,
    pub metrics: NodeMetrics,
    /// Version of the last applied telemetry (0 = none yet).
    pub telemetry_version: u64,
    pub last_seen: Timestamp,
    /// No telemetry within the staleness window.
    pub stale: bool,
    pub exclusive_capacity: u32,
    /// Exclusive slot indices currently reserved.
    pub exclusive_held: BTreeSet<u32>,
    pub shared_in_use: u32,
}

impl NodeView {
    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn exclusive_in_use(&self) -> u32 {
        self.exclusive_held.len() as u32
    }

    pub fn free_exclusive(&self) -> u32 {
        self.exclusive_capacity.saturating_sub(self.exclusive_in_use())
    }

    pub fn free_shared(&self) -> u32 {
        self.spec.shared_slots.saturating_sub(self.shared_in_use)
    }

    /// Tasks currently holding a slot on this node.
    pub fn queue_depth(&self) -> u32 {
        self.exclusive_in_use() + self.shared_in_use
    }

    /// The slot kind a request maps to on this node, if the node has
    /// that kind of capacity at all.
    pub fn resolve_slot(&self, request: SlotRequest) -> Option<SlotKind> {
        match request {
            SlotRequest::Exclusive if self.exclusive_capacity > 0 => Some(SlotKind::Exclusive),
            SlotRequest::Shared if self.spec.shared_slots > 0 => Some(SlotKind::Shared),
            SlotRequest::Auto if self.exclusive_capacity > 0 => Some(SlotKind::Exclusive),
            SlotRequest::Auto if self.spec.shared_slots > 0 => Some(SlotKind::Shared),
            _ => None,
        }
    }

    pub fn has_free(&self, kind: SlotKind) -> bool {
        match kind {
            SlotKind::Exclusive => self.free_exclusive() > 0,
            SlotKind::Shared => self.free_shared() > 0,
        }
    }

    /// Busy fraction of the capacity backing `kind`; `None` if unknown.
    ///
    /// Exclusive slots average the known busy values of exclusive
    /// devices; shared slots use CPU.
    pub fn utilization(&self, kind: SlotKind) -> Option<f64> {
        match kind {
            SlotKind::Shared => self.metrics.cpu,
            SlotKind::Exclusive => {
                let known: Vec<f64> = self
                    .exclusive_device_metrics()
                    .filter_map(|m| m.busy)
                    .collect();
                if known.is_empty() {
                    self.metrics.cpu
                } else {
                    Some(known.iter().sum::<f64>() / known.len() as f64)
                }
            }
        }
    }

    /// Free memory available to a task on a `kind` slot.
    ///
    /// For exclusive slots this is the best free device, since that is
    /// the most a reservation can get. Falls back to declared capacity
    /// when telemetry has not reported it; `None` means neither is known.
    pub fn free_memory(&self, kind: SlotKind) -> Option<u64> {
        match kind {
            SlotKind::Shared => self.metrics.memory_free_bytes.or(self.spec.memory_bytes),
            SlotKind::Exclusive => self
                .free_slots()
                .filter_map(|slot| self.spec.slot_memory(slot, &self.metrics))
                .max(),
        }
    }

    /// Exclusive slot indices not reserved by anyone.
    pub fn free_slots(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.exclusive_capacity).filter(|i| !self.exclusive_held.contains(i))
    }

    /// Copy of this view as it would look with exclusive slot `slot`
    /// released, mirroring [`ClusterState::release`](crate::ClusterState::release).
    pub fn without_exclusive(&self, slot: u32) -> NodeView {
        let mut view = self.clone();
        view.exclusive_held.remove(&slot);
        let device = self.spec.exclusive_devices().get(slot as usize).map(|(i, _)| *i);
        if let Some(m) = device.and_then(|i| view.metrics.accelerators.get_mut(i)) {
            m.memory_free_bytes = None;
        }
        view
    }

    fn exclusive_device_metrics(&self) -> impl Iterator<Item = &AcceleratorMetrics> {
        let devices = self.spec.devices();
        self.metrics
            .accelerators
            .iter()
            .enumerate()
            .filter(move |(idx, _)| devices.get(*idx).is_some_and(|d| d.exclusive))
            .map(|(_, m)| m)
    }
}

/// Immutable, versioned copy of the cluster used for one routing decision.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSnapshot {
    /// Cluster-wide state version at the time of the snapshot.
    pub version: u64,
    pub taken_at: Timestamp,
    /// Nodes ordered by id.
    pub nodes: Vec<NodeView>,
}

impl ClusterSnapshot {
    pub fn node(&self, node_id: &str) -> Option<&NodeView> {
        self.nodes.iter().find(|n| n.spec.id == node_id)
    }

    pub fn fresh_nodes(&self) -> impl Iterator<Item = &NodeView> {
        self.nodes.iter().filter(|n| !n.stale)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(spec: NodeSpec, metrics: NodeMetrics) -> NodeView {
        NodeView {
            exclusive_capacity: spec.exclusive_slots(),
            spec,
            metrics,
            telemetry_version: 1,
            last_seen: 0,
            stale: false,
            exclusive_held: BTreeSet::new(),
            shared_in_use: 0,
        }
    }

    fn gpu_node() -> NodeSpec {
        NodeSpec::new("g", "h")
            .with_shared_slots(2)
            .with_accelerator(Accelerator {
                kind: AcceleratorKind::Nvidia,
                model: "A".to_string(),
                count: 2,
                memory_bytes: 16,
                exclusive: true,
            })
            .with_accelerator(Accelerator {
                kind: AcceleratorKind::Intel,
                model: "B".to_string(),
                count: 1,
                memory_bytes: 64,
                exclusive: false,
            })
    }

    #[test]
    fn resolve_slot_prefers_exclusive_on_auto() {
        let v = view(gpu_node(), NodeMetrics::default());
        assert_eq!(v.resolve_slot(SlotRequest::Auto), Some(SlotKind::Exclusive));
        assert_eq!(v.resolve_slot(SlotRequest::Shared), Some(SlotKind::Shared));

        let cpu = view(NodeSpec::new("c", "h"), NodeMetrics::default());
        assert_eq!(cpu.resolve_slot(SlotRequest::Auto), Some(SlotKind::Shared));
        assert_eq!(cpu.resolve_slot(SlotRequest::Exclusive), None);

        let none = view(NodeSpec::new("z", "h").with_shared_slots(0), NodeMetrics::default());
        assert_eq!(none.resolve_slot(SlotRequest::Auto), None);
    }

    #[test]
    fn utilization_averages_exclusive_devices_only() {
        let metrics = NodeMetrics {
            cpu: Some(0.9),
            memory_free_bytes: None,
            accelerators: vec![
                AcceleratorMetrics {
                    busy: Some(0.2),
                    ..Default::default()
                },
                AcceleratorMetrics {
                    busy: Some(0.4),
                    ..Default::default()
                },
                AcceleratorMetrics {
                    busy: Some(1.0),
                    ..Default::default()
                },
            ],
        };
        let v = view(gpu_node(), metrics);
        let util = v.utilization(SlotKind::Exclusive).unwrap();
        assert!((util - 0.3).abs() < 1e-9);
        assert_eq!(v.utilization(SlotKind::Shared), Some(0.9));
    }

    #[test]
    fn utilization_unknown_without_telemetry() {
        let v = view(gpu_node(), NodeMetrics::default());
        assert_eq!(v.utilization(SlotKind::Exclusive), None);
        assert_eq!(v.utilization(SlotKind::Shared), None);
    }

    #[test]
    fn free_memory_falls_back_to_capacity() {
        let v = view(gpu_node(), NodeMetrics::default());
        assert_eq!(v.free_memory(SlotKind::Exclusive), Some(16));
        assert_eq!(v.free_memory(SlotKind::Shared), None);

        let metrics = NodeMetrics {
            cpu: None,
            memory_free_bytes: Some(1000),
            accelerators: vec![
                AcceleratorMetrics {
                    memory_free_bytes: Some(4),
                    ..Default::default()
                },
                AcceleratorMetrics {
                    memory_free_bytes: Some(10),
                    ..Default::default()
                },
            ],
        };
        let v = view(gpu_node(), metrics);
        assert_eq!(v.free_memory(SlotKind::Exclusive), Some(10));
        assert_eq!(v.free_memory(SlotKind::Shared), Some(1000));
    }

    #[test]
    fn free_memory_ignores_held_devices() {
        let metrics = NodeMetrics {
            accelerators: vec![
                AcceleratorMetrics {
                    memory_free_bytes: Some(4),
                    ..Default::default()
                },
                AcceleratorMetrics {
                    memory_free_bytes: Some(10),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let mut v = view(gpu_node(), metrics);
        v.exclusive_held.insert(1);
        assert_eq!(v.free_memory(SlotKind::Exclusive), Some(4));

        v.exclusive_held.insert(0);
        assert_eq!(v.free_memory(SlotKind::Exclusive), None);
        assert_eq!(v.without_exclusive(1).free_memory(SlotKind::Exclusive), Some(16));
    }

    #[test]
    fn free_slot_counts() {
        let mut v = view(gpu_node(), NodeMetrics::default());
        v.exclusive_held = BTreeSet::from([0, 1]);
        v.shared_in_use = 1;
        assert_eq!(v.free_exclusive(), 0);
        assert_eq!(v.free_shared(), 1);
        assert!(!v.has_free(SlotKind::Exclusive));
        assert!(v.has_free(SlotKind::Shared));
        assert_eq!(v.queue_depth(), 3);
    }
}

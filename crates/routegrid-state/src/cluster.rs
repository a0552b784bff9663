//! Cluster state model: registry + live telemetry + slot occupancy.
//!
//! All mutation goes through one lock; readers take an owned
//! [`ClusterSnapshot`] and release the lock immediately. A single
//! cluster-wide counter versions every change so a snapshot can be
//! compared against the freshness floor (the counter value at the most
//! recent registry write).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use routegrid_core::*;

use crate::error::{StateError, StateResult};
use crate::registry::{HardwareRegistry, NodeUpdate};
use crate::snapshot::{ClusterSnapshot, NodeView};

const DEFAULT_STALENESS_WINDOW: Duration = Duration::from_secs(30);

/// A metrics push from a telemetry driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryUpdate {
    pub node_id: NodeId,
    /// Driver-assigned, monotonic per node.
    pub version: u64,
    pub metrics: NodeMetrics,
}

/// What `apply` did with an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The update's version was not newer than the stored one.
    Discarded,
}

/// A slot held by a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotAssignment {
    pub node_id: NodeId,
    pub kind: SlotKind,
    /// Device index for exclusive slots.
    pub index: Option<u32>,
}

#[derive(Debug, Default)]
struct LiveNode {
    metrics: NodeMetrics,
    telemetry_version: u64,
    last_seen: Timestamp,
    exclusive: BTreeMap<u32, TaskId>,
    shared: BTreeSet<TaskId>,
}

impl LiveNode {
    fn seen_at(now: Timestamp) -> Self {
        Self {
            last_seen: now,
            ..Default::default()
        }
    }

    fn holder_slot(&self, task_id: &str) -> Option<(SlotKind, Option<u32>)> {
        if let Some((idx, _)) = self.exclusive.iter().find(|(_, t)| t.as_str() == task_id) {
            return Some((SlotKind::Exclusive, Some(*idx)));
        }
        if self.shared.contains(task_id) {
            return Some((SlotKind::Shared, None));
        }
        None
    }

    fn reservations(&self) -> usize {
        self.exclusive.len() + self.shared.len()
    }
}

#[derive(Debug, Default)]
struct Inner {
    registry: HardwareRegistry,
    live: HashMap<NodeId, LiveNode>,
    version: u64,
    topology_floor: u64,
}

impl Inner {
    fn bump(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    fn bump_topology(&mut self) -> u64 {
        let v = self.bump();
        self.topology_floor = v;
        v
    }
}

/// In-memory, versioned aggregate of node state.
pub struct ClusterState {
    inner: RwLock<Inner>,
    staleness_window: Duration,
}

impl Default for ClusterState {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterState {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            staleness_window: DEFAULT_STALENESS_WINDOW,
        }
    }

    pub fn with_staleness_window(mut self, window: Duration) -> Self {
        self.staleness_window = window;
        self
    }

    pub fn staleness_window(&self) -> Duration {
        self.staleness_window
    }

    // ── Registry writes ──────────────────────────────────────────

    /// Register a node. Registration counts as the node being seen at `now`.
    pub fn register(&self, spec: NodeSpec, now: Timestamp) -> StateResult<u64> {
        let mut inner = self.inner.write().expect("cluster state lock");
        let id = spec.id.clone();
        inner.registry.register(spec)?;
        inner.live.insert(id, LiveNode::seen_at(now));
        Ok(inner.bump_topology())
    }

    pub fn update_node(&self, node_id: &str, update: NodeUpdate) -> StateResult<u64> {
        let mut inner = self.inner.write().expect("cluster state lock");
        inner.registry.update(node_id, update)?;
        Ok(inner.bump_topology())
    }

    /// Remove a node and forget its live state. Slot holders are
    /// returned so the caller can requeue them.
    pub fn deregister(&self, node_id: &str) -> StateResult<(NodeSpec, Vec<TaskId>)> {
        let mut inner = self.inner.write().expect("cluster state lock");
        let spec = inner.registry.deregister(node_id)?;
        let holders: Vec<TaskId> = inner
            .live
            .remove(node_id)
            .map(|live| {
                live.exclusive
                    .into_values()
                    .chain(live.shared)
                    .collect()
            })
            .unwrap_or_default();
        if !holders.is_empty() {
            warn!(node = %node_id, holders = holders.len(), "deregistered node still had reservations");
        }
        inner.bump_topology();
        Ok((spec, holders))
    }

    // ── Telemetry ────────────────────────────────────────────────

    /// Apply a telemetry update. Updates whose version is not newer than
    /// the stored one are discarded, so out-of-order delivery is harmless.
    pub fn apply(&self, update: TelemetryUpdate, now: Timestamp) -> StateResult<ApplyOutcome> {
        update
            .metrics
            .validate()
            .map_err(|reason| StateError::InvalidMetric {
                node: update.node_id.clone(),
                reason,
            })?;

        let mut inner = self.inner.write().expect("cluster state lock");
        if !inner.registry.contains(&update.node_id) {
            return Err(StateError::UnknownNode(update.node_id));
        }
        let live = inner.live.entry(update.node_id.clone()).or_default();
        if update.version <= live.telemetry_version {
            trace!(
                node = %update.node_id,
                version = update.version,
                stored = live.telemetry_version,
                "discarding out-of-order telemetry"
            );
            return Ok(ApplyOutcome::Discarded);
        }
        live.metrics = update.metrics;
        live.telemetry_version = update.version;
        live.last_seen = now;
        inner.bump();
        Ok(ApplyOutcome::Applied)
    }

    // ── Slots ────────────────────────────────────────────────────

    /// Reserve a slot of `kind` on a node for `task_id`.
    ///
    /// Exclusive slots are handed out lowest free index first, skipping
    /// devices with less than `required_memory` free. Reserving again for
    /// a task that already holds a slot on the node returns the existing
    /// assignment.
    pub fn reserve(
        &self,
        node_id: &str,
        kind: SlotKind,
        task_id: &str,
        required_memory: Option<u64>,
    ) -> StateResult<SlotAssignment> {
        let mut inner = self.inner.write().expect("cluster state lock");
        let Inner { registry, live, .. } = &mut *inner;
        let Some(spec) = registry.get(node_id) else {
            return Err(StateError::UnknownNode(node_id.to_string()));
        };
        let exclusive_capacity = spec.exclusive_slots();
        let shared_capacity = spec.shared_slots;
        let live = live.entry(node_id.to_string()).or_default();

        if let Some((held_kind, index)) = live.holder_slot(task_id) {
            return Ok(SlotAssignment {
                node_id: node_id.to_string(),
                kind: held_kind,
                index,
            });
        }

        let index = match kind {
            SlotKind::Exclusive => {
                let free: Vec<u32> = (0..exclusive_capacity)
                    .filter(|i| !live.exclusive.contains_key(i))
                    .collect();
                if free.is_empty() {
                    return Err(StateError::NoFreeSlot {
                        node: node_id.to_string(),
                        kind,
                    });
                }
                let fits = |slot: u32| match required_memory {
                    Some(required) => spec.slot_memory(slot, &live.metrics).is_some_and(|m| m >= required),
                    None => true,
                };
                let Some(idx) = free.into_iter().find(|i| fits(*i)) else {
                    return Err(StateError::NoFittingDevice {
                        node: node_id.to_string(),
                        required: required_memory.unwrap_or_default(),
                    });
                };
                live.exclusive.insert(idx, task_id.to_string());
                Some(idx)
            }
            SlotKind::Shared => {
                if live.shared.len() as u32 >= shared_capacity {
                    return Err(StateError::NoFreeSlot {
                        node: node_id.to_string(),
                        kind,
                    });
                }
                live.shared.insert(task_id.to_string());
                None
            }
        };
        inner.bump();
        debug!(node = %node_id, task = %task_id, %kind, index = ?index, "slot reserved");
        Ok(SlotAssignment {
            node_id: node_id.to_string(),
            kind,
            index,
        })
    }

    /// Release whatever slot `task_id` holds on a node. Returns whether
    /// anything was released.
    ///
    /// A released device's memory reading still counts the old holder,
    /// so it reverts to declared capacity until the next telemetry.
    pub fn release(&self, node_id: &str, task_id: &str) -> bool {
        let mut inner = self.inner.write().expect("cluster state lock");
        let Inner { registry, live, .. } = &mut *inner;
        let Some(live) = live.get_mut(node_id) else {
            return false;
        };
        let released = match live.holder_slot(task_id) {
            Some((SlotKind::Exclusive, Some(idx))) => {
                let device = registry
                    .get(node_id)
                    .and_then(|spec| spec.exclusive_devices().get(idx as usize).map(|(i, _)| *i));
                if let Some(m) = device.and_then(|i| live.metrics.accelerators.get_mut(i)) {
                    m.memory_free_bytes = None;
                }
                live.exclusive.remove(&idx).is_some()
            }
            Some((SlotKind::Shared, _)) => live.shared.remove(task_id),
            _ => false,
        };
        if released {
            inner.bump();
            debug!(node = %node_id, task = %task_id, "slot released");
        }
        released
    }

    /// The slot `task_id` currently holds on a node, if any.
    pub fn slot_of(&self, node_id: &str, task_id: &str) -> Option<SlotAssignment> {
        let inner = self.inner.read().expect("cluster state lock");
        let live = inner.live.get(node_id)?;
        live.holder_slot(task_id).map(|(kind, index)| SlotAssignment {
            node_id: node_id.to_string(),
            kind,
            index,
        })
    }

    // ── Reads ────────────────────────────────────────────────────

    /// Immutable copy of every node as of `now`, ordered by id.
    pub fn snapshot(&self, now: Timestamp) -> ClusterSnapshot {
        let inner = self.inner.read().expect("cluster state lock");
        let window = self.staleness_window.as_millis() as u64;
        let nodes = inner
            .registry
            .iter()
            .map(|spec| {
                let live = inner.live.get(&spec.id);
                let last_seen = live.map(|l| l.last_seen).unwrap_or_default();
                NodeView {
                    spec: spec.clone(),
                    metrics: live.map(|l| l.metrics.clone()).unwrap_or_default(),
                    telemetry_version: live.map(|l| l.telemetry_version).unwrap_or_default(),
                    last_seen,
                    stale: now.saturating_sub(last_seen) > window,
                    exclusive_capacity: spec.exclusive_slots(),
                    exclusive_held: live.map(|l| l.exclusive.keys().copied().collect()).unwrap_or_default(),
                    shared_in_use: live.map(|l| l.shared.len() as u32).unwrap_or_default(),
                }
            })
            .collect();
        ClusterSnapshot {
            version: inner.version,
            taken_at: now,
            nodes,
        }
    }

    /// Whether a node has gone without telemetry past the staleness
    /// window. `None` for unknown nodes.
    pub fn is_stale(&self, node_id: &str, now: Timestamp) -> Option<bool> {
        let inner = self.inner.read().expect("cluster state lock");
        if !inner.registry.contains(node_id) {
            return None;
        }
        let last_seen = inner.live.get(node_id).map(|l| l.last_seen).unwrap_or_default();
        Some(now.saturating_sub(last_seen) > self.staleness_window.as_millis() as u64)
    }

    /// Current cluster-wide version.
    pub fn version(&self) -> u64 {
        self.inner.read().expect("cluster state lock").version
    }

    /// Version of the most recent registry write. Snapshots older than
    /// this were taken against a different topology.
    pub fn topology_floor(&self) -> u64 {
        self.inner.read().expect("cluster state lock").topology_floor
    }

    pub fn get_node(&self, node_id: &str) -> Option<NodeSpec> {
        let inner = self.inner.read().expect("cluster state lock");
        inner.registry.get(node_id).cloned()
    }

    pub fn list_nodes(&self) -> Vec<NodeSpec> {
        self.inner.read().expect("cluster state lock").registry.list()
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().expect("cluster state lock").registry.len()
    }

    /// Whether any registered node advertises `required`, ignoring load.
    pub fn any_advertises(&self, required: &CapabilitySet) -> bool {
        let inner = self.inner.read().expect("cluster state lock");
        inner.registry.any_advertises(required)
    }

    /// Total reservations held across the cluster.
    pub fn reservations(&self) -> usize {
        let inner = self.inner.read().expect("cluster state lock");
        inner.live.values().map(LiveNode::reservations).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu_node(id: &str, devices: u32) -> NodeSpec {
        NodeSpec::new(id, "10.0.0.1")
            .with_capabilities(["llm-inference"])
            .with_shared_slots(1)
            .with_accelerator(Accelerator {
                kind: AcceleratorKind::Nvidia,
                model: "RTX 3090".to_string(),
                count: devices,
                memory_bytes: 24 << 30,
                exclusive: true,
            })
    }

    fn telemetry(node: &str, version: u64, cpu: f64) -> TelemetryUpdate {
        TelemetryUpdate {
            node_id: node.to_string(),
            version,
            metrics: NodeMetrics {
                cpu: Some(cpu),
                ..Default::default()
            },
        }
    }

    #[test]
    fn register_marks_node_seen() {
        let state = ClusterState::new().with_staleness_window(Duration::from_secs(10));
        state.register(gpu_node("a", 1), 1_000).unwrap();

        let snap = state.snapshot(5_000);
        assert!(!snap.node("a").unwrap().stale);

        let snap = state.snapshot(20_000);
        assert!(snap.node("a").unwrap().stale);
        assert_eq!(state.is_stale("a", 20_000), Some(true));

        state.apply(telemetry("a", 1, 0.1), 20_000).unwrap();
        assert_eq!(state.is_stale("a", 20_000), Some(false));
        assert_eq!(state.is_stale("ghost", 0), None);
    }

    #[test]
    fn duplicate_register_fails() {
        let state = ClusterState::new();
        state.register(gpu_node("a", 1), 0).unwrap();
        assert_eq!(
            state.register(gpu_node("a", 1), 0).unwrap_err(),
            StateError::DuplicateNode("a".to_string())
        );
    }

    #[test]
    fn apply_discards_older_versions() {
        let state = ClusterState::new();
        state.register(gpu_node("a", 1), 0).unwrap();

        assert_eq!(state.apply(telemetry("a", 5, 0.5), 10).unwrap(), ApplyOutcome::Applied);
        assert_eq!(state.apply(telemetry("a", 3, 0.9), 20).unwrap(), ApplyOutcome::Discarded);
        assert_eq!(state.apply(telemetry("a", 5, 0.9), 20).unwrap(), ApplyOutcome::Discarded);

        let snap = state.snapshot(30);
        let view = snap.node("a").unwrap();
        assert_eq!(view.metrics.cpu, Some(0.5));
        assert_eq!(view.telemetry_version, 5);
        assert_eq!(view.last_seen, 10);
    }

    #[test]
    fn apply_rejects_invalid_metrics() {
        let state = ClusterState::new();
        state.register(gpu_node("a", 1), 0).unwrap();
        let err = state.apply(telemetry("a", 1, 1.7), 0).unwrap_err();
        assert!(matches!(err, StateError::InvalidMetric { .. }));
    }

    #[test]
    fn apply_unknown_node_fails() {
        let state = ClusterState::new();
        let err = state.apply(telemetry("ghost", 1, 0.1), 0).unwrap_err();
        assert_eq!(err, StateError::UnknownNode("ghost".to_string()));
    }

    #[test]
    fn exclusive_slots_are_mutually_exclusive() {
        let state = ClusterState::new();
        state.register(gpu_node("a", 2), 0).unwrap();

        let s1 = state.reserve("a", SlotKind::Exclusive, "t1", None).unwrap();
        let s2 = state.reserve("a", SlotKind::Exclusive, "t2", None).unwrap();
        assert_eq!(s1.index, Some(0));
        assert_eq!(s2.index, Some(1));
        assert!(matches!(
            state.reserve("a", SlotKind::Exclusive, "t3", None),
            Err(StateError::NoFreeSlot { .. })
        ));

        assert!(state.release("a", "t1"));
        let s3 = state.reserve("a", SlotKind::Exclusive, "t3", None).unwrap();
        assert_eq!(s3.index, Some(0));
    }

    #[test]
    fn exclusive_reservation_picks_a_device_with_enough_memory() {
        let device = |model: &str, memory_bytes: u64| Accelerator {
            kind: AcceleratorKind::Nvidia,
            model: model.to_string(),
            count: 1,
            memory_bytes,
            exclusive: true,
        };
        let node = NodeSpec::new("mixed", "h")
            .with_accelerator(device("small", 8 << 30))
            .with_accelerator(device("big", 48 << 30));
        let state = ClusterState::new();
        state.register(node, 0).unwrap();

        let slot = state
            .reserve("mixed", SlotKind::Exclusive, "t1", Some(40 << 30))
            .unwrap();
        assert_eq!(slot.index, Some(1));

        let err = state
            .reserve("mixed", SlotKind::Exclusive, "t2", Some(40 << 30))
            .unwrap_err();
        assert!(matches!(err, StateError::NoFittingDevice { .. }));
        assert_eq!(state.reservations(), 1);

        let view = state.snapshot(0);
        assert_eq!(view.node("mixed").unwrap().free_memory(SlotKind::Exclusive), Some(8 << 30));
    }

    #[test]
    fn reserve_is_idempotent_per_task() {
        let state = ClusterState::new();
        state.register(gpu_node("a", 1), 0).unwrap();
        let first = state.reserve("a", SlotKind::Exclusive, "t1", None).unwrap();
        let again = state.reserve("a", SlotKind::Exclusive, "t1", None).unwrap();
        assert_eq!(first, again);
        assert_eq!(state.reservations(), 1);
    }

    #[test]
    fn shared_slots_respect_limit() {
        let state = ClusterState::new();
        state
            .register(NodeSpec::new("cpu", "h").with_shared_slots(2), 0)
            .unwrap();
        state.reserve("cpu", SlotKind::Shared, "t1", None).unwrap();
        state.reserve("cpu", SlotKind::Shared, "t2", None).unwrap();
        assert!(state.reserve("cpu", SlotKind::Shared, "t3", None).is_err());

        let snap = state.snapshot(0);
        assert_eq!(snap.node("cpu").unwrap().free_shared(), 0);
    }

    #[test]
    fn release_unknown_is_noop() {
        let state = ClusterState::new();
        state.register(gpu_node("a", 1), 0).unwrap();
        let before = state.version();
        assert!(!state.release("a", "nobody"));
        assert!(!state.release("ghost", "nobody"));
        assert_eq!(state.version(), before);
    }

    #[test]
    fn versions_and_topology_floor() {
        let state = ClusterState::new();
        let v1 = state.register(gpu_node("a", 1), 0).unwrap();
        assert_eq!(state.topology_floor(), v1);

        state.apply(telemetry("a", 1, 0.2), 0).unwrap();
        state.reserve("a", SlotKind::Exclusive, "t1", None).unwrap();
        assert_eq!(state.version(), v1 + 2);
        assert_eq!(state.topology_floor(), v1);

        let old = state.snapshot(0);
        state.update_node("a", NodeUpdate::default()).unwrap();
        assert!(old.version < state.topology_floor());
        assert_eq!(state.topology_floor(), state.version());

        state.deregister("a").unwrap();
        assert_eq!(state.topology_floor(), state.version());
    }

    #[test]
    fn snapshot_is_a_copy() {
        let state = ClusterState::new();
        state.register(gpu_node("a", 1), 0).unwrap();
        let snap = state.snapshot(0);
        state.reserve("a", SlotKind::Exclusive, "t1", None).unwrap();

        assert_eq!(snap.node("a").unwrap().exclusive_in_use(), 0);
        assert_eq!(state.snapshot(0).node("a").unwrap().exclusive_in_use(), 1);
    }

    #[test]
    fn deregister_returns_slot_holders() {
        let state = ClusterState::new();
        state.register(gpu_node("a", 1), 0).unwrap();
        state.reserve("a", SlotKind::Exclusive, "t1", None).unwrap();

        let (spec, holders) = state.deregister("a").unwrap();
        assert_eq!(spec.id, "a");
        assert_eq!(holders, vec!["t1".to_string()]);
        assert!(state.snapshot(0).is_empty());
        assert_eq!(state.reservations(), 0);
    }

    #[test]
    fn slot_of_reports_holder() {
        let state = ClusterState::new();
        state.register(gpu_node("a", 1), 0).unwrap();
        state.reserve("a", SlotKind::Exclusive, "t1", None).unwrap();
        let slot = state.slot_of("a", "t1").unwrap();
        assert_eq!(slot.kind, SlotKind::Exclusive);
        assert!(state.slot_of("a", "t2").is_none());
    }
}

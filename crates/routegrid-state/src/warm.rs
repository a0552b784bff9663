//! Warm-state tracker: which models are loaded where.
//!
//! Entries are advisory scoring signals. The tracker never loads or
//! unloads anything itself; it mirrors what execution adapters report
//! and forgets entries that have not been refreshed within the TTL.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use routegrid_core::*;

const DEFAULT_WARM_TTL: Duration = Duration::from_secs(600);

/// A model loaded on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarmEntry {
    pub node_id: NodeId,
    pub model: ModelId,
    pub footprint_bytes: u64,
    pub loaded_at: Timestamp,
    pub last_used: Timestamp,
}

/// Thread-safe map of `(node, model)` to [`WarmEntry`].
pub struct WarmStateTracker {
    entries: RwLock<HashMap<(NodeId, ModelId), WarmEntry>>,
    ttl: Duration,
}

impl Default for WarmStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl WarmStateTracker {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: DEFAULT_WARM_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn ttl_millis(&self) -> u64 {
        self.ttl.as_millis() as u64
    }

    /// Record that `model` is loaded on `node`. Re-marking refreshes the
    /// entry and keeps the original load time.
    pub fn mark_loaded(&self, node_id: &str, model: &str, footprint_bytes: u64, now: Timestamp) {
        let mut entries = self.entries.write().expect("warm state lock");
        let key = (node_id.to_string(), model.to_string());
        match entries.get_mut(&key) {
            Some(entry) => {
                entry.footprint_bytes = footprint_bytes;
                entry.last_used = now;
            }
            None => {
                debug!(node = %node_id, model = %model, footprint_bytes, "model marked warm");
                entries.insert(
                    key,
                    WarmEntry {
                        node_id: node_id.to_string(),
                        model: model.to_string(),
                        footprint_bytes,
                        loaded_at: now,
                        last_used: now,
                    },
                );
            }
        }
    }

    /// Refresh `last_used` of an existing entry. Returns false if absent.
    pub fn touch(&self, node_id: &str, model: &str, now: Timestamp) -> bool {
        let mut entries = self.entries.write().expect("warm state lock");
        match entries.get_mut(&(node_id.to_string(), model.to_string())) {
            Some(entry) => {
                entry.last_used = now;
                true
            }
            None => false,
        }
    }

    pub fn mark_unloaded(&self, node_id: &str, model: &str) -> Option<WarmEntry> {
        let mut entries = self.entries.write().expect("warm state lock");
        let removed = entries.remove(&(node_id.to_string(), model.to_string()));
        if removed.is_some() {
            debug!(node = %node_id, model = %model, "model marked cold");
        }
        removed
    }

    /// Whether `model` is loaded on `node` and was refreshed within the TTL.
    pub fn is_warm(&self, node_id: &str, model: &str, now: Timestamp) -> bool {
        let entries = self.entries.read().expect("warm state lock");
        entries
            .get(&(node_id.to_string(), model.to_string()))
            .is_some_and(|e| now.saturating_sub(e.last_used) <= self.ttl_millis())
    }

    /// Drop every entry not refreshed within the TTL.
    pub fn evict_stale(&self, now: Timestamp) -> Vec<WarmEntry> {
        let ttl = self.ttl_millis();
        let mut entries = self.entries.write().expect("warm state lock");
        let expired: Vec<_> = entries
            .iter()
            .filter(|(_, e)| now.saturating_sub(e.last_used) > ttl)
            .map(|(k, _)| k.clone())
            .collect();
        let evicted: Vec<WarmEntry> = expired
            .into_iter()
            .filter_map(|k| entries.remove(&k))
            .collect();
        for entry in &evicted {
            info!(node = %entry.node_id, model = %entry.model, "evicted stale warm entry");
        }
        evicted
    }

    /// Evict least-recently-used entries on a node until their combined
    /// footprint fits in `budget_bytes`.
    pub fn evict_for_memory(&self, node_id: &str, budget_bytes: u64) -> Vec<WarmEntry> {
        let mut entries = self.entries.write().expect("warm state lock");
        let mut on_node: Vec<(Timestamp, ModelId, u64)> = entries
            .values()
            .filter(|e| e.node_id == node_id)
            .map(|e| (e.last_used, e.model.clone(), e.footprint_bytes))
            .collect();
        let mut total: u64 = on_node.iter().map(|(_, _, f)| f).sum();
        if total <= budget_bytes {
            return Vec::new();
        }

        on_node.sort();
        let mut evicted = Vec::new();
        for (_, model, footprint) in on_node {
            if total <= budget_bytes {
                break;
            }
            if let Some(entry) = entries.remove(&(node_id.to_string(), model)) {
                info!(
                    node = %node_id,
                    model = %entry.model,
                    footprint_bytes = footprint,
                    "evicted warm entry under memory pressure"
                );
                total = total.saturating_sub(footprint);
                evicted.push(entry);
            }
        }
        evicted
    }

    /// Forget everything about a node.
    pub fn remove_node(&self, node_id: &str) -> usize {
        let mut entries = self.entries.write().expect("warm state lock");
        let before = entries.len();
        entries.retain(|(node, _), _| node != node_id);
        before - entries.len()
    }

    /// Seed entries from a node's healthy service endpoints.
    pub fn seed_from_spec(&self, spec: &NodeSpec, now: Timestamp) -> usize {
        let mut seeded = 0;
        for model in spec.loaded_models() {
            self.mark_loaded(&spec.id, model, 0, now);
            seeded += 1;
        }
        seeded
    }

    /// Entries on one node, most recently used first.
    pub fn entries_for(&self, node_id: &str) -> Vec<WarmEntry> {
        let entries = self.entries.read().expect("warm state lock");
        let mut out: Vec<WarmEntry> = entries
            .values()
            .filter(|e| e.node_id == node_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.last_used.cmp(&a.last_used).then_with(|| a.model.cmp(&b.model)));
        out
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("warm state lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Immutable copy of the entries still within the TTL.
    pub fn view(&self, now: Timestamp) -> WarmView {
        let ttl = self.ttl_millis();
        let entries = self.entries.read().expect("warm state lock");
        let mut warm: HashMap<NodeId, Vec<ModelId>> = HashMap::new();
        for entry in entries.values() {
            if now.saturating_sub(entry.last_used) <= ttl {
                warm.entry(entry.node_id.clone())
                    .or_default()
                    .push(entry.model.clone());
            }
        }
        WarmView { warm }
    }
}

/// Point-in-time warm set handed to the router with a cluster snapshot.
#[derive(Debug, Clone, Default)]
pub struct WarmView {
    warm: HashMap<NodeId, Vec<ModelId>>,
}

impl WarmView {
    pub fn is_warm(&self, node_id: &str, model: &str) -> bool {
        self.warm
            .get(node_id)
            .is_some_and(|models| models.iter().any(|m| m == model))
    }

    /// Build a view directly from `(node, model)` pairs.
    pub fn from_pairs<I, N, M>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (N, M)>,
        N: Into<String>,
        M: Into<String>,
    {
        let mut warm: HashMap<NodeId, Vec<ModelId>> = HashMap::new();
        for (node, model) in pairs {
            warm.entry(node.into()).or_default().push(model.into());
        }
        Self { warm }
    }
}

/// Memory a node can devote to warm models: its largest accelerator
/// memory, else its system memory.
pub fn warm_budget(spec: &NodeSpec) -> Option<u64> {
    spec.max_accelerator_memory().or(spec.memory_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_and_query() {
        let warm = WarmStateTracker::new();
        warm.mark_loaded("a", "m1", 10, 0);
        assert!(warm.is_warm("a", "m1", 0));
        assert!(!warm.is_warm("a", "m2", 0));
        assert!(!warm.is_warm("b", "m1", 0));
    }

    #[test]
    fn unique_per_node_and_model() {
        let warm = WarmStateTracker::new();
        warm.mark_loaded("a", "m1", 10, 0);
        warm.mark_loaded("a", "m1", 20, 50);
        assert_eq!(warm.len(), 1);

        let entries = warm.entries_for("a");
        assert_eq!(entries[0].footprint_bytes, 20);
        assert_eq!(entries[0].loaded_at, 0);
        assert_eq!(entries[0].last_used, 50);
    }

    #[test]
    fn entries_past_ttl_are_not_warm() {
        let warm = WarmStateTracker::new().with_ttl(Duration::from_secs(1));
        warm.mark_loaded("a", "m1", 0, 0);
        assert!(warm.is_warm("a", "m1", 1_000));
        assert!(!warm.is_warm("a", "m1", 1_001));
        assert!(!warm.view(1_001).is_warm("a", "m1"));
    }

    #[test]
    fn evict_stale_removes_expired_only() {
        let warm = WarmStateTracker::new().with_ttl(Duration::from_secs(1));
        warm.mark_loaded("a", "old", 0, 0);
        warm.mark_loaded("a", "new", 0, 2_000);

        let evicted = warm.evict_stale(2_500);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].model, "old");
        assert!(warm.is_warm("a", "new", 2_500));
    }

    #[test]
    fn touch_refreshes() {
        let warm = WarmStateTracker::new().with_ttl(Duration::from_secs(1));
        warm.mark_loaded("a", "m1", 0, 0);
        assert!(warm.touch("a", "m1", 900));
        assert!(warm.is_warm("a", "m1", 1_800));
        assert!(!warm.touch("a", "missing", 0));
    }

    #[test]
    fn memory_pressure_evicts_lru_first() {
        let warm = WarmStateTracker::new();
        warm.mark_loaded("a", "m1", 10, 1);
        warm.mark_loaded("a", "m2", 10, 3);
        warm.mark_loaded("a", "m3", 10, 2);
        warm.mark_loaded("b", "m1", 100, 0);

        let evicted = warm.evict_for_memory("a", 15);
        let models: Vec<_> = evicted.iter().map(|e| e.model.as_str()).collect();
        assert_eq!(models, vec!["m1", "m3"]);
        assert!(warm.is_warm("a", "m2", 3));
        assert!(warm.is_warm("b", "m1", 0));
    }

    #[test]
    fn within_budget_evicts_nothing() {
        let warm = WarmStateTracker::new();
        warm.mark_loaded("a", "m1", 10, 0);
        assert!(warm.evict_for_memory("a", 10).is_empty());
    }

    #[test]
    fn seed_from_healthy_services() {
        let mut spec = NodeSpec::new("a", "h");
        spec.services = vec![ServiceEndpoint {
            name: "vllm".to_string(),
            port: 8000,
            protocol: "http".to_string(),
            models: vec!["llama".to_string(), "mistral".to_string()],
            healthy: true,
        }];
        let warm = WarmStateTracker::new();
        assert_eq!(warm.seed_from_spec(&spec, 0), 2);
        assert!(warm.is_warm("a", "llama", 0));
    }

    #[test]
    fn remove_node_forgets_entries() {
        let warm = WarmStateTracker::new();
        warm.mark_loaded("a", "m1", 0, 0);
        warm.mark_loaded("a", "m2", 0, 0);
        warm.mark_loaded("b", "m1", 0, 0);
        assert_eq!(warm.remove_node("a"), 2);
        assert_eq!(warm.len(), 1);
    }

    #[test]
    fn view_from_pairs() {
        let view = WarmView::from_pairs([("a", "m1")]);
        assert!(view.is_warm("a", "m1"));
        assert!(!view.is_warm("a", "m2"));
    }
}

//! Cluster document parser (`cluster.toml`).
//!
//! The document declares the cluster's nodes and, optionally, the engine's
//! tuning knobs. Every table rejects unknown keys so typos fail loudly at
//! load time instead of being silently ignored.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::duration::serde_str;
use crate::error::{ConfigError, ConfigResult};
use crate::types::*;

const GIB: f64 = (1u64 << 30) as f64;

/// Tag format accepted for capabilities.
const CAPABILITY_PATTERN: &str = r"^[a-z0-9][a-z0-9._-]*$";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterDocument {
    pub cluster: ClusterMeta,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterMeta {
    pub name: String,
    /// Address of the hypervisor control plane managing these nodes.
    pub hypervisor_host: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub id: String,
    pub host: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub accelerators: Vec<AcceleratorConfig>,
    /// Defaults to 0 when the node has exclusive accelerators, else 1.
    pub shared_slots: Option<u32>,
    pub memory_gb: Option<f64>,
    pub latency_ms: Option<u32>,
    pub cost_per_hour: Option<f64>,
    pub executor: Option<String>,
    #[serde(default)]
    pub power_state: PowerState,
    #[serde(default)]
    pub services: Vec<ServiceEndpoint>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AcceleratorConfig {
    pub kind: AcceleratorKind,
    pub model: String,
    #[serde(default = "default_count")]
    pub count: u32,
    /// Memory per device.
    pub memory_gb: Option<f64>,
    #[serde(default = "default_exclusive")]
    pub exclusive: bool,
}

fn default_kind() -> String {
    "generic".to_string()
}

fn default_count() -> u32 {
    1
}

fn default_exclusive() -> bool {
    true
}

impl ClusterDocument {
    /// Read, parse and validate a cluster document from disk.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a cluster document.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let doc: ClusterDocument = toml::from_str(content)?;
        doc.engine.validate()?;
        doc.node_specs()?;
        Ok(doc)
    }

    /// Convert the declared nodes into validated [`NodeSpec`]s.
    pub fn node_specs(&self) -> ConfigResult<Vec<NodeSpec>> {
        let pattern = Regex::new(CAPABILITY_PATTERN)?;
        let mut seen = HashSet::new();
        let mut specs = Vec::with_capacity(self.nodes.len());

        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(ConfigError::DuplicateNode(node.id.clone()));
            }
            specs.push(node.to_spec(&pattern)?);
        }
        Ok(specs)
    }
}

impl NodeConfig {
    fn to_spec(&self, pattern: &Regex) -> ConfigResult<NodeSpec> {
        let invalid = |reason: String| ConfigError::InvalidNode {
            node: self.id.clone(),
            reason,
        };

        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty".to_string()));
        }
        if self.host.trim().is_empty() {
            return Err(invalid("host must not be empty".to_string()));
        }

        let mut capabilities = CapabilitySet::new();
        for tag in &self.capabilities {
            if !pattern.is_match(tag) {
                return Err(ConfigError::InvalidCapability {
                    tag: tag.clone(),
                    owner: format!("node {}", self.id),
                });
            }
            capabilities.insert(Capability::new(tag.as_str()));
        }

        let mut accelerators = Vec::with_capacity(self.accelerators.len());
        for acc in &self.accelerators {
            if acc.count == 0 {
                return Err(invalid(format!("accelerator {} has count 0", acc.model)));
            }
            let memory_bytes = gib_to_bytes(acc.memory_gb.unwrap_or(0.0))
                .ok_or_else(|| invalid(format!("accelerator {} memory_gb is invalid", acc.model)))?;
            accelerators.push(Accelerator {
                kind: acc.kind,
                model: acc.model.clone(),
                count: acc.count,
                memory_bytes,
                exclusive: acc.exclusive,
            });
        }

        let memory_bytes = match self.memory_gb {
            Some(gb) => Some(gib_to_bytes(gb).ok_or_else(|| invalid("memory_gb is invalid".to_string()))?),
            None => None,
        };
        if self.cost_per_hour.is_some_and(|c| !c.is_finite() || c < 0.0) {
            return Err(invalid("cost_per_hour must be finite and non-negative".to_string()));
        }

        let has_exclusive = accelerators.iter().any(|a| a.exclusive);
        let shared_slots = self
            .shared_slots
            .unwrap_or(if has_exclusive { 0 } else { 1 });

        Ok(NodeSpec {
            id: self.id.clone(),
            host: self.host.clone(),
            kind: self.kind.clone(),
            accelerators,
            capabilities,
            shared_slots,
            memory_bytes,
            latency_ms: self.latency_ms,
            cost_per_hour: self.cost_per_hour,
            executor: self.executor.clone(),
            power_state: self.power_state,
            services: self.services.clone(),
        })
    }
}

fn gib_to_bytes(gb: f64) -> Option<u64> {
    if gb.is_finite() && gb >= 0.0 {
        Some((gb * GIB) as u64)
    } else {
        None
    }
}

// ── Engine tuning ─────────────────────────────────────────────────

/// Tuning knobs for the scheduling engine. Every field has a default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub routing: RoutingConfig,
    pub cluster: ClusterTuning,
    pub scheduler: SchedulerConfig,
}

/// Weights for the routing score components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoutingWeights {
    pub utilization: f64,
    pub warm: f64,
    pub latency: f64,
    pub cost: f64,
}

impl Default for RoutingWeights {
    fn default() -> Self {
        Self {
            utilization: 1.0,
            warm: 0.5,
            latency: 0.2,
            cost: 0.1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoutingConfig {
    pub weights: RoutingWeights,
    /// Maximum number of nodes tried for one decision before giving up.
    pub fallback_chain: u32,
    /// Route to stale nodes when no fresh candidate exists.
    pub allow_degraded: bool,
    /// Latency that maps to a full latency penalty.
    #[serde(with = "serde_str")]
    pub latency_budget: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            weights: RoutingWeights::default(),
            fallback_chain: 3,
            allow_degraded: false,
            latency_budget: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterTuning {
    /// A node without telemetry for longer than this is stale.
    #[serde(with = "serde_str")]
    pub staleness_window: Duration,
    /// A warm entry not refreshed for longer than this is evicted.
    #[serde(with = "serde_str")]
    pub warm_ttl: Duration,
}

impl Default for ClusterTuning {
    fn default() -> Self {
        Self {
            staleness_window: Duration::from_secs(30),
            warm_ttl: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    pub queue_capacity: usize,
    /// Consecutive busy outcomes before a task is held with backoff.
    pub max_busy_retries: u32,
    #[serde(with = "serde_str")]
    pub backoff_base: Duration,
    #[serde(with = "serde_str")]
    pub backoff_max: Duration,
    /// Preemption needs a priority gap strictly larger than this.
    pub preemption_gap: u8,
    #[serde(with = "serde_str")]
    pub max_queue_wait: Duration,
    #[serde(with = "serde_str")]
    pub max_execution_time: Duration,
    #[serde(with = "serde_str")]
    pub cancel_grace: Duration,
    /// Adapter rejections tolerated before a task fails.
    pub max_dispatch_retries: u32,
    /// How long terminal tasks stay queryable.
    #[serde(with = "serde_str")]
    pub history_retention: Duration,
    pub decision_log_capacity: usize,
    #[serde(with = "serde_str")]
    pub tick_interval: Duration,
    pub stale_snapshot_retries: u32,
    /// Capacity of the coordinator's request channel.
    pub request_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_busy_retries: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            preemption_gap: 2,
            max_queue_wait: Duration::from_secs(600),
            max_execution_time: Duration::from_secs(3600),
            cancel_grace: Duration::from_secs(10),
            max_dispatch_retries: 5,
            history_retention: Duration::from_secs(900),
            decision_log_capacity: 1000,
            tick_interval: Duration::from_millis(100),
            stale_snapshot_retries: 3,
            request_buffer: 256,
        }
    }
}

impl EngineConfig {
    /// Reject settings the engine cannot operate with.
    pub fn validate(&self) -> ConfigResult<()> {
        let w = &self.routing.weights;
        for (field, value) in [
            ("routing.weights.utilization", w.utilization),
            ("routing.weights.warm", w.warm),
            ("routing.weights.latency", w.latency),
            ("routing.weights.cost", w.cost),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidSetting {
                    field,
                    reason: format!("{value} must be finite and non-negative"),
                });
            }
        }
        if self.routing.fallback_chain == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "routing.fallback_chain",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.routing.latency_budget.is_zero() {
            return Err(ConfigError::InvalidSetting {
                field: "routing.latency_budget",
                reason: "must be greater than zero".to_string(),
            });
        }
        let s = &self.scheduler;
        if s.queue_capacity == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "scheduler.queue_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if s.request_buffer == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "scheduler.request_buffer",
                reason: "must be at least 1".to_string(),
            });
        }
        if s.tick_interval.is_zero() {
            return Err(ConfigError::InvalidSetting {
                field: "scheduler.tick_interval",
                reason: "must be greater than zero".to_string(),
            });
        }
        if s.backoff_max < s.backoff_base {
            return Err(ConfigError::InvalidSetting {
                field: "scheduler.backoff_max",
                reason: "must not be smaller than backoff_base".to_string(),
            });
        }
        Ok(())
    }
}

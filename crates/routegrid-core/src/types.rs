//! Domain types for cluster nodes and their hardware.
//!
//! A [`NodeSpec`] is the operator-declared description of a node; a
//! [`NodeMetrics`] is what telemetry drivers push about it at runtime.

use std::collections::BTreeSet;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Unique identifier for a node in the cluster.
pub type NodeId = String;

/// Unique identifier for a submitted task.
pub type TaskId = String;

/// Identifier of a model or workload that can be loaded on a node.
pub type ModelId = String;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}

// ── Capability ────────────────────────────────────────────────────

/// An opaque tag declaring what kind of task a node can run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(String);

impl Capability {
    pub const LLM_INFERENCE: &'static str = "llm-inference";
    pub const IMAGE_GENERATION: &'static str = "image-generation";
    pub const VIDEO_GENERATION: &'static str = "video-generation";
    pub const SPEECH_TO_TEXT: &'static str = "speech-to-text";
    pub const EMBEDDINGS: &'static str = "embeddings";
    pub const TRAINING: &'static str = "training";
    pub const PREPROCESSING: &'static str = "preprocessing";
    pub const STORAGE: &'static str = "storage";

    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Capability {
    fn from(tag: &str) -> Self {
        Self(tag.to_string())
    }
}

/// Ordered set of capability tags.
pub type CapabilitySet = BTreeSet<Capability>;

/// Build a [`CapabilitySet`] from string tags.
pub fn capability_set<I, S>(tags: I) -> CapabilitySet
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    tags.into_iter().map(|t| Capability::new(t)).collect()
}

// ── Accelerator ───────────────────────────────────────────────────

/// Hardware class of an accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceleratorKind {
    Nvidia,
    Tenstorrent,
    Amd,
    Intel,
    Cpu,
}

/// A group of identical accelerator devices on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Accelerator {
    pub kind: AcceleratorKind,
    pub model: String,
    /// Number of physical devices in this group.
    pub count: u32,
    /// Memory capacity per device in bytes.
    pub memory_bytes: u64,
    /// Whether one task monopolizes a device while it runs.
    pub exclusive: bool,
}

// ── Node ──────────────────────────────────────────────────────────

/// Declared power state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    On,
    Off,
    Sleeping,
    #[default]
    Unknown,
}

impl PowerState {
    /// Whether tasks may be routed to a node in this state.
    pub fn is_available(self) -> bool {
        matches!(self, PowerState::On | PowerState::Unknown)
    }
}

/// A service running on a node (vLLM, Triton, Whisper, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceEndpoint {
    pub name: String,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Models this service has loaded.
    #[serde(default)]
    pub models: Vec<ModelId>,
    #[serde(default)]
    pub healthy: bool,
}

fn default_protocol() -> String {
    "http".to_string()
}

/// Operator-declared description of a cluster node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub host: String,
    /// Declared type tag (e.g. "gpu-workstation", "edge").
    pub kind: String,
    pub accelerators: Vec<Accelerator>,
    pub capabilities: CapabilitySet,
    /// Concurrent tasks allowed on sharable (CPU) capacity.
    pub shared_slots: u32,
    /// System memory in bytes, if declared.
    pub memory_bytes: Option<u64>,
    /// Network latency hint from the coordinator to this node.
    pub latency_ms: Option<u32>,
    /// Relative cost of running on this node.
    pub cost_per_hour: Option<f64>,
    /// Execution strategy key ("container", "vm", "ssh", "http").
    pub executor: Option<String>,
    pub power_state: PowerState,
    pub services: Vec<ServiceEndpoint>,
}

impl NodeSpec {
    /// A node with no accelerators, no capabilities and one shared slot.
    pub fn new(id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            kind: "generic".to_string(),
            accelerators: Vec::new(),
            capabilities: CapabilitySet::new(),
            shared_slots: 1,
            memory_bytes: None,
            latency_ms: None,
            cost_per_hour: None,
            executor: None,
            power_state: PowerState::Unknown,
            services: Vec::new(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.extend(capability_set(tags));
        self
    }

    pub fn with_accelerator(mut self, accelerator: Accelerator) -> Self {
        self.accelerators.push(accelerator);
        self
    }

    pub fn with_shared_slots(mut self, slots: u32) -> Self {
        self.shared_slots = slots;
        self
    }

    /// Number of exclusive slots (one per exclusive device).
    pub fn exclusive_slots(&self) -> u32 {
        self.accelerators
            .iter()
            .filter(|a| a.exclusive)
            .map(|a| a.count)
            .sum()
    }

    /// Whether this node advertises every capability in `required`.
    pub fn advertises(&self, required: &CapabilitySet) -> bool {
        required.is_subset(&self.capabilities)
    }

    /// Physical devices in declaration order, one entry per device.
    ///
    /// Telemetry `accelerators` are indexed against this list.
    pub fn devices(&self) -> Vec<&Accelerator> {
        self.accelerators
            .iter()
            .flat_map(|a| std::iter::repeat_n(a, a.count as usize))
            .collect()
    }

    /// Device behind each exclusive slot, with its index into
    /// [`devices`](Self::devices). Slot `i` is entry `i`.
    pub fn exclusive_devices(&self) -> Vec<(usize, &Accelerator)> {
        self.devices()
            .into_iter()
            .enumerate()
            .filter(|(_, d)| d.exclusive)
            .collect()
    }

    /// Free memory of the device behind exclusive slot `slot`. Falls back
    /// to declared capacity when telemetry has not reported it.
    pub fn slot_memory(&self, slot: u32, metrics: &NodeMetrics) -> Option<u64> {
        let devices = self.exclusive_devices();
        let (idx, device) = devices.get(slot as usize)?;
        let free = metrics
            .accelerators
            .get(*idx)
            .and_then(|m| m.memory_free_bytes)
            .unwrap_or(device.memory_bytes);
        Some(free)
    }

    /// Largest per-device accelerator memory on this node.
    pub fn max_accelerator_memory(&self) -> Option<u64> {
        self.accelerators.iter().map(|a| a.memory_bytes).max()
    }

    /// Models advertised by healthy services on this node.
    pub fn loaded_models(&self) -> impl Iterator<Item = &ModelId> {
        self.services
            .iter()
            .filter(|s| s.healthy)
            .flat_map(|s| s.models.iter())
    }
}

// ── Telemetry ─────────────────────────────────────────────────────

/// Live metrics for one accelerator device. `None` means unknown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcceleratorMetrics {
    /// Busy fraction in `[0, 1]`.
    pub busy: Option<f64>,
    pub memory_free_bytes: Option<u64>,
    pub temperature_c: Option<f64>,
}

/// Live utilization metrics for a node. `None` means unknown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    /// CPU busy fraction in `[0, 1]`.
    pub cpu: Option<f64>,
    pub memory_free_bytes: Option<u64>,
    /// Per-device metrics, indexed like [`NodeSpec::devices`].
    pub accelerators: Vec<AcceleratorMetrics>,
}

impl NodeMetrics {
    /// Check that every known fraction lies in `[0, 1]`.
    pub fn validate(&self) -> Result<(), String> {
        check_fraction("cpu", self.cpu)?;
        for (idx, acc) in self.accelerators.iter().enumerate() {
            check_fraction(&format!("accelerators[{idx}].busy"), acc.busy)?;
            if acc.temperature_c.is_some_and(|t| !t.is_finite()) {
                return Err(format!("accelerators[{idx}].temperature_c is not finite"));
            }
        }
        Ok(())
    }
}

fn check_fraction(field: &str, value: Option<f64>) -> Result<(), String> {
    match value {
        Some(v) if !(0.0..=1.0).contains(&v) => Err(format!("{field} = {v} is outside [0, 1]")),
        _ => Ok(()),
    }
}

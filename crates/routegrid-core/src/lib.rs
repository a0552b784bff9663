//! routegrid-core: shared domain types and configuration for RouteGrid.
//!
//! Every other crate in the workspace speaks in these types:
//!
//! - **`types`**: nodes, accelerators, capability tags, telemetry metrics
//! - **`task`**: task intents (`TaskSpec`), priorities, placement constraints
//! - **`config`**: the declarative cluster document and engine tuning knobs
//! - **`duration`**: human-readable duration strings (`"500ms"`, `"30s"`)

pub mod config;
pub mod duration;
pub mod error;
pub mod task;
pub mod types;

pub use config::{
    ClusterDocument, ClusterTuning, EngineConfig, RoutingConfig, RoutingWeights, SchedulerConfig,
};
pub use error::{ConfigError, ConfigResult};
pub use task::*;
pub use types::*;

//! Error types for cluster document loading and validation.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating the cluster document.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse cluster document: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("invalid capability tag {tag:?} on {owner}")]
    InvalidCapability { tag: String, owner: String },

    #[error("invalid node {node}: {reason}")]
    InvalidNode { node: String, reason: String },

    #[error("invalid engine setting {field}: {reason}")]
    InvalidSetting { field: &'static str, reason: String },

    #[error("capability pattern: {0}")]
    Pattern(#[from] regex::Error),
}

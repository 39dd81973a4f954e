// Tailer Configuration
//
// Connection and metric settings for oplog tailing, loaded from
// JSON. Missing fields fall back to the built-in defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::log::ReadMode;

/// Collection name used when the topology cannot report one.
pub const FALLBACK_OPLOG_COLLECTION: &str = "oplog.rs";

/// Subsystem shared by every tailer metric.
pub const METRIC_SUBSYSTEM: &str = "oplogtail";

/// Errors produced while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tailer configuration loaded from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TailConfig {
    /// Socket timeout for the tailing session.
    ///
    /// Kept long so the tailer does not keep reopening cursors, which
    /// takes locks on the source and slows the oplog down.
    pub socket_timeout_secs: u64,

    pub read_mode: ReadMode,

    /// Count entries written by chunk migrations (`fromMigrate`).
    pub include_migrations: bool,

    /// Overrides the collection name reported by the topology.
    pub oplog_collection_name: Option<String>,

    /// Prefix of every exported metric name.
    pub metric_namespace: String,
}

impl TailConfig {
    /// Default built-in config (used if no config is provided).
    pub fn default_config() -> Self {
        Self {
            socket_timeout_secs: 120,
            read_mode: ReadMode::Monotonic,
            include_migrations: true,
            oplog_collection_name: None,
            metric_namespace: "mongodb".into(),
        }
    }

    /// Parse and validate a JSON document.
    pub fn from_json(data: &str) -> Result<Self, ConfigError> {
        let config: TailConfig = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.socket_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "socket_timeout_secs must be positive".into(),
            ));
        }

        let namespace_ok = self
            .metric_namespace
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && self
                .metric_namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !namespace_ok {
            return Err(ConfigError::Invalid(format!(
                "metric_namespace {:?} is not a valid metric name prefix",
                self.metric_namespace
            )));
        }

        if matches!(&self.oplog_collection_name, Some(name) if name.is_empty()) {
            return Err(ConfigError::Invalid(
                "oplog_collection_name must not be empty".into(),
            ));
        }

        Ok(())
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }
}

impl Default for TailConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

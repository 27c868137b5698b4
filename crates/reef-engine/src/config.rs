//! TOML configuration for a Reef coordinator.
//!
//! Every section is `#[serde(default)]`, so an empty file yields the
//! defaults and a file only names what it overrides:
//!
//! ```toml
//! [recovery]
//! max_concurrent = 4
//! max_bytes_per_sec = 10485760
//!
//! [allocation]
//! rebalance_enabled = false
//!
//! [log]
//! level = "debug"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use reef_types::{AllocationConfig, RecoveryConfig};
use serde::{Deserialize, Serialize};

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReefConfig {
    /// Recovery session tuning.
    pub recovery: RecoveryConfig,
    /// Planner tuning.
    pub allocation: AllocationConfig,
    /// Request routing.
    pub routing: RoutingSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[routing]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSection {
    /// How long a request waits for a blocked shard.
    pub timeout_ms: u64,
}

impl RoutingSection {
    /// The routing timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self { timeout_ms: 5_000 }
    }
}

/// `[log]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"reef_recovery=trace"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The TOML did not parse.
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ReefConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse config from a TOML string.
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }
}

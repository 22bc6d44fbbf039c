//! Hub configuration loaded from TOML.
//!
//! # Responsibility
//! - Describe where the metadata store and external SQL stores live.
//! - Carry logging and publish tuning knobs.
//!
//! # Invariants
//! - Store names are valid identifiers and unique.
//! - Every optional key has a default.

use crate::logging::{default_log_level, LogLevel};
use crate::model::application::is_valid_name;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Path value that selects an in-memory SQLite database.
pub const IN_MEMORY_PATH: &str = ":memory:";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config `{path}`: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HubConfig {
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub stores: Vec<StoreConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetadataConfig {
    #[serde(default = "default_metadata_path")]
    pub path: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            path: default_metadata_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl MetadataConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn is_in_memory(&self) -> bool {
        self.path == IN_MEMORY_PATH
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    /// No file logging when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublishConfig {
    #[serde(default = "default_invalidation_timeout_ms")]
    pub invalidation_timeout_ms: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            invalidation_timeout_ms: default_invalidation_timeout_ms(),
        }
    }
}

impl PublishConfig {
    pub fn invalidation_timeout(&self) -> Duration {
        Duration::from_millis(self.invalidation_timeout_ms)
    }
}

/// One external SQL store.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    pub name: String,
    pub path: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl StoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn default_metadata_path() -> String {
    IN_MEMORY_PATH.to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_invalidation_timeout_ms() -> u64 {
    2_000
}

impl HubConfig {
    /// Reads and validates a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.metadata.path.trim().is_empty() {
            return Err(ConfigError::Invalid("metadata.path must not be empty".to_string()));
        }
        let mut seen = HashSet::new();
        for store in &self.stores {
            if !is_valid_name(&store.name) {
                return Err(ConfigError::Invalid(format!(
                    "store name `{}` is not a valid identifier",
                    store.name
                )));
            }
            if !seen.insert(store.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "store `{}` is configured twice",
                    store.name
                )));
            }
            if store.path.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "store `{}` has an empty path",
                    store.name
                )));
            }
        }
        Ok(())
    }
}

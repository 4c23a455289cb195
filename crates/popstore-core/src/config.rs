//! Construction-time configuration for stores and their persistence.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while validating configuration values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Static configuration for an entity store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Number of population partitions, fixed for the store's lifetime.
    pub population_count: usize,
    /// Opaque run label copied into persisted records; never affects behaviour.
    pub mode_label: String,
    /// Entities to reserve room for up front.
    pub capacity_hint: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            population_count: 3,
            mode_label: "search".to_string(),
            capacity_hint: 1_024,
        }
    }
}

impl StoreConfig {
    /// Convenience constructor used by drivers that only set the essentials.
    #[must_use]
    pub fn new(population_count: usize, mode_label: impl Into<String>) -> Self {
        Self {
            population_count,
            mode_label: mode_label.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.population_count == 0 {
            return Err(ConfigError::Invalid("population_count must be positive"));
        }
        if self.population_count > u32::MAX as usize {
            return Err(ConfigError::Invalid("population_count must fit in u32"));
        }
        Ok(())
    }
}

/// Durable event log settings. A missing `path` disables persistence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PersistenceConfig {
    pub path: Option<PathBuf>,
    /// Lifecycle events staged locally before being handed to the writer.
    pub event_batch: usize,
    /// Snapshot rows staged locally before being handed to the writer.
    pub snapshot_batch: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            path: None,
            event_batch: 512,
            snapshot_batch: 64,
        }
    }
}

impl PersistenceConfig {
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.event_batch == 0 {
            return Err(ConfigError::Invalid("event_batch must be positive"));
        }
        if self.snapshot_batch == 0 {
            return Err(ConfigError::Invalid("snapshot_batch must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_populations_rejected() {
        let config = StoreConfig::new(0, "search");
        assert_eq!(
            config.validate(),
            Err(ConfigError::Invalid("population_count must be positive"))
        );
        assert!(StoreConfig::default().validate().is_ok());
    }

    #[test]
    fn persistence_defaults_to_disabled() {
        let config = PersistenceConfig::default();
        assert!(!config.is_enabled());
        assert!(config.validate().is_ok());
        assert!(PersistenceConfig::at("run.duckdb").is_enabled());

        let bad = PersistenceConfig {
            event_batch: 0,
            ..PersistenceConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: StoreConfig =
            serde_json::from_str(r#"{ "population_count": 5 }"#).expect("parse");
        assert_eq!(config.population_count, 5);
        assert_eq!(config.mode_label, "search");
    }
}

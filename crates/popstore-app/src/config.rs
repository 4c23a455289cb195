//! Driver configuration, loadable from TOML.

use popstore_core::{ConfigError, PersistenceConfig, StoreConfig};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Tunables for one churn run.
///
/// ```toml
/// cycles = 2000
/// seed = 7
///
/// [store]
/// population_count = 3
///
/// [persistence]
/// path = "churn.duckdb"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DriverConfig {
    pub store: StoreConfig,
    pub persistence: PersistenceConfig,
    /// Upper bound on cycles; the run may stop earlier.
    pub cycles: u64,
    /// Seed for the driver RNG. Equal seeds replay equal runs.
    pub seed: u64,
    /// Entities seeded into population 0 before the first cycle.
    pub initial_entities: usize,
    pub initial_energy: f64,
    /// Stop once the store holds more than this many entities.
    pub population_cap: usize,
    /// Relative per-cycle energy noise, drawn uniformly from `[-drift, drift]`.
    pub energy_drift: f64,
    pub compose_chance: f64,
    pub decompose_chance: f64,
    pub reproduce_chance: f64,
    /// Base entities need at least this much energy to reproduce.
    pub reproduce_threshold: f64,
    /// Entities below this energy are removed at the end of each cycle.
    pub decay_threshold: f64,
    /// Cycles between snapshots; zero disables them.
    pub snapshot_interval: u64,
    pub snapshot_history: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            persistence: PersistenceConfig::default(),
            cycles: 1_000,
            seed: 0x5EED_0F_C0FFEE,
            initial_entities: 200,
            initial_energy: 1.0,
            population_cap: 30_000,
            energy_drift: 0.08,
            compose_chance: 0.02,
            decompose_chance: 0.01,
            reproduce_chance: 0.05,
            reproduce_threshold: 1.2,
            decay_threshold: 0.1,
            snapshot_interval: 100,
            snapshot_history: 64,
        }
    }
}

impl DriverConfig {
    /// Parse a TOML document; missing keys fall back to defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.store.validate()?;
        self.persistence.validate()?;
        for chance in [
            self.compose_chance,
            self.decompose_chance,
            self.reproduce_chance,
        ] {
            if !(0.0..=1.0).contains(&chance) {
                return Err(ConfigError::Invalid("chances must lie in [0, 1]"));
            }
        }
        if !self.energy_drift.is_finite() || !(0.0..1.0).contains(&self.energy_drift) {
            return Err(ConfigError::Invalid("energy_drift must lie in [0, 1)"));
        }
        if !self.initial_energy.is_finite() || self.initial_energy < 0.0 {
            return Err(ConfigError::Invalid(
                "initial_energy must be finite and non-negative",
            ));
        }
        if !self.decay_threshold.is_finite() || !self.reproduce_threshold.is_finite() {
            return Err(ConfigError::Invalid("thresholds must be finite"));
        }
        Ok(())
    }
}

//! The churn loop.

use crate::config::DriverConfig;
use popstore_core::{
    ConfigError, Cycle, Entity, EntityHandle, EntityId, EntityStore, PersistenceAdapter,
    PopulationId, Snapshot, SnapshotExporter, StoreError,
};
use rand::{Rng, SeedableRng, rngs::SmallRng, seq::SliceRandom};
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("store was configured with {store} populations, driver with {driver}")]
    PopulationMismatch { store: usize, driver: usize },
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    Extinct,
    CapReached,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Completed => "completed",
            Self::Extinct => "extinct",
            Self::CapReached => "cap reached",
        })
    }
}

/// Outcome of [`ChurnDriver::run`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub cycles: u64,
    pub stop: StopReason,
    pub population_counts: Vec<usize>,
    pub created: u64,
    pub removed: u64,
    pub failed_writes: u64,
}

/// Per-cycle counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    pub composed: usize,
    pub decomposed: usize,
    pub born: usize,
    pub decayed: usize,
}

/// Drives a store through repeated churn cycles.
pub struct ChurnDriver<P: PersistenceAdapter> {
    config: DriverConfig,
    store: EntityStore<P>,
    rng: SmallRng,
    exporter: SnapshotExporter,
    serial: u64,
    created: u64,
    removed: u64,
}

impl<P: PersistenceAdapter> ChurnDriver<P> {
    pub fn new(config: DriverConfig, store: EntityStore<P>) -> Result<Self, DriverError> {
        config.validate()?;
        if store.population_count() != config.store.population_count {
            return Err(DriverError::PopulationMismatch {
                store: store.population_count(),
                driver: config.store.population_count,
            });
        }
        let rng = SmallRng::seed_from_u64(config.seed);
        let exporter = SnapshotExporter::new(config.snapshot_interval, config.snapshot_history);
        Ok(Self {
            config,
            store,
            rng,
            exporter,
            serial: 0,
            created: 0,
            removed: 0,
        })
    }

    #[must_use]
    pub fn store(&self) -> &EntityStore<P> {
        &self.store
    }

    #[must_use]
    pub fn exporter(&self) -> &SnapshotExporter {
        &self.exporter
    }

    /// Give the store back, e.g. to close it explicitly.
    #[must_use]
    pub fn into_store(self) -> EntityStore<P> {
        self.store
    }

    /// Seed population 0 with `initial_entities` entities of `initial_energy`.
    pub fn seed(&mut self) -> Result<(), DriverError> {
        let base = PopulationId(0);
        for _ in 0..self.config.initial_entities {
            let id = self.next_id();
            let entity = Entity::new(id, base, self.config.initial_energy).with_meta("origin", "seed");
            self.add(entity, base)?;
        }
        self.capture();
        info!(
            entities = self.store.len(),
            populations = self.store.population_count(),
            "seeded store"
        );
        Ok(())
    }

    /// Run cycles until the configured count, extinction, or the cap.
    pub fn run(&mut self) -> Result<RunSummary, DriverError> {
        let mut stop = StopReason::Completed;
        for _ in 0..self.config.cycles {
            let stats = self.step()?;
            debug!(
                cycle = self.store.cycle().0,
                live = self.store.len(),
                composed = stats.composed,
                decomposed = stats.decomposed,
                born = stats.born,
                decayed = stats.decayed,
                "cycle finished"
            );
            if self.store.is_empty() {
                stop = StopReason::Extinct;
                break;
            }
            if self.store.len() > self.config.population_cap {
                stop = StopReason::CapReached;
                break;
            }
        }
        self.store.flush();
        let summary = self.summary(stop);
        info!(
            cycles = summary.cycles,
            stop = %summary.stop,
            live = self.store.len(),
            created = summary.created,
            removed = summary.removed,
            failed_writes = summary.failed_writes,
            "run finished"
        );
        Ok(summary)
    }

    /// One full cycle, then advance the clock and snapshot on boundaries.
    pub fn step(&mut self) -> Result<CycleStats, DriverError> {
        let mut stats = CycleStats::default();
        self.update_energy()?;
        stats.composed = self.compose()?;
        stats.decomposed = self.decompose()?;
        stats.born = self.reproduce()?;
        stats.decayed = self.decay()?;
        self.store.advance_cycle();
        self.capture();
        Ok(stats)
    }

    fn update_energy(&mut self) -> Result<(), DriverError> {
        let drift = self.config.energy_drift;
        let Self { store, rng, .. } = self;
        for index in 0..store.population_count() {
            store.for_each_mut(PopulationId(index as u32), |entity| {
                let factor = if drift > 0.0 {
                    1.0 + rng.gen_range(-drift..=drift)
                } else {
                    1.0
                };
                entity.energy = (entity.energy * factor).max(0.0);
            })?;
        }
        Ok(())
    }

    /// Merge random pairs of population `p` into one entity of `p + 1`.
    fn compose(&mut self) -> Result<usize, DriverError> {
        let mut composed = 0;
        for index in 1..self.store.population_count() {
            let (lower, upper) = (PopulationId(index as u32 - 1), PopulationId(index as u32));
            let mut handles = self.store.get_population_agents(lower)?;
            handles.shuffle(&mut self.rng);
            for pair in handles.chunks_exact(2) {
                if !self.rng.gen_bool(self.config.compose_chance) {
                    continue;
                }
                let (Some(left), Some(right)) = (self.take(pair[0], lower)?, self.take(pair[1], lower)?)
                else {
                    continue;
                };
                let id = self.next_id();
                let child = Entity::new(id, upper, left.energy + right.energy)
                    .with_depth(left.depth.max(right.depth) + 1)
                    .with_meta("origin", "composed")
                    .with_meta("parents", format!("{}|{}", left.id(), right.id()));
                self.add(child, upper)?;
                composed += 1;
            }
        }
        Ok(composed)
    }

    /// Split random members of population `p > 0` into two of `p - 1`.
    fn decompose(&mut self) -> Result<usize, DriverError> {
        let mut decomposed = 0;
        for index in 1..self.store.population_count() {
            let (upper, lower) = (PopulationId(index as u32), PopulationId(index as u32 - 1));
            for handle in self.store.get_population_agents(upper)? {
                if !self.rng.gen_bool(self.config.decompose_chance) {
                    continue;
                }
                let Some(parent) = self.take(handle, upper)? else {
                    continue;
                };
                let share = parent.energy / 2.0;
                let depth = parent.depth.saturating_sub(1);
                for _ in 0..2 {
                    let id = self.next_id();
                    let child = Entity::new(id, lower, share)
                        .with_depth(depth)
                        .with_meta("origin", "decomposed")
                        .with_meta("parent", parent.id().as_str());
                    self.add(child, lower)?;
                }
                decomposed += 1;
            }
        }
        Ok(decomposed)
    }

    /// Energetic base entities hand half their energy to a new child.
    fn reproduce(&mut self) -> Result<usize, DriverError> {
        let base = PopulationId(0);
        let mut births = Vec::new();
        for handle in self.store.get_population_agents(base)? {
            let threshold = self.config.reproduce_threshold;
            let chance = self.config.reproduce_chance;
            let Some(parent) = self.store.get_mut(handle) else {
                continue;
            };
            if parent.energy < threshold || !self.rng.gen_bool(chance) {
                continue;
            }
            parent.energy /= 2.0;
            births.push((parent.id().clone(), parent.energy));
        }
        let born = births.len();
        for (parent, energy) in births {
            let id = self.next_id();
            let child = Entity::new(id, base, energy)
                .with_meta("origin", "born")
                .with_meta("parent", parent.as_str());
            self.add(child, base)?;
        }
        Ok(born)
    }

    fn decay(&mut self) -> Result<usize, DriverError> {
        let threshold = self.config.decay_threshold;
        let mut decayed = 0;
        for index in 0..self.store.population_count() {
            decayed += self
                .store
                .retain_population(PopulationId(index as u32), |entity| entity.energy >= threshold)?;
        }
        self.removed += decayed as u64;
        Ok(decayed)
    }

    fn capture(&mut self) {
        if let Some(snapshot) = self.exporter.maybe_capture(&self.store) {
            self.store.record_snapshot(snapshot);
        }
    }

    fn take(
        &mut self,
        handle: EntityHandle,
        population: PopulationId,
    ) -> Result<Option<Entity>, DriverError> {
        let Some(id) = self.store.get(handle).map(|entity| entity.id().clone()) else {
            return Ok(None);
        };
        let removed = self.store.remove_agent(&id, population)?;
        if removed.is_some() {
            self.removed += 1;
        }
        Ok(removed)
    }

    fn add(&mut self, entity: Entity, population: PopulationId) -> Result<EntityHandle, DriverError> {
        let handle = self.store.add_agent(entity, population)?;
        self.created += 1;
        Ok(handle)
    }

    fn next_id(&mut self) -> EntityId {
        self.serial += 1;
        EntityId::compound(self.store.cycle(), self.serial)
    }

    fn summary(&self, stop: StopReason) -> RunSummary {
        RunSummary {
            cycles: self.store.cycle().0,
            stop,
            population_counts: (0..self.store.population_count())
                .map(|index| self.store.population_len(PopulationId(index as u32)))
                .collect(),
            created: self.created,
            removed: self.removed,
            failed_writes: self.store.failed_writes(),
        }
    }

    /// Snapshots retained in memory, oldest first.
    pub fn snapshots(&self) -> impl Iterator<Item = &Snapshot> + '_ {
        self.exporter.history()
    }

    #[must_use]
    pub fn cycle(&self) -> Cycle {
        self.store.cycle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use popstore_core::{LifecycleKind, RecordingAdapter, StoreConfig};

    fn config(seed: u64) -> DriverConfig {
        DriverConfig {
            store: StoreConfig::new(3, "test"),
            cycles: 60,
            seed,
            initial_entities: 80,
            snapshot_interval: 10,
            ..DriverConfig::default()
        }
    }

    fn recording_driver(config: DriverConfig) -> ChurnDriver<RecordingAdapter> {
        let store = EntityStore::with_adapter(config.store.clone(), RecordingAdapter::default())
            .expect("store");
        ChurnDriver::new(config, store).expect("driver")
    }

    #[test]
    fn counters_match_live_population() {
        let mut driver = recording_driver(config(11));
        driver.seed().expect("seed");
        let summary = driver.run().expect("run");
        let live: usize = summary.population_counts.iter().sum();
        assert_eq!(live as u64, summary.created - summary.removed);
        assert_eq!(live, driver.store().len());

        let events = &driver.store().adapter().events;
        let created = events.iter().filter(|e| e.kind == LifecycleKind::Created).count();
        let removed = events.iter().filter(|e| e.kind == LifecycleKind::Removed).count();
        assert_eq!(created as u64, summary.created);
        assert_eq!(removed as u64, summary.removed);
    }

    #[test]
    fn equal_seeds_replay_equal_runs() {
        let run = |seed| {
            let mut driver = recording_driver(config(seed));
            driver.seed().expect("seed");
            let summary = driver.run().expect("run");
            let ids: Vec<String> = driver
                .store()
                .iter()
                .map(|entity| entity.id().to_string())
                .collect();
            (summary, ids)
        };
        assert_eq!(run(5), run(5));
    }

    #[test]
    fn composition_climbs_populations() {
        let mut config = config(3);
        config.compose_chance = 1.0;
        config.decompose_chance = 0.0;
        config.reproduce_chance = 0.0;
        config.energy_drift = 0.0;
        config.decay_threshold = 0.0;
        config.initial_entities = 8;
        let mut driver = recording_driver(config);
        driver.seed().expect("seed");
        let stats = driver.step().expect("step");
        // 8 base entities pair into 4 in population 1, which pair into 2 in population 2.
        assert_eq!(stats.composed, 6);
        assert_eq!(driver.store().population_len(PopulationId(0)), 0);
        assert_eq!(driver.store().population_len(PopulationId(1)), 0);
        assert_eq!(driver.store().population_len(PopulationId(2)), 2);
        for entity in driver.store().population(PopulationId(2)) {
            assert_eq!(entity.energy, 4.0);
            assert_eq!(entity.depth, 2);
        }
    }

    #[test]
    fn extinction_stops_early() {
        let mut config = config(9);
        config.decay_threshold = 10.0;
        let mut driver = recording_driver(config);
        driver.seed().expect("seed");
        let summary = driver.run().expect("run");
        assert_eq!(summary.stop, StopReason::Extinct);
        assert_eq!(summary.cycles, 1);
        assert!(driver.store().is_empty());
    }

    #[test]
    fn cap_stops_early() {
        let mut config = config(4);
        config.population_cap = 90;
        config.reproduce_chance = 1.0;
        config.reproduce_threshold = 0.0;
        config.decay_threshold = 0.0;
        let mut driver = recording_driver(config);
        driver.seed().expect("seed");
        let summary = driver.run().expect("run");
        assert_eq!(summary.stop, StopReason::CapReached);
        assert!(driver.store().len() > 90);
    }

    #[test]
    fn snapshots_are_forwarded_to_the_adapter() {
        let mut driver = recording_driver(config(21));
        driver.seed().expect("seed");
        driver.run().expect("run");
        let cycles: Vec<u64> = driver.snapshots().map(|s| s.cycle.0).collect();
        assert!(cycles.iter().all(|cycle| cycle % 10 == 0));
        let forwarded = &driver.store().adapter().snapshots;
        assert_eq!(forwarded.len(), cycles.len());
    }

    #[test]
    fn mismatched_population_count_rejected() {
        let store = EntityStore::new(StoreConfig::new(2, "test")).expect("store");
        let result = ChurnDriver::new(config(1), store);
        assert!(matches!(
            result,
            Err(DriverError::PopulationMismatch { store: 2, driver: 3 })
        ));
    }
}

//! Read-only per-population aggregates taken at cycle boundaries.

use crate::entity::{Cycle, PopulationId};
use crate::persistence::PersistenceAdapter;
use crate::store::EntityStore;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{self, Write};

/// Aggregate statistics for one population.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PopulationStats {
    pub population: PopulationId,
    pub count: usize,
    pub energy_sum: f64,
    pub energy_mean: f64,
    pub energy_min: f64,
    pub energy_max: f64,
}

impl PopulationStats {
    fn empty(population: PopulationId) -> Self {
        Self {
            population,
            count: 0,
            energy_sum: 0.0,
            energy_mean: 0.0,
            energy_min: 0.0,
            energy_max: 0.0,
        }
    }
}

/// Point-in-time aggregate of every population in a store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub cycle: Cycle,
    pub populations: Vec<PopulationStats>,
}

impl Snapshot {
    #[must_use]
    pub fn total_count(&self) -> usize {
        self.populations.iter().map(|stats| stats.count).sum()
    }

    #[must_use]
    pub fn total_energy(&self) -> f64 {
        self.populations.iter().map(|stats| stats.energy_sum).sum()
    }

    #[must_use]
    pub fn population(&self, population: PopulationId) -> Option<&PopulationStats> {
        self.populations.get(population.index())
    }
}

/// Periodic snapshot sampler with a bounded in-memory history.
#[derive(Debug, Clone)]
pub struct SnapshotExporter {
    interval: u64,
    history_capacity: usize,
    history: VecDeque<Snapshot>,
}

impl SnapshotExporter {
    /// `interval` of zero disables periodic capture; `capture` still works.
    #[must_use]
    pub fn new(interval: u64, history_capacity: usize) -> Self {
        Self {
            interval,
            history_capacity,
            history: VecDeque::with_capacity(history_capacity.min(1_024)),
        }
    }

    #[must_use]
    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// Aggregate the store as it stands. Does not touch the history.
    #[must_use]
    pub fn capture<P: PersistenceAdapter>(store: &EntityStore<P>) -> Snapshot {
        let populations = (0..store.population_count())
            .map(|index| {
                let population = PopulationId(index as u32);
                let mut stats = PopulationStats::empty(population);
                let mut min = f64::INFINITY;
                let mut max = f64::NEG_INFINITY;
                for entity in store.population(population) {
                    stats.count += 1;
                    stats.energy_sum += entity.energy;
                    min = min.min(entity.energy);
                    max = max.max(entity.energy);
                }
                if stats.count > 0 {
                    stats.energy_mean = stats.energy_sum / stats.count as f64;
                    stats.energy_min = min;
                    stats.energy_max = max;
                }
                stats
            })
            .collect();
        Snapshot {
            cycle: store.cycle(),
            populations,
        }
    }

    /// Capture when the store's cycle lands on the configured interval.
    pub fn maybe_capture<P: PersistenceAdapter>(
        &mut self,
        store: &EntityStore<P>,
    ) -> Option<&Snapshot> {
        if !store.cycle().is_boundary(self.interval) {
            return None;
        }
        if self.history.back().is_some_and(|last| last.cycle == store.cycle()) {
            return self.history.back();
        }
        let snapshot = Self::capture(store);
        self.push(snapshot);
        self.history.back()
    }

    fn push(&mut self, snapshot: Snapshot) {
        if self.history_capacity == 0 {
            return;
        }
        while self.history.len() >= self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(snapshot);
    }

    pub fn history(&self) -> impl Iterator<Item = &Snapshot> + '_ {
        self.history.iter()
    }

    #[must_use]
    pub fn latest(&self) -> Option<&Snapshot> {
        self.history.back()
    }

    /// Write the retained history as JSON lines, oldest first.
    pub fn write_jsonl<W: Write>(&self, mut writer: W) -> io::Result<()> {
        for snapshot in &self.history {
            serde_json::to_writer(&mut writer, snapshot)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()
    }
}

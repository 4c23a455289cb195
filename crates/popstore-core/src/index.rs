//! Population membership index over arena handles.
//!
//! Each population keeps an insertion-ordered list of handles. Removal leaves a
//! tombstone that is found in O(1) through the handle position table; lists are
//! compacted in order once tombstones outnumber live members, which keeps
//! removal amortized O(1) without disturbing the order of the survivors.

use crate::entity::{EntityHandle, EntityId, PopulationId};
use ahash::AHashMap;
use slotmap::SecondaryMap;

/// Tombstone count below which a population list is never compacted.
const COMPACT_FLOOR: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    population: PopulationId,
    position: usize,
}

#[derive(Debug, Clone, Default)]
struct Membership {
    order: Vec<Option<EntityHandle>>,
    live: usize,
}

impl Membership {
    fn tombstones(&self) -> usize {
        self.order.len() - self.live
    }

    fn needs_compaction(&self) -> bool {
        let dead = self.tombstones();
        dead >= COMPACT_FLOOR && dead > self.live
    }

    fn iter(&self) -> impl Iterator<Item = EntityHandle> + '_ {
        self.order.iter().flatten().copied()
    }
}

/// Identity table plus per-population ordered membership.
#[derive(Debug, Clone)]
pub struct PopulationIndex {
    populations: Vec<Membership>,
    slots: SecondaryMap<EntityHandle, Slot>,
    ids: AHashMap<EntityId, EntityHandle>,
}

impl PopulationIndex {
    /// Create an index with `population_count` empty partitions.
    #[must_use]
    pub fn new(population_count: usize) -> Self {
        Self::with_capacity(population_count, 0)
    }

    /// Create an index reserving room for `capacity` entities overall.
    #[must_use]
    pub fn with_capacity(population_count: usize, capacity: usize) -> Self {
        Self {
            populations: vec![Membership::default(); population_count],
            slots: SecondaryMap::with_capacity(capacity),
            ids: AHashMap::with_capacity(capacity),
        }
    }

    #[must_use]
    pub fn population_count(&self) -> usize {
        self.populations.len()
    }

    /// Returns true when `population` was declared for this index.
    #[must_use]
    pub fn has_population(&self, population: PopulationId) -> bool {
        population.index() < self.populations.len()
    }

    /// Handle currently registered under `id`, if any.
    #[must_use]
    pub fn lookup(&self, id: &str) -> Option<EntityHandle> {
        self.ids.get(id).copied()
    }

    #[must_use]
    pub fn population_of(&self, handle: EntityHandle) -> Option<PopulationId> {
        self.slots.get(handle).map(|slot| slot.population)
    }

    /// Register `handle` under `id` at the end of `population`.
    ///
    /// Returns false, leaving the index untouched, when the id is already
    /// registered or the population is undeclared.
    pub fn insert(&mut self, id: EntityId, handle: EntityHandle, population: PopulationId) -> bool {
        if !self.has_population(population) || self.ids.contains_key(&id) {
            return false;
        }
        self.ids.insert(id, handle);
        self.append(handle, population);
        true
    }

    /// Unregister `id`, returning its handle and the population it left.
    pub fn remove(&mut self, id: &str) -> Option<(EntityHandle, PopulationId)> {
        let handle = self.ids.remove(id)?;
        let population = self.detach(handle)?;
        Some((handle, population))
    }

    /// Move `handle` to the end of `to`, returning the population it left.
    pub fn relocate(&mut self, handle: EntityHandle, to: PopulationId) -> Option<PopulationId> {
        if !self.has_population(to) {
            return None;
        }
        let from = self.detach(handle)?;
        self.append(handle, to);
        Some(from)
    }

    /// Live members of `population` in insertion order.
    pub fn members(&self, population: PopulationId) -> impl Iterator<Item = EntityHandle> + '_ {
        self.populations
            .get(population.index())
            .into_iter()
            .flat_map(|membership| membership.iter())
    }

    /// Number of live members in `population`; zero for undeclared populations.
    #[must_use]
    pub fn len(&self, population: PopulationId) -> usize {
        self.populations
            .get(population.index())
            .map_or(0, |membership| membership.live)
    }

    /// Number of live members across all populations.
    #[must_use]
    pub fn total(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn clear(&mut self) {
        for membership in &mut self.populations {
            membership.order.clear();
            membership.live = 0;
        }
        self.slots.clear();
        self.ids.clear();
    }

    fn append(&mut self, handle: EntityHandle, population: PopulationId) {
        let membership = &mut self.populations[population.index()];
        let position = membership.order.len();
        membership.order.push(Some(handle));
        membership.live += 1;
        self.slots.insert(
            handle,
            Slot {
                population,
                position,
            },
        );
    }

    fn detach(&mut self, handle: EntityHandle) -> Option<PopulationId> {
        let slot = self.slots.remove(handle)?;
        let membership = &mut self.populations[slot.population.index()];
        let removed = membership.order[slot.position].take();
        debug_assert_eq!(removed, Some(handle));
        membership.live -= 1;
        if membership.needs_compaction() {
            self.compact(slot.population);
        }
        Some(slot.population)
    }

    fn compact(&mut self, population: PopulationId) {
        let membership = &mut self.populations[population.index()];
        let mut write = 0;
        for read in 0..membership.order.len() {
            let Some(handle) = membership.order[read] else {
                continue;
            };
            membership.order[write] = Some(handle);
            if let Some(slot) = self.slots.get_mut(handle) {
                slot.position = write;
            }
            write += 1;
        }
        membership.order.truncate(write);
        debug_assert_eq!(write, membership.live);
    }
}

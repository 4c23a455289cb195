//! The entity store: sole owner of entity values and of their population
//! membership.

use crate::config::{ConfigError, StoreConfig};
use crate::entity::{Cycle, Entity, EntityHandle, EntityId, PopulationId};
use crate::index::PopulationIndex;
use crate::persistence::{LifecycleEvent, LifecycleKind, NullAdapter, PersistenceAdapter};
use crate::snapshot::Snapshot;
use slotmap::SlotMap;
use thiserror::Error;
use tracing::{debug, trace};

/// Correctness errors raised by store operations. Persistence failures never
/// surface here.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("entity id `{id}` is already live in population {population}")]
    DuplicateId {
        id: EntityId,
        population: PopulationId,
    },
    #[error("population {population} is outside the declared range 0..{population_count}")]
    InvalidPopulation {
        population: PopulationId,
        population_count: usize,
    },
    #[error("entity `{id}` has invalid energy {energy}")]
    InvalidEnergy { id: EntityId, energy: f64 },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Multi-population entity store.
///
/// Entities live in a generational arena; populations are an index of arena
/// handles. Handles returned by [`EntityStore::get_population_agents`] stay
/// valid until the entity is removed, so mutations made through
/// [`EntityStore::get_mut`] are visible to every later query.
///
/// The adapter type decides whether lifecycle events are persisted. The
/// default [`NullAdapter`] is zero-sized and its hooks inline to nothing.
#[derive(Debug)]
pub struct EntityStore<P: PersistenceAdapter = NullAdapter> {
    config: StoreConfig,
    entities: SlotMap<EntityHandle, Entity>,
    index: PopulationIndex,
    cycle: Cycle,
    adapter: P,
    closed: bool,
}

impl EntityStore<NullAdapter> {
    /// Instantiate a store without persistence.
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        Self::with_adapter(config, NullAdapter)
    }
}

impl<P: PersistenceAdapter> EntityStore<P> {
    /// Instantiate a store mirroring its lifecycle events into `adapter`.
    pub fn with_adapter(config: StoreConfig, adapter: P) -> Result<Self, StoreError> {
        config.validate()?;
        let capacity = config.capacity_hint;
        Ok(Self {
            entities: SlotMap::with_capacity_and_key(capacity),
            index: PopulationIndex::with_capacity(config.population_count, capacity),
            config,
            cycle: Cycle::zero(),
            adapter,
            closed: false,
        })
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    #[must_use]
    pub fn mode_label(&self) -> &str {
        &self.config.mode_label
    }

    #[must_use]
    pub fn population_count(&self) -> usize {
        self.index.population_count()
    }

    /// Cycle stamped on lifecycle events recorded from now on.
    #[must_use]
    pub fn cycle(&self) -> Cycle {
        self.cycle
    }

    pub fn set_cycle(&mut self, cycle: Cycle) {
        self.cycle = cycle;
    }

    /// Move the clock forward one cycle and return the new value.
    pub fn advance_cycle(&mut self) -> Cycle {
        self.cycle = self.cycle.next();
        self.cycle
    }

    /// Register `entity` under `population`.
    ///
    /// The identity must not be live anywhere in the store. The entity's
    /// population field is set to `population`. On error nothing changes and
    /// no event is recorded.
    pub fn add_agent(
        &mut self,
        mut entity: Entity,
        population: PopulationId,
    ) -> Result<EntityHandle, StoreError> {
        self.check_population(population)?;
        if !entity.has_valid_energy() {
            return Err(StoreError::InvalidEnergy {
                id: entity.id,
                energy: entity.energy,
            });
        }
        if let Some(existing) = self.index.lookup(entity.id.as_str()) {
            let population = self
                .index
                .population_of(existing)
                .unwrap_or(entity.population);
            return Err(StoreError::DuplicateId {
                id: entity.id,
                population,
            });
        }

        entity.population = population;
        let id = entity.id.clone();
        let handle = self.entities.insert(entity);
        let inserted = self.index.insert(id, handle, population);
        debug_assert!(inserted, "index rejected a pre-validated insert");

        self.adapter.on_event(&LifecycleEvent {
            kind: LifecycleKind::Created,
            cycle: self.cycle,
            population,
            entity: &self.entities[handle],
        });
        Ok(handle)
    }

    /// Remove the entity `id` from `population`.
    ///
    /// Idempotent: an id that is not live in `population` (already removed,
    /// never added, or living elsewhere) is a no-op returning `Ok(None)`.
    pub fn remove_agent(
        &mut self,
        id: impl AsRef<str>,
        population: PopulationId,
    ) -> Result<Option<Entity>, StoreError> {
        self.check_population(population)?;
        let id = id.as_ref();
        let Some(handle) = self.index.lookup(id) else {
            trace!(id, %population, "remove of absent entity ignored");
            return Ok(None);
        };
        if self.index.population_of(handle) != Some(population) {
            trace!(id, %population, "remove targeted the wrong population; ignored");
            return Ok(None);
        }
        Ok(self.detach(id, handle))
    }

    /// Handles of the live members of `population`, in insertion order.
    ///
    /// The returned vector is the caller's to shuffle; the entities behind the
    /// handles are the live ones.
    pub fn get_population_agents(
        &self,
        population: PopulationId,
    ) -> Result<Vec<EntityHandle>, StoreError> {
        self.check_population(population)?;
        Ok(self.index.members(population).collect())
    }

    /// Iterate the live members of `population` in insertion order.
    /// Undeclared populations yield nothing.
    pub fn population(&self, population: PopulationId) -> impl Iterator<Item = &Entity> + '_ {
        self.index
            .members(population)
            .filter_map(move |handle| self.entities.get(handle))
    }

    /// Apply `update` to every live member of `population`, in insertion order.
    pub fn for_each_mut<F>(
        &mut self,
        population: PopulationId,
        mut update: F,
    ) -> Result<(), StoreError>
    where
        F: FnMut(&mut Entity),
    {
        self.check_population(population)?;
        for handle in self.index.members(population) {
            if let Some(entity) = self.entities.get_mut(handle) {
                update(entity);
            }
        }
        Ok(())
    }

    /// Remove every member of `population` for which `keep` returns false.
    /// Survivors keep their order; each removal is recorded. Returns the
    /// number of entities removed.
    pub fn retain_population<F>(
        &mut self,
        population: PopulationId,
        mut keep: F,
    ) -> Result<usize, StoreError>
    where
        F: FnMut(&Entity) -> bool,
    {
        self.check_population(population)?;
        let doomed: Vec<(EntityHandle, EntityId)> = self
            .index
            .members(population)
            .filter_map(|handle| {
                let entity = self.entities.get(handle)?;
                (!keep(entity)).then(|| (handle, entity.id.clone()))
            })
            .collect();
        for (handle, id) in &doomed {
            self.detach(id.as_str(), *handle);
        }
        Ok(doomed.len())
    }

    /// Move the entity `id` from `from` to the end of `to`, keeping its handle.
    ///
    /// Returns `Ok(false)` when `id` is not live in `from`. Persisted as a
    /// removal from `from` followed by a creation in `to`.
    pub fn transfer(
        &mut self,
        id: impl AsRef<str>,
        from: PopulationId,
        to: PopulationId,
    ) -> Result<bool, StoreError> {
        self.check_population(from)?;
        self.check_population(to)?;
        let Some(handle) = self.index.lookup(id.as_ref()) else {
            return Ok(false);
        };
        if self.index.population_of(handle) != Some(from) {
            return Ok(false);
        }
        if from == to {
            return Ok(true);
        }
        self.index.relocate(handle, to);
        let entity = &mut self.entities[handle];
        self.adapter.on_event(&LifecycleEvent {
            kind: LifecycleKind::Removed,
            cycle: self.cycle,
            population: from,
            entity: &*entity,
        });
        entity.population = to;
        self.adapter.on_event(&LifecycleEvent {
            kind: LifecycleKind::Created,
            cycle: self.cycle,
            population: to,
            entity: &*entity,
        });
        Ok(true)
    }

    #[must_use]
    pub fn get(&self, handle: EntityHandle) -> Option<&Entity> {
        self.entities.get(handle)
    }

    /// Mutable access for in-place updates of energy, depth and metadata.
    #[must_use]
    pub fn get_mut(&mut self, handle: EntityHandle) -> Option<&mut Entity> {
        self.entities.get_mut(handle)
    }

    #[must_use]
    pub fn handle_of(&self, id: impl AsRef<str>) -> Option<EntityHandle> {
        self.index.lookup(id.as_ref())
    }

    #[must_use]
    pub fn find(&self, id: impl AsRef<str>) -> Option<&Entity> {
        self.handle_of(id).and_then(|handle| self.entities.get(handle))
    }

    #[must_use]
    pub fn find_mut(&mut self, id: impl AsRef<str>) -> Option<&mut Entity> {
        let handle = self.handle_of(id)?;
        self.entities.get_mut(handle)
    }

    #[must_use]
    pub fn contains(&self, id: impl AsRef<str>) -> bool {
        self.handle_of(id).is_some()
    }

    /// Number of live members in `population`; zero for undeclared populations.
    #[must_use]
    pub fn population_len(&self, population: PopulationId) -> usize {
        self.index.len(population)
    }

    /// Number of live entities across all populations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Every live entity, population by population, each in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Entity> + '_ {
        (0..self.population_count())
            .flat_map(move |index| self.population(PopulationId(index as u32)))
    }

    /// Forward a snapshot to the persistence adapter.
    pub fn record_snapshot(&mut self, snapshot: &Snapshot) {
        self.adapter.on_snapshot(snapshot);
    }

    /// Ask the adapter to commit buffered writes.
    pub fn flush(&mut self) {
        self.adapter.flush();
    }

    #[must_use]
    pub fn adapter(&self) -> &P {
        &self.adapter
    }

    /// Persistence failures observed so far.
    #[must_use]
    pub fn failed_writes(&self) -> u64 {
        self.adapter.failed_writes()
    }

    /// Release the store, committing buffered persistence writes first.
    /// Dropping the store does the same.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.adapter.close();
        debug!(
            cycle = self.cycle.0,
            live = self.entities.len(),
            failed_writes = self.adapter.failed_writes(),
            mode = %self.config.mode_label,
            "entity store closed"
        );
    }

    fn detach(&mut self, id: &str, handle: EntityHandle) -> Option<Entity> {
        let (removed_handle, population) = self.index.remove(id)?;
        debug_assert_eq!(removed_handle, handle);
        let entity = self.entities.remove(handle)?;
        self.adapter.on_event(&LifecycleEvent {
            kind: LifecycleKind::Removed,
            cycle: self.cycle,
            population,
            entity: &entity,
        });
        Some(entity)
    }

    fn check_population(&self, population: PopulationId) -> Result<(), StoreError> {
        if self.index.has_population(population) {
            Ok(())
        } else {
            Err(StoreError::InvalidPopulation {
                population,
                population_count: self.index.population_count(),
            })
        }
    }
}

impl<P: PersistenceAdapter> Drop for EntityStore<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

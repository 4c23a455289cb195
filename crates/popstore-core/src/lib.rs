//! Core types for the multi-population entity store.
//!
//! An [`EntityStore`] owns every entity of a simulation run in a generational
//! arena and indexes them by population. Drivers add and remove entities by
//! identity, fetch population members as handles, and mutate them in place.
//! Lifecycle events are mirrored into a [`PersistenceAdapter`] chosen at
//! construction; the default [`NullAdapter`] costs nothing.

pub mod config;
pub mod entity;
pub mod index;
pub mod persistence;
pub mod snapshot;
pub mod store;

pub use config::{ConfigError, PersistenceConfig, StoreConfig};
pub use entity::{Cycle, Entity, EntityHandle, EntityId, MetaValue, Metadata, PopulationId};
pub use index::PopulationIndex;
pub use persistence::{
    LifecycleEvent, LifecycleKind, NullAdapter, PersistenceAdapter, RecordedEvent,
    RecordingAdapter,
};
pub use snapshot::{PopulationStats, Snapshot, SnapshotExporter};
pub use store::{EntityStore, StoreError};

//! Persistence hooks mirrored from store mutations.

use crate::entity::{Cycle, Entity, PopulationId};
use crate::snapshot::Snapshot;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle transition recorded for an entity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    Created,
    Removed,
}

impl LifecycleKind {
    /// Label stored in the `event_type` column.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Removed => "removed",
        }
    }

    /// Parses a stored `event_type` label.
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "created" => Some(Self::Created),
            "removed" => Some(Self::Removed),
            _ => None,
        }
    }
}

impl fmt::Display for LifecycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Borrowed view of a single lifecycle transition.
///
/// `population` is the population the entity joined (`Created`) or left
/// (`Removed`); energy and depth are read from `entity` at event time.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleEvent<'a> {
    pub kind: LifecycleKind,
    pub cycle: Cycle,
    pub population: PopulationId,
    pub entity: &'a Entity,
}

/// Sink receiving store mutations.
///
/// Implementations own any buffering and must never fail the caller: write
/// errors are logged and counted in [`PersistenceAdapter::failed_writes`].
pub trait PersistenceAdapter {
    fn on_event(&mut self, event: &LifecycleEvent<'_>);

    fn on_snapshot(&mut self, _snapshot: &Snapshot) {}

    /// Commit anything buffered so far.
    fn flush(&mut self) {}

    /// Final flush and release. Must tolerate repeated calls.
    fn close(&mut self) {
        self.flush();
    }

    fn failed_writes(&self) -> u64 {
        0
    }
}

/// Disabled persistence. Zero-sized; every hook compiles to nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAdapter;

impl PersistenceAdapter for NullAdapter {
    #[inline(always)]
    fn on_event(&mut self, _event: &LifecycleEvent<'_>) {}

    #[inline(always)]
    fn on_snapshot(&mut self, _snapshot: &Snapshot) {}

    #[inline(always)]
    fn flush(&mut self) {}

    #[inline(always)]
    fn close(&mut self) {}
}

/// Persistence chosen at runtime: `None` behaves like [`NullAdapter`].
impl<A: PersistenceAdapter> PersistenceAdapter for Option<A> {
    #[inline]
    fn on_event(&mut self, event: &LifecycleEvent<'_>) {
        if let Some(adapter) = self {
            adapter.on_event(event);
        }
    }

    #[inline]
    fn on_snapshot(&mut self, snapshot: &Snapshot) {
        if let Some(adapter) = self {
            adapter.on_snapshot(snapshot);
        }
    }

    fn flush(&mut self) {
        if let Some(adapter) = self {
            adapter.flush();
        }
    }

    fn close(&mut self) {
        if let Some(adapter) = self {
            adapter.close();
        }
    }

    fn failed_writes(&self) -> u64 {
        self.as_ref().map_or(0, |adapter| adapter.failed_writes())
    }
}

/// Owned copy of a lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordedEvent {
    pub kind: LifecycleKind,
    pub cycle: Cycle,
    pub population: PopulationId,
    pub entity: Entity,
}

impl From<&LifecycleEvent<'_>> for RecordedEvent {
    fn from(event: &LifecycleEvent<'_>) -> Self {
        Self {
            kind: event.kind,
            cycle: event.cycle,
            population: event.population,
            entity: event.entity.clone(),
        }
    }
}

/// In-memory sink that keeps every event and snapshot; used by tests and
/// short diagnostic runs.
#[derive(Debug, Default, Clone)]
pub struct RecordingAdapter {
    pub events: Vec<RecordedEvent>,
    pub snapshots: Vec<Snapshot>,
    pub flushes: usize,
    pub closed: bool,
}

impl PersistenceAdapter for RecordingAdapter {
    fn on_event(&mut self, event: &LifecycleEvent<'_>) {
        self.events.push(RecordedEvent::from(event));
    }

    fn on_snapshot(&mut self, snapshot: &Snapshot) {
        self.snapshots.push(snapshot.clone());
    }

    fn flush(&mut self) {
        self.flushes += 1;
    }

    fn close(&mut self) {
        if !self.closed {
            self.flush();
            self.closed = true;
        }
    }
}

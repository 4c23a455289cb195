//! Churn workload driver for popstore.
//!
//! The driver exercises an [`EntityStore`](popstore_core::EntityStore) the way
//! experiment loops do: a flat, single-threaded cycle of energy updates,
//! pairwise composition into the next population, decomposition back down,
//! reproduction at the base population and threshold decay, with periodic
//! snapshots.

pub mod config;
pub mod driver;

pub use config::DriverConfig;
pub use driver::{ChurnDriver, CycleStats, DriverError, RunSummary, StopReason};

//! DuckDB-backed lifecycle event log for popstore.
//!
//! [`FileAdapter`] mirrors store mutations into a DuckDB file through a
//! background writer thread; [`EventLog`] reopens such a file for replay and
//! analysis without the live process.

use chrono::{DateTime, Utc};
use duckdb::{AccessMode, Config, Connection, Transaction, params};
use popstore_core::{
    ConfigError, Cycle, EntityId, EntityStore, LifecycleEvent, LifecycleKind, Metadata,
    PersistenceAdapter, PersistenceConfig, PopulationId, PopulationStats, Snapshot, StoreConfig,
    StoreError,
};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
        mpsc,
    },
    thread,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Storage error wrapper.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[error("storage worker error: {0}")]
    Worker(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("store rejected replayed event: {0}")]
    Store(#[from] StoreError),
    #[error("unknown run `{0}`")]
    UnknownRun(String),
    #[error("event log {} does not exist", .0.display())]
    MissingLog(PathBuf),
    #[error("corrupt record in run `{run_id}` at seq {seq}: {reason}")]
    Corrupt {
        run_id: String,
        seq: i64,
        reason: String,
    },
}

/// Lifecycle row written to the `lifecycle_events` table.
#[derive(Debug, Clone)]
struct EventRow {
    seq: i64,
    entity_id: String,
    population_id: i64,
    energy: f64,
    depth: i64,
    event_type: &'static str,
    cycle: i64,
    recorded_at_us: i64,
    metadata: Option<String>,
}

/// Aggregate row written to the `population_snapshots` table.
#[derive(Debug, Clone)]
struct SnapshotRow {
    cycle: i64,
    population_id: i64,
    count: i64,
    energy_sum: f64,
    energy_mean: f64,
    energy_min: f64,
    energy_max: f64,
}

#[derive(Debug, Default)]
struct WriteBatch {
    events: Vec<EventRow>,
    snapshots: Vec<SnapshotRow>,
}

impl WriteBatch {
    fn is_empty(&self) -> bool {
        self.events.is_empty() && self.snapshots.is_empty()
    }

    fn rows(&self) -> u64 {
        (self.events.len() + self.snapshots.len()) as u64
    }
}

/// Run header stored in the `runs` table.
#[derive(Debug, Clone, PartialEq)]
pub struct RunInfo {
    pub run_id: String,
    pub mode_label: String,
    pub population_count: usize,
    pub started_at: DateTime<Utc>,
}

/// Population size after the events of one cycle were applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurvePoint {
    pub cycle: Cycle,
    pub population: PopulationId,
    pub size: i64,
}

/// Synchronous DuckDB writer owned by the `FileAdapter` worker thread.
struct Storage {
    conn: Connection,
}

impl Storage {
    /// Open or create a DuckDB database at `path` and ensure the schema exists.
    fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }

    fn register_run(&self, run: &RunInfo) -> Result<(), StorageError> {
        self.conn.execute(
            "insert into runs (run_id, mode_label, population_count, started_at_us)
             values (?, ?, ?, ?)",
            params![
                &run.run_id,
                &run.mode_label,
                run.population_count as i64,
                run.started_at.timestamp_micros(),
            ],
        )?;
        Ok(())
    }

    /// Append one batch in a single transaction.
    fn append(&mut self, run_id: &str, batch: &WriteBatch) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        Self::insert_events(&tx, run_id, &batch.events)?;
        Self::insert_snapshots(&tx, run_id, &batch.snapshots)?;
        tx.commit()?;
        Ok(())
    }

    fn insert_events(
        tx: &Transaction<'_>,
        run_id: &str,
        rows: &[EventRow],
    ) -> Result<(), duckdb::Error> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut stmt = tx.prepare(
            "insert into lifecycle_events (
                run_id, seq, entity_id, population_id, energy, depth,
                event_type, cycle, recorded_at_us, metadata
            ) values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        for row in rows {
            stmt.execute(params![
                run_id,
                row.seq,
                &row.entity_id,
                row.population_id,
                row.energy,
                row.depth,
                row.event_type,
                row.cycle,
                row.recorded_at_us,
                row.metadata.as_deref(),
            ])?;
        }
        Ok(())
    }

    fn insert_snapshots(
        tx: &Transaction<'_>,
        run_id: &str,
        rows: &[SnapshotRow],
    ) -> Result<(), duckdb::Error> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut stmt = tx.prepare(
            "insert or replace into population_snapshots (
                run_id, cycle, population_id, count,
                energy_sum, energy_mean, energy_min, energy_max
            ) values (?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        for row in rows {
            stmt.execute(params![
                run_id,
                row.cycle,
                row.population_id,
                row.count,
                row.energy_sum,
                row.energy_mean,
                row.energy_min,
                row.energy_max,
            ])?;
        }
        Ok(())
    }
}

fn initialize_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute(
        "create table if not exists runs (
            run_id text primary key,
            mode_label text,
            population_count integer,
            started_at_us bigint
        )",
        [],
    )?;
    conn.execute(
        "create table if not exists lifecycle_events (
            run_id text,
            seq bigint,
            entity_id text,
            population_id integer,
            energy double,
            depth integer,
            event_type text,
            cycle bigint,
            recorded_at_us bigint,
            metadata text,
            primary key (run_id, seq)
        )",
        [],
    )?;
    conn.execute(
        "create table if not exists population_snapshots (
            run_id text,
            cycle bigint,
            population_id integer,
            count bigint,
            energy_sum double,
            energy_mean double,
            energy_min double,
            energy_max double,
            primary key (run_id, cycle, population_id)
        )",
        [],
    )?;
    Ok(())
}

#[derive(Debug)]
enum StorageCommand {
    Append(WriteBatch),
    Flush(mpsc::Sender<()>),
    Shutdown,
}

/// Write-behind persistence adapter backed by a DuckDB file.
///
/// Events are staged locally and handed to a writer thread once a batch is
/// full, so the simulation thread never waits on disk. Write failures are
/// logged and counted; they never reach the store.
pub struct FileAdapter {
    run_id: String,
    staged: WriteBatch,
    event_batch: usize,
    snapshot_batch: usize,
    next_seq: i64,
    tx: Option<mpsc::Sender<StorageCommand>>,
    handle: Option<thread::JoinHandle<()>>,
    failures: Arc<AtomicU64>,
}

impl FileAdapter {
    /// Open the log at `persistence.path`, register a new run and start the
    /// writer thread.
    pub fn open(persistence: &PersistenceConfig, store: &StoreConfig) -> Result<Self, StorageError> {
        persistence.validate()?;
        store.validate()?;
        let Some(path) = persistence.path.as_deref() else {
            return Err(ConfigError::Invalid("persistence path is required").into());
        };
        let storage = Storage::open(path)?;
        let run = RunInfo {
            run_id: uuid::Uuid::new_v4().to_string(),
            mode_label: store.mode_label.clone(),
            population_count: store.population_count,
            started_at: Utc::now(),
        };
        storage.register_run(&run)?;
        info!(
            run_id = %run.run_id,
            mode = %run.mode_label,
            path = %path.display(),
            "persistence enabled"
        );

        let failures = Arc::new(AtomicU64::new(0));
        let (tx, rx) = mpsc::channel::<StorageCommand>();
        let worker_failures = Arc::clone(&failures);
        let worker_run = run.run_id.clone();
        let handle = thread::Builder::new()
            .name("popstore-storage-worker".into())
            .spawn(move || run_worker(storage, &worker_run, &rx, &worker_failures))
            .map_err(|err| {
                StorageError::Worker(format!("failed to spawn storage worker thread: {err}"))
            })?;

        Ok(Self {
            run_id: run.run_id,
            staged: WriteBatch::default(),
            event_batch: persistence.event_batch,
            snapshot_batch: persistence.snapshot_batch,
            next_seq: 0,
            tx: Some(tx),
            handle: Some(handle),
            failures,
        })
    }

    /// Identifier of the run this adapter writes.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Shared failure counter; stays readable after the adapter is closed.
    #[must_use]
    pub fn failure_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.failures)
    }

    fn dispatch(&mut self) {
        if self.staged.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.staged);
        let rows = batch.rows();
        let sent = self
            .tx
            .as_ref()
            .is_some_and(|tx| tx.send(StorageCommand::Append(batch)).is_ok());
        if !sent {
            self.failures.fetch_add(rows, Ordering::Relaxed);
            warn!(run_id = %self.run_id, rows, "storage worker unavailable; batch dropped");
        }
    }
}

fn run_worker(
    mut storage: Storage,
    run_id: &str,
    rx: &mpsc::Receiver<StorageCommand>,
    failures: &AtomicU64,
) {
    while let Ok(command) = rx.recv() {
        match command {
            StorageCommand::Append(batch) => {
                if let Err(err) = storage.append(run_id, &batch) {
                    failures.fetch_add(batch.rows(), Ordering::Relaxed);
                    error!(run_id, rows = batch.rows(), %err, "failed to persist batch");
                } else {
                    debug!(
                        run_id,
                        events = batch.events.len(),
                        snapshots = batch.snapshots.len(),
                        "persisted batch"
                    );
                }
            }
            StorageCommand::Flush(ack) => {
                let _ = ack.send(());
            }
            StorageCommand::Shutdown => break,
        }
    }
}

impl PersistenceAdapter for FileAdapter {
    fn on_event(&mut self, event: &LifecycleEvent<'_>) {
        let entity = event.entity;
        let metadata = if entity.metadata.is_empty() {
            None
        } else {
            match serde_json::to_string(&entity.metadata) {
                Ok(json) => Some(json),
                Err(err) => {
                    warn!(id = %entity.id(), %err, "metadata not serializable; stored as null");
                    None
                }
            }
        };
        self.staged.events.push(EventRow {
            seq: self.next_seq,
            entity_id: entity.id().to_string(),
            population_id: i64::from(event.population.0),
            energy: entity.energy,
            depth: i64::from(entity.depth),
            event_type: event.kind.as_str(),
            cycle: event.cycle.0 as i64,
            recorded_at_us: Utc::now().timestamp_micros(),
            metadata,
        });
        self.next_seq += 1;
        if self.staged.events.len() >= self.event_batch {
            self.dispatch();
        }
    }

    fn on_snapshot(&mut self, snapshot: &Snapshot) {
        let cycle = snapshot.cycle.0 as i64;
        self.staged
            .snapshots
            .extend(snapshot.populations.iter().map(|stats| SnapshotRow {
                cycle,
                population_id: i64::from(stats.population.0),
                count: stats.count as i64,
                energy_sum: stats.energy_sum,
                energy_mean: stats.energy_mean,
                energy_min: stats.energy_min,
                energy_max: stats.energy_max,
            }));
        if self.staged.snapshots.len() >= self.snapshot_batch {
            self.dispatch();
        }
    }

    /// Hands staged rows to the writer and waits until it has committed them.
    fn flush(&mut self) {
        self.dispatch();
        let Some(tx) = self.tx.as_ref() else {
            return;
        };
        let (ack_tx, ack_rx) = mpsc::channel();
        if tx.send(StorageCommand::Flush(ack_tx)).is_err() || ack_rx.recv().is_err() {
            warn!(run_id = %self.run_id, "storage worker exited before flush completed");
        }
    }

    fn close(&mut self) {
        self.dispatch();
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(StorageCommand::Shutdown);
        }
        if let Some(handle) = self.handle.take()
            && let Err(err) = handle.join()
        {
            error!(run_id = %self.run_id, "storage worker thread panicked: {err:?}");
        }
    }

    fn failed_writes(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl Drop for FileAdapter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Store whose persistence was chosen at runtime.
pub type MaybePersistentStore = EntityStore<Option<FileAdapter>>;

/// Build a store with `population_count` populations, persisting to
/// `persistence_path` when one is given.
pub fn new_store(
    population_count: usize,
    mode_label: &str,
    persistence_path: Option<&Path>,
) -> Result<MaybePersistentStore, StorageError> {
    let persistence = PersistenceConfig {
        path: persistence_path.map(Path::to_path_buf),
        ..PersistenceConfig::default()
    };
    open_store(StoreConfig::new(population_count, mode_label), &persistence)
}

/// Build a store from explicit configuration values.
pub fn open_store(
    config: StoreConfig,
    persistence: &PersistenceConfig,
) -> Result<MaybePersistentStore, StorageError> {
    let adapter = if persistence.is_enabled() {
        Some(FileAdapter::open(persistence, &config)?)
    } else {
        None
    };
    Ok(EntityStore::with_adapter(config, adapter)?)
}

/// Read access to a persisted event log.
pub struct EventLog {
    conn: Connection,
}

impl EventLog {
    /// Open an existing log read-only. A missing file is an error rather than
    /// a fresh, empty log.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if !path.is_file() {
            return Err(StorageError::MissingLog(path.to_path_buf()));
        }
        let config = Config::default().access_mode(AccessMode::ReadOnly)?;
        let conn = Connection::open_with_flags(path, config)?;
        Ok(Self { conn })
    }

    /// All runs recorded in this log, oldest first.
    pub fn runs(&self) -> Result<Vec<RunInfo>, StorageError> {
        let mut stmt = self.conn.prepare(
            "select run_id, mode_label, population_count, started_at_us
             from runs
             order by started_at_us asc, run_id asc",
        )?;
        let mut rows = stmt.query([])?;
        let mut runs = Vec::new();
        while let Some(row) = rows.next()? {
            let run_id: String = row.get(0)?;
            let started_at_us: i64 = row.get(3)?;
            let started_at = DateTime::from_timestamp_micros(started_at_us).ok_or_else(|| {
                StorageError::Corrupt {
                    run_id: run_id.clone(),
                    seq: -1,
                    reason: format!("start timestamp {started_at_us} out of range"),
                }
            })?;
            runs.push(RunInfo {
                mode_label: row.get(1)?,
                population_count: row.get::<_, i64>(2)? as usize,
                started_at,
                run_id,
            });
        }
        Ok(runs)
    }

    /// Most recently started run, if any.
    pub fn latest_run(&self) -> Result<Option<RunInfo>, StorageError> {
        Ok(self.runs()?.pop())
    }

    pub fn run(&self, run_id: &str) -> Result<RunInfo, StorageError> {
        self.runs()?
            .into_iter()
            .find(|run| run.run_id == run_id)
            .ok_or_else(|| StorageError::UnknownRun(run_id.to_string()))
    }

    /// Number of lifecycle events recorded for `run_id`.
    pub fn event_count(&self, run_id: &str) -> Result<u64, StorageError> {
        let count: i64 = self.conn.query_row(
            "select count(*) from lifecycle_events where run_id = ?",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Rebuild the live entities of `run_id` by replaying its events into a
    /// fresh, non-persistent store.
    ///
    /// Energies are those recorded at creation; in-place updates made between
    /// lifecycle events are not part of the log. A batch lost to a write
    /// failure can leave a creation whose preceding removal is missing; replay
    /// stops there with [`StorageError::Corrupt`] naming the row.
    pub fn replay(&self, run_id: &str) -> Result<EntityStore, StorageError> {
        let run = self.run(run_id)?;
        let mut store = EntityStore::new(StoreConfig::new(run.population_count, run.mode_label))?;
        let mut stmt = self.conn.prepare(
            "select seq, entity_id, population_id, energy, depth, event_type, cycle, metadata
             from lifecycle_events
             where run_id = ?
             order by seq asc",
        )?;
        let mut rows = stmt.query(params![run_id])?;
        while let Some(row) = rows.next()? {
            let seq: i64 = row.get(0)?;
            let corrupt = |reason: String| StorageError::Corrupt {
                run_id: run_id.to_string(),
                seq,
                reason,
            };
            let entity_id: String = row.get(1)?;
            let population = PopulationId(row.get::<_, i64>(2)? as u32);
            let event_type: String = row.get(5)?;
            let kind = LifecycleKind::parse(&event_type)
                .ok_or_else(|| corrupt(format!("unknown event type `{event_type}`")))?;
            store.set_cycle(Cycle(row.get::<_, i64>(6)? as u64));
            match kind {
                LifecycleKind::Created => {
                    let metadata: Metadata = match row.get::<_, Option<String>>(7)? {
                        Some(json) => serde_json::from_str(&json)
                            .map_err(|err| corrupt(format!("metadata: {err}")))?,
                        None => Metadata::new(),
                    };
                    let entity = popstore_core::Entity::new(
                        EntityId::from(entity_id),
                        population,
                        row.get(3)?,
                    )
                    .with_depth(row.get::<_, i64>(4)? as u32)
                    .with_metadata(metadata);
                    match store.add_agent(entity, population) {
                        Ok(_) => {}
                        Err(StoreError::DuplicateId { id, population: live_in }) => {
                            return Err(corrupt(format!(
                                "`{id}` created in population {population} while live in \
                                 population {live_in}; its removal is missing from the log"
                            )));
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                LifecycleKind::Removed => {
                    store.remove_agent(&entity_id, population)?;
                }
            }
        }
        Ok(store)
    }

    /// Size of each population after every cycle in which it changed.
    pub fn population_curve(&self, run_id: &str) -> Result<Vec<CurvePoint>, StorageError> {
        let mut stmt = self.conn.prepare(
            "select cycle, population_id,
                    cast(sum(case when event_type = 'created' then 1 else -1 end) as bigint) as delta
             from lifecycle_events
             where run_id = ?
             group by cycle, population_id
             order by cycle asc, population_id asc",
        )?;
        let mut rows = stmt.query(params![run_id])?;
        let mut sizes: HashMap<u32, i64> = HashMap::new();
        let mut curve = Vec::new();
        while let Some(row) = rows.next()? {
            let cycle = Cycle(row.get::<_, i64>(0)? as u64);
            let population = PopulationId(row.get::<_, i64>(1)? as u32);
            let delta: i64 = row.get(2)?;
            let size = sizes.entry(population.0).or_insert(0);
            *size += delta;
            curve.push(CurvePoint {
                cycle,
                population,
                size: *size,
            });
        }
        Ok(curve)
    }

    /// Snapshots recorded for `run_id`, ordered by cycle.
    pub fn snapshots(&self, run_id: &str) -> Result<Vec<Snapshot>, StorageError> {
        let mut stmt = self.conn.prepare(
            "select cycle, population_id, count, energy_sum, energy_mean, energy_min, energy_max
             from population_snapshots
             where run_id = ?
             order by cycle asc, population_id asc",
        )?;
        let mut rows = stmt.query(params![run_id])?;
        let mut snapshots: Vec<Snapshot> = Vec::new();
        while let Some(row) = rows.next()? {
            let cycle = Cycle(row.get::<_, i64>(0)? as u64);
            let stats = PopulationStats {
                population: PopulationId(row.get::<_, i64>(1)? as u32),
                count: row.get::<_, i64>(2)? as usize,
                energy_sum: row.get(3)?,
                energy_mean: row.get(4)?,
                energy_min: row.get(5)?,
                energy_max: row.get(6)?,
            };
            match snapshots.last_mut() {
                Some(last) if last.cycle == cycle => last.populations.push(stats),
                _ => snapshots.push(Snapshot {
                    cycle,
                    populations: vec![stats],
                }),
            }
        }
        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use popstore_core::{Entity, MetaValue, SnapshotExporter};
    use std::{
        fs,
        path::PathBuf,
        time::{SystemTime, UNIX_EPOCH},
    };

    fn temp_db_path(prefix: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time")
            .as_nanos();
        path.push(format!(
            "{}-{}-{}.duckdb",
            prefix,
            std::process::id(),
            timestamp
        ));
        path
    }

    fn small_batches(path: &Path) -> PersistenceConfig {
        PersistenceConfig {
            path: Some(path.to_path_buf()),
            event_batch: 3,
            snapshot_batch: 1,
        }
    }

    #[test]
    fn adapter_writes_events_runs_and_snapshots() -> Result<(), Box<dyn std::error::Error>> {
        let path = temp_db_path("popstore-adapter");
        let config = StoreConfig::new(2, "provenance");
        let mut store = open_store(config, &small_batches(&path))?;
        let run_id = store
            .adapter()
            .as_ref()
            .map(|adapter| adapter.run_id().to_string())
            .expect("enabled adapter");

        for i in 0..4 {
            store.add_agent(
                Entity::new(format!("a{i}"), PopulationId(0), 1.0 + f64::from(i))
                    .with_meta("phase", "seed"),
                PopulationId(0),
            )?;
        }
        store.advance_cycle();
        store.remove_agent("a1", PopulationId(0))?;
        let snapshot = SnapshotExporter::capture(&store);
        store.record_snapshot(&snapshot);
        store.close();

        let log = EventLog::open(&path)?;
        let run = log.run(&run_id)?;
        assert_eq!(run.mode_label, "provenance");
        assert_eq!(run.population_count, 2);
        assert_eq!(log.event_count(&run_id)?, 5);

        let snapshots = log.snapshots(&run_id)?;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0], snapshot);

        let replayed = log.replay(&run_id)?;
        let ids: Vec<_> = replayed
            .population(PopulationId(0))
            .map(|entity| entity.id().to_string())
            .collect();
        assert_eq!(ids, vec!["a0", "a2", "a3"]);
        let a2 = replayed.find("a2").expect("a2");
        assert_eq!(a2.energy, 3.0);
        assert_eq!(a2.meta("phase"), Some(&MetaValue::from("seed")));
        assert_eq!(replayed.cycle(), Cycle(1));

        drop(log);
        let _ = fs::remove_file(path);
        Ok(())
    }

    #[test]
    fn population_curve_accumulates_per_cycle() -> Result<(), Box<dyn std::error::Error>> {
        let path = temp_db_path("popstore-curve");
        let mut store = new_store(2, "search", Some(&path))?;
        let run_id = store
            .adapter()
            .as_ref()
            .map(|adapter| adapter.run_id().to_string())
            .expect("enabled adapter");

        for i in 0..3 {
            store.add_agent(Entity::new(format!("p{i}"), PopulationId(0), 1.0), PopulationId(0))?;
        }
        store.advance_cycle();
        store.remove_agent("p0", PopulationId(0))?;
        store.add_agent(Entity::new("q0", PopulationId(1), 1.0), PopulationId(1))?;
        store.advance_cycle();
        store.transfer("p1", PopulationId(0), PopulationId(1))?;
        store.close();

        let log = EventLog::open(&path)?;
        let curve = log.population_curve(&run_id)?;
        let points: Vec<_> = curve
            .iter()
            .map(|point| (point.cycle.0, point.population.0, point.size))
            .collect();
        assert_eq!(
            points,
            vec![(0, 0, 3), (1, 0, 2), (1, 1, 1), (2, 0, 1), (2, 1, 2)]
        );

        drop(log);
        let _ = fs::remove_file(path);
        Ok(())
    }

    #[test]
    fn disabled_path_creates_no_adapter() -> Result<(), Box<dyn std::error::Error>> {
        let store = new_store(3, "search", None)?;
        assert!(store.adapter().is_none());
        assert_eq!(store.failed_writes(), 0);
        Ok(())
    }

    #[test]
    fn unopenable_path_is_reported_at_construction() {
        let path = std::env::temp_dir()
            .join(format!("popstore-missing-{}", std::process::id()))
            .join("nested")
            .join("log.duckdb");
        assert!(new_store(3, "search", Some(&path)).is_err());
    }

    fn created(entity: &Entity) -> LifecycleEvent<'_> {
        LifecycleEvent {
            kind: LifecycleKind::Created,
            cycle: Cycle::zero(),
            population: entity.population(),
            entity,
        }
    }

    #[test]
    fn failed_batches_are_counted_and_leave_the_store_intact()
    -> Result<(), Box<dyn std::error::Error>> {
        let path = temp_db_path("popstore-write-failure");
        let config = StoreConfig::new(1, "search");
        let mut adapter = FileAdapter::open(&small_batches(&path), &config)?;
        let run_id = adapter.run_id().to_string();
        let seed = Entity::new("seed", PopulationId(0), 1.0);
        adapter.on_event(&created(&seed));
        adapter.flush();
        assert_eq!(adapter.failed_writes(), 0);

        // Reusing a sequence number violates the (run_id, seq) key.
        adapter.next_seq = 0;
        let mut store = EntityStore::with_adapter(config, Some(adapter))?;
        store.add_agent(Entity::new("x", PopulationId(0), 2.0), PopulationId(0))?;
        store.flush();
        assert_eq!(store.failed_writes(), 1);
        assert_eq!(store.find("x").map(|e| e.energy), Some(2.0));

        store.add_agent(Entity::new("y", PopulationId(0), 3.0), PopulationId(0))?;
        store.remove_agent("x", PopulationId(0))?;
        store.flush();
        assert_eq!(store.failed_writes(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.contains("y"));
        store.close();

        let log = EventLog::open(&path)?;
        // seed (seq 0), y (seq 1), removal of x (seq 2)
        assert_eq!(log.event_count(&run_id)?, 3);

        drop(log);
        let _ = fs::remove_file(path);
        Ok(())
    }

    #[test]
    fn events_after_close_are_counted_as_dropped() -> Result<(), Box<dyn std::error::Error>> {
        let path = temp_db_path("popstore-closed-adapter");
        let mut adapter = FileAdapter::open(&small_batches(&path), &StoreConfig::new(1, "search"))?;
        adapter.close();
        let late = Entity::new("late", PopulationId(0), 1.0);
        adapter.on_event(&created(&late));
        adapter.flush();
        assert_eq!(adapter.failed_writes(), 1);

        drop(adapter);
        let _ = fs::remove_file(path);
        Ok(())
    }

    #[test]
    fn replay_reports_a_missing_removal_as_corrupt() -> Result<(), Box<dyn std::error::Error>> {
        let path = temp_db_path("popstore-gap");
        let mut adapter = FileAdapter::open(&small_batches(&path), &StoreConfig::new(1, "search"))?;
        let run_id = adapter.run_id().to_string();
        let entity = Entity::new("a", PopulationId(0), 1.0);
        adapter.on_event(&created(&entity));
        adapter.on_event(&created(&entity));
        adapter.close();
        drop(adapter);

        let log = EventLog::open(&path)?;
        match log.replay(&run_id) {
            Err(StorageError::Corrupt { seq, reason, .. }) => {
                assert_eq!(seq, 1);
                assert!(reason.contains("removal is missing"), "{reason}");
            }
            other => panic!("expected corrupt record, got {:?}", other.map(|s| s.len())),
        }

        drop(log);
        let _ = fs::remove_file(path);
        Ok(())
    }

    #[test]
    fn missing_log_is_not_created_on_open() {
        let path = temp_db_path("popstore-typo");
        assert!(matches!(
            EventLog::open(&path),
            Err(StorageError::MissingLog(missing)) if missing == path
        ));
        assert!(!path.exists());
    }

    #[test]
    fn multiple_runs_share_one_file() -> Result<(), Box<dyn std::error::Error>> {
        let path = temp_db_path("popstore-runs");
        for label in ["first", "second"] {
            let mut store = new_store(1, label, Some(&path))?;
            store.add_agent(Entity::new("x", PopulationId(0), 1.0), PopulationId(0))?;
            store.close();
        }
        let log = EventLog::open(&path)?;
        let runs = log.runs()?;
        assert_eq!(runs.len(), 2);
        for run in &runs {
            assert_eq!(log.replay(&run.run_id)?.len(), 1);
        }
        assert!(matches!(log.run("nope"), Err(StorageError::UnknownRun(_))));

        drop(log);
        let _ = fs::remove_file(path);
        Ok(())
    }
}

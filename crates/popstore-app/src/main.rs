use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use popstore_app::{ChurnDriver, DriverConfig};
use popstore_core::PopulationId;
use popstore_storage::{EventLog, RunInfo, open_store};
use std::{
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "popstore",
    version,
    about = "Drive churn workloads against a population store and inspect their event logs"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a seeded churn workload, optionally persisting its lifecycle log.
    Run(RunArgs),
    /// List the runs recorded in an event log.
    Runs {
        /// DuckDB event log to read.
        db: PathBuf,
    },
    /// Replay a recorded run and print its populations.
    Inspect {
        /// DuckDB event log to read.
        db: PathBuf,
        /// Run to inspect; defaults to the most recent one.
        #[arg(long)]
        run_id: Option<String>,
        /// Also print the population size curve.
        #[arg(long)]
        curve: bool,
        /// Also print persisted snapshots.
        #[arg(long)]
        snapshots: bool,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// TOML driver configuration; flags below override it.
    #[arg(short, long, env = "POPSTORE_CONFIG")]
    config: Option<PathBuf>,
    /// Persist lifecycle events to this DuckDB file.
    #[arg(long, env = "POPSTORE_DB")]
    db: Option<PathBuf>,
    #[arg(long)]
    populations: Option<usize>,
    #[arg(long)]
    cycles: Option<u64>,
    #[arg(long)]
    seed: Option<u64>,
    /// Free-form label copied into persisted runs.
    #[arg(long)]
    mode: Option<String>,
    #[arg(long)]
    initial: Option<usize>,
    /// Stop once the store holds more than this many entities.
    #[arg(long)]
    cap: Option<usize>,
    /// Cycles between snapshots; zero disables them.
    #[arg(long)]
    snapshot_interval: Option<u64>,
    /// Write the retained snapshot history here as JSON lines.
    #[arg(long)]
    snapshots_out: Option<PathBuf>,
}

impl RunArgs {
    fn resolve(&self) -> Result<DriverConfig> {
        let mut config = match &self.config {
            Some(path) => DriverConfig::load(path)?,
            None => DriverConfig::default(),
        };
        if let Some(db) = &self.db {
            config.persistence.path = Some(db.clone());
        }
        if let Some(populations) = self.populations {
            config.store.population_count = populations;
        }
        if let Some(cycles) = self.cycles {
            config.cycles = cycles;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(mode) = &self.mode {
            config.store.mode_label = mode.clone();
        }
        if let Some(initial) = self.initial {
            config.initial_entities = initial;
        }
        if let Some(cap) = self.cap {
            config.population_cap = cap;
        }
        if let Some(interval) = self.snapshot_interval {
            config.snapshot_interval = interval;
        }
        config.validate().context("invalid driver configuration")?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_command(&args),
        Command::Runs { db } => runs_command(&db),
        Command::Inspect {
            db,
            run_id,
            curve,
            snapshots,
        } => inspect_command(&db, run_id, curve, snapshots),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn run_command(args: &RunArgs) -> Result<()> {
    let config = args.resolve()?;
    let store = open_store(config.store.clone(), &config.persistence)
        .context("failed to open entity store")?;
    let run_id = store.adapter().as_ref().map(|adapter| adapter.run_id().to_string());
    if let Some(run_id) = &run_id {
        info!(%run_id, "persisting lifecycle events");
    }

    let mut driver = ChurnDriver::new(config, store)?;
    driver.seed()?;
    let summary = driver.run()?;

    if let Some(path) = &args.snapshots_out {
        let file = File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        driver
            .exporter()
            .write_jsonl(BufWriter::new(file))
            .with_context(|| format!("failed to write snapshots to {}", path.display()))?;
    }
    driver.into_store().close();

    if summary.failed_writes > 0 {
        warn!(
            failed_writes = summary.failed_writes,
            "some lifecycle writes were not persisted"
        );
    }
    println!("{}", serde_json::to_string_pretty(&summary)?);
    if let Some(run_id) = run_id {
        println!("run_id: {run_id}");
    }
    Ok(())
}

fn runs_command(db: &Path) -> Result<()> {
    let log = EventLog::open(db).with_context(|| format!("failed to open {}", db.display()))?;
    let runs = log.runs()?;
    if runs.is_empty() {
        println!("no runs recorded");
        return Ok(());
    }
    for run in runs {
        print_run(&run);
    }
    Ok(())
}

fn inspect_command(
    db: &Path,
    run_id: Option<String>,
    curve: bool,
    snapshots: bool,
) -> Result<()> {
    let log = EventLog::open(db).with_context(|| format!("failed to open {}", db.display()))?;
    let run = match run_id {
        Some(run_id) => log.run(&run_id)?,
        None => match log.latest_run()? {
            Some(run) => run,
            None => bail!("{} holds no runs", db.display()),
        },
    };
    print_run(&run);

    let replayed = log
        .replay(&run.run_id)
        .with_context(|| format!("failed to replay run {}", run.run_id))?;
    println!("live entities: {}", replayed.len());
    for index in 0..replayed.population_count() {
        let population = PopulationId(index as u32);
        let energy: f64 = replayed.population(population).map(|e| e.energy).sum();
        println!(
            "  population {population}: {} entities, energy at creation {energy:.3}",
            replayed.population_len(population)
        );
    }

    if curve {
        println!("cycle\tpopulation\tsize");
        for point in log.population_curve(&run.run_id)? {
            println!("{}\t{}\t{}", point.cycle, point.population, point.size);
        }
    }
    if snapshots {
        for snapshot in log.snapshots(&run.run_id)? {
            println!("{}", serde_json::to_string(&snapshot)?);
        }
    }
    Ok(())
}

fn print_run(run: &RunInfo) {
    println!(
        "{}  mode={}  populations={}  started={}",
        run.run_id,
        run.mode_label,
        run.population_count,
        run.started_at.to_rfc3339()
    );
}

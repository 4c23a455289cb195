use popstore_core::{Entity, MetaValue, PersistenceConfig, PopulationId, StoreConfig};
use popstore_storage::{EventLog, new_store, open_store};
use proptest::prelude::*;
use std::{
    collections::HashSet,
    fs,
    path::PathBuf,
    sync::atomic::Ordering,
    time::{SystemTime, UNIX_EPOCH},
};

fn temp_db_path(prefix: &str) -> PathBuf {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    std::env::temp_dir().join(format!(
        "{prefix}_{}_{}.duckdb",
        std::process::id(),
        timestamp
    ))
}

#[test]
fn ten_added_five_removed_replays_five_live() {
    let path = temp_db_path("popstore_scenario_c");
    let mut store = new_store(3, "provenance", Some(&path)).expect("store");
    let run_id = store
        .adapter()
        .as_ref()
        .expect("persistence enabled")
        .run_id()
        .to_string();
    let failures = store
        .adapter()
        .as_ref()
        .expect("persistence enabled")
        .failure_counter();

    for i in 0..10 {
        let population = PopulationId(i % 3);
        store
            .add_agent(
                Entity::new(format!("0_{i}"), population, 0.5 + f64::from(i)),
                population,
            )
            .expect("add");
        store.advance_cycle();
    }
    for i in (0..10).step_by(2) {
        store
            .remove_agent(format!("0_{i}"), PopulationId(i % 3))
            .expect("remove");
    }
    let live_counts: Vec<_> = (0..3)
        .map(|p| store.population_len(PopulationId(p)))
        .collect();
    store.close();
    assert_eq!(failures.load(Ordering::Relaxed), 0);

    let log = EventLog::open(&path).expect("log");
    let replayed = log.replay(&run_id).expect("replay");
    assert_eq!(replayed.len(), 5);
    for i in (1..10).step_by(2) {
        let entity = replayed.find(format!("0_{i}")).expect("survivor");
        assert_eq!(entity.population(), PopulationId(i % 3));
        assert_eq!(entity.energy, 0.5 + f64::from(i));
        assert_eq!(entity.depth, i % 3);
    }
    let replayed_counts: Vec<_> = (0..3)
        .map(|p| replayed.population_len(PopulationId(p)))
        .collect();
    assert_eq!(replayed_counts, live_counts);

    drop(log);
    let _ = fs::remove_file(&path);
}

#[test]
fn non_finite_float_metadata_survives_replay() {
    let path = temp_db_path("popstore_float_meta");
    let mut store = new_store(1, "search", Some(&path)).expect("store");
    let run_id = store
        .adapter()
        .as_ref()
        .expect("persistence enabled")
        .run_id()
        .to_string();
    store
        .add_agent(
            Entity::new("a", PopulationId(0), 1.0)
                .with_meta("magnitude", f64::NAN)
                .with_meta("ceiling", f64::INFINITY),
            PopulationId(0),
        )
        .expect("add");
    store
        .add_agent(Entity::new("b", PopulationId(0), 2.0), PopulationId(0))
        .expect("add");
    store.close();

    let log = EventLog::open(&path).expect("log");
    let replayed = log.replay(&run_id).expect("replay");
    assert_eq!(replayed.len(), 2);
    let a = replayed.find("a").expect("a");
    assert!(matches!(a.meta("magnitude"), Some(MetaValue::Float(v)) if v.is_nan()));
    assert_eq!(a.meta("ceiling"), Some(&MetaValue::Float(f64::INFINITY)));
    assert!(replayed.contains("b"));

    drop(log);
    let _ = fs::remove_file(&path);
}

#[test]
fn drop_without_close_still_commits() {
    let path = temp_db_path("popstore_drop_flush");
    let run_id = {
        let persistence = PersistenceConfig {
            path: Some(path.clone()),
            event_batch: 1_000,
            ..PersistenceConfig::default()
        };
        let mut store = open_store(StoreConfig::new(1, "search"), &persistence).expect("store");
        for i in 0..25 {
            store
                .add_agent(Entity::new(format!("d{i}"), PopulationId(0), 1.0), PopulationId(0))
                .expect("add");
        }
        let run_id = store
            .adapter()
            .as_ref()
            .expect("persistence enabled")
            .run_id()
            .to_string();
        run_id
    };

    let log = EventLog::open(&path).expect("log");
    assert_eq!(log.event_count(&run_id).expect("count"), 25);
    drop(log);
    let _ = fs::remove_file(&path);
}

#[derive(Debug, Clone)]
enum Op {
    Add { key: u8, population: u32, energy: f64 },
    Remove { key: u8, population: u32 },
    Tick,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..40, 0u32..3, 0.0f64..10.0)
            .prop_map(|(key, population, energy)| Op::Add { key, population, energy }),
        3 => (0u8..40, 0u32..3).prop_map(|(key, population)| Op::Remove { key, population }),
        1 => Just(Op::Tick),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn replay_reconstructs_final_counts(ops in prop::collection::vec(op_strategy(), 1..120)) {
        let path = temp_db_path("popstore_replay_prop");
        let persistence = PersistenceConfig {
            path: Some(path.clone()),
            event_batch: 16,
            ..PersistenceConfig::default()
        };
        let mut store = open_store(StoreConfig::new(3, "search"), &persistence).expect("store");
        let run_id = store.adapter().as_ref().expect("enabled").run_id().to_string();

        for op in &ops {
            match *op {
                Op::Add { key, population, energy } => {
                    // Duplicates are expected to fail and must not change anything.
                    let _ = store.add_agent(
                        Entity::new(format!("k{key}"), PopulationId(population), energy),
                        PopulationId(population),
                    );
                }
                Op::Remove { key, population } => {
                    store.remove_agent(format!("k{key}"), PopulationId(population)).expect("remove");
                }
                Op::Tick => {
                    store.advance_cycle();
                }
            }
        }

        let expected: Vec<HashSet<String>> = (0..3)
            .map(|p| {
                store
                    .population(PopulationId(p))
                    .map(|entity| entity.id().to_string())
                    .collect()
            })
            .collect();
        store.close();

        let log = EventLog::open(&path).expect("log");
        let replayed = log.replay(&run_id).expect("replay");
        for (p, ids) in expected.iter().enumerate() {
            let got: HashSet<String> = replayed
                .population(PopulationId(p as u32))
                .map(|entity| entity.id().to_string())
                .collect();
            prop_assert_eq!(&got, ids);
        }
        drop(log);
        let _ = fs::remove_file(&path);
    }
}

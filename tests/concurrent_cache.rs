//! Concurrency stress over the prepared cache: mixed get/use/add/delete
//! traffic with runtime capacity changes must keep the cache within its
//! limit and never corrupt entries.

mod common;

use std::sync::Arc;

use common::{seeded_orders, RegistryParser};
use penumbra::algebra::{KeyspaceTerm, Projection, Select, Statement};
use penumbra::config::FeatureControls;
use penumbra::datastore::Datastore;
use penumbra::planner::build_prepared;
use penumbra::prepareds::{NoRemote, Prepareds, OPT_TRACK};
use penumbra::Value;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn select_star() -> Statement {
    let mut stmt = Statement::Select(Select::simple(
        KeyspaceTerm::new("default", "orders", None),
        None,
        Projection::star(),
    ));
    stmt.formalize().unwrap();
    stmt
}

#[test]
fn mixed_traffic_respects_the_limit() {
    let (store, _) = seeded_orders();
    let parser = RegistryParser::new();
    let prepareds = Arc::new(Prepareds::new(
        8,
        Arc::clone(&store) as Arc<dyn Datastore>,
        parser,
        Arc::new(NoRemote),
        "default",
        4,
        FeatureControls::default(),
    ));
    let stmt = select_star();

    std::thread::scope(|s| {
        for seed in 0..6u64 {
            let prepareds = Arc::clone(&prepareds);
            let store = Arc::clone(&store);
            let stmt = stmt.clone();
            s.spawn(move || {
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                for i in 0..200 {
                    let name = format!("p{}", rng.gen_range(0..16));
                    match i % 4 {
                        0 => {
                            let prepared = build_prepared(
                                &stmt,
                                &name,
                                "SELECT * FROM orders",
                                store.as_ref(),
                                "default",
                                4,
                                FeatureControls::default(),
                            )
                            .unwrap();
                            // Same text everywhere, so inserts only amend.
                            prepareds.add_prepared(Arc::new(prepared)).unwrap();
                        }
                        1 => {
                            let _ = prepareds
                                .get_prepared(&Value::from(name.as_str()), OPT_TRACK);
                        }
                        2 => {
                            let _ =
                                prepareds.get_prepared(&Value::from(name.as_str()), 0);
                        }
                        _ => {
                            let _ = prepareds.delete_prepared(&name);
                        }
                    }
                    if i % 50 == 0 {
                        prepareds.set_limit(if rng.gen_bool(0.5) { 4 } else { 8 });
                    }
                    // The limit oscillates between 4 and 8 across threads,
                    // so only the upper bound is race-free to assert here.
                    assert!(prepareds.count() <= 8);
                }
            });
        }
    });

    assert!(prepareds.count() <= prepareds.limit());
    // Every surviving entry is intact.
    prepareds.for_each(|name, entry| {
        assert_eq!(entry.prepared().name, name);
        assert_eq!(entry.prepared().text, "SELECT * FROM orders");
        true
    });
}

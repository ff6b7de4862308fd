//! Multi-child scans and pipeline cancellation, driven through full plans.

use std::sync::Arc;
use std::time::Duration;

use penumbra::datastore::Keyspace;

use penumbra::datastore::memory::MemDatastore;
use penumbra::execution::{run, ExecContext};
use penumbra::expression::Expr;
use penumbra::plan::{Cost, KeyspaceRef, Operator, Span2};
use penumbra::Value;

/// Keyspace whose documents carry flag fields selected by per-flag
/// indexes: `a → {k1,k2,k3}`, `b → {k2,k3,k4}`, `c → {k3,k5}`.
fn seeded_flags() -> Arc<MemDatastore> {
    let store = Arc::new(MemDatastore::new());
    let ks = store.keyspace_or_create("default", "d");
    let doc = |flags: &[&str]| {
        Value::Object(
            flags
                .iter()
                .map(|f| ((*f).to_owned(), Value::from(1.0)))
                .collect(),
        )
    };
    ks.upsert(&[
        ("k1".into(), doc(&["a"])),
        ("k2".into(), doc(&["a", "b"])),
        ("k3".into(), doc(&["a", "b", "c"])),
        ("k4".into(), doc(&["b"])),
        ("k5".into(), doc(&["c"])),
    ])
    .unwrap();
    ks.create_primary_index("#primary");
    for name in ["a", "b", "c"] {
        ks.create_index(&format!("ix_{name}"), vec![Expr::field([name])]);
    }
    store
}

fn scan_for(field: &str) -> Operator {
    Operator::IndexScan3 {
        index: format!("ix_{field}"),
        keyspace: KeyspaceRef::new("default", "d", None),
        spans: vec![Span2::point(Expr::literal(1.0))],
        covers: Vec::new(),
        index_projection: None,
        ordered: false,
        offset: None,
        limit: None,
        cost: Cost::default(),
    }
}

fn keys_of(rows: &[Value]) -> Vec<String> {
    let mut keys: Vec<String> = rows
        .iter()
        .map(|r| r.field("d").field("k").as_str().unwrap_or_default().to_owned())
        .collect();
    keys.sort();
    keys
}

/// S4 and P6: the intersect scan emits exactly the intersection of its
/// children's key sets.
#[test]
fn intersect_scan_emits_the_intersection() {
    let store = seeded_flags();
    // Tag each document with its own key for assertion convenience.
    let ks = store.keyspace_or_create("default", "d");
    for key in ["k1", "k2", "k3", "k4", "k5"] {
        let mut doc = ks.fetch(&[key.to_owned()]).unwrap()[0].1.clone();
        if let Value::Object(map) = &mut doc {
            map.insert("k".into(), Value::from(key));
        }
        ks.upsert(&[(key.to_owned(), doc)]).unwrap();
    }

    let plan = Operator::Sequence {
        children: vec![
            Operator::IntersectScan {
                scans: vec![scan_for("a"), scan_for("b"), scan_for("c")],
                limit: None,
                cost: Cost::default(),
            },
            Operator::Fetch {
                keyspace: KeyspaceRef::new("default", "d", None),
                cost: Cost::default(),
            },
            Operator::Stream {},
        ],
    };
    let ctx = ExecContext::new(store);
    let result = run(&plan, &ctx).unwrap();
    assert_eq!(keys_of(&result.rows), vec!["k3"]);
}

/// P6 limit clause: with limit L the emitted sequence has length at most L.
#[test]
fn intersect_scan_honours_limit() {
    let store = seeded_flags();
    let plan = Operator::Sequence {
        children: vec![
            Operator::IntersectScan {
                scans: vec![scan_for("a"), scan_for("b")],
                limit: Some(Expr::literal(1.0)),
                cost: Cost::default(),
            },
            Operator::Stream {},
        ],
    };
    let ctx = ExecContext::new(store);
    let result = run(&plan, &ctx).unwrap();
    assert_eq!(result.rows.len(), 1);
}

/// Union scan deduplicates keys across children.
#[test]
fn union_scan_deduplicates() {
    let store = seeded_flags();
    let plan = Operator::Sequence {
        children: vec![
            Operator::UnionScan {
                scans: vec![scan_for("a"), scan_for("b")],
                limit: None,
                cost: Cost::default(),
            },
            Operator::Stream {},
        ],
    };
    let ctx = ExecContext::new(store);
    let result = run(&plan, &ctx).unwrap();
    assert_eq!(result.rows.len(), 4); // k1..k4 once each
}

/// P8: stopping the root returns every worker in bounded time; the run
/// completes rather than deadlocking on bounded channels.
#[test]
fn stop_quiesces_a_deep_pipeline() {
    let store = Arc::new(MemDatastore::new());
    let ks = store.keyspace_or_create("default", "big");
    let docs: Vec<(String, Value)> = (0..5_000)
        .map(|i| {
            (
                format!("k{i:05}"),
                Value::object([("n", Value::from(i as f64))]),
            )
        })
        .collect();
    ks.upsert(&docs).unwrap();
    ks.create_primary_index("#primary");

    let plan = Operator::Sequence {
        children: vec![
            Operator::PrimaryScan {
                index: "#primary".into(),
                keyspace: KeyspaceRef::new("default", "big", None),
                limit: None,
                cost: Cost::default(),
            },
            Operator::Fetch {
                keyspace: KeyspaceRef::new("default", "big", None),
                cost: Cost::default(),
            },
            Operator::Stream {},
        ],
    };
    // A tiny pipeline capacity maximises back-pressure.
    let ctx = ExecContext::with_options(Arc::clone(&store) as _, None, 2);
    let stopper = {
        let ctx = ctx.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            ctx.send_stop();
        })
    };
    let started = std::time::Instant::now();
    let result = run(&plan, &ctx).unwrap();
    stopper.join().unwrap();
    // The essential property: every worker reached a terminal state in
    // bounded time with no producer left blocked on a bounded send.
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(result.rows.len() <= 5_000);
}

/// A request timeout surfaces as the timeout error and stops the tree.
#[test]
fn timeout_expires_the_request() {
    let store = seeded_flags();
    let plan = Operator::Sequence {
        children: vec![
            Operator::PrimaryScan {
                index: "#primary".into(),
                keyspace: KeyspaceRef::new("default", "d", None),
                limit: None,
                cost: Cost::default(),
            },
            Operator::Stream {},
        ],
    };
    let ctx = ExecContext::with_options(store as _, Some(Duration::ZERO), 4);
    let err = run(&plan, &ctx).unwrap_err();
    assert_eq!(err.code(), 1080);
}

//! Intersect scan: AND-combination of child scans by primary key.
//!
//! Each child is assigned a bit; a shared channel merges child items tagged
//! with the producer's bit. Two pooled scratch maps track, per primary key,
//! the first item seen and the OR of producer bits. A key whose bit set
//! reaches the full mask is emitted immediately and forgotten. When every
//! child has terminated, a final sweep emits any remaining key matched by
//! every child that produced at all, which keeps the emitted set equal to
//! the exact intersection under natural completion. A limit cuts delivery
//! short and cancels the children by dropping the merge channel.

use std::collections::HashMap;
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::OnceLock;

use crate::config::DEFAULT_PIPELINE_CAP;
use crate::errors::Error;
use crate::expression::Expr;
use crate::plan::Operator;
use crate::value::MapPool;

use super::base::{eval_count, item_channel, recv_item, send_item, Item, ItemSender};
use super::context::ExecContext;
use super::run_operator;

/// Message on the merge channel: a tagged item or a child's termination.
enum ScanMsg {
    Item(Item),
    Done(u8),
}

static INDEX_VALUE_POOL: OnceLock<MapPool<Item>> = OnceLock::new();
static INDEX_BIT_POOL: OnceLock<MapPool<i64>> = OnceLock::new();

fn value_pool() -> &'static MapPool<Item> {
    INDEX_VALUE_POOL.get_or_init(|| MapPool::new(DEFAULT_PIPELINE_CAP))
}

fn bit_pool() -> &'static MapPool<i64> {
    INDEX_BIT_POOL.get_or_init(|| MapPool::new(DEFAULT_PIPELINE_CAP))
}

/// Empties the scratch-map pools so shutdown leak accounting sees nothing
/// retained.
pub(super) fn drain_pools() {
    if let Some(pool) = INDEX_VALUE_POOL.get() {
        pool.drain();
    }
    if let Some(pool) = INDEX_BIT_POOL.get() {
        pool.drain();
    }
}

pub(super) fn run(
    scans: &[Operator],
    limit: Option<&Expr>,
    ctx: &ExecContext,
    output: ItemSender,
) {
    if scans.is_empty() {
        ctx.fail(Error::internal("intersect scan has no scans"));
        return;
    }
    if scans.len() > 64 {
        ctx.fail(Error::internal("intersect scan exceeds 64 children"));
        return;
    }
    let limit = match limit.map(|l| eval_count(l, ctx)) {
        Some(None) => return,
        Some(Some(n)) => n,
        None => 0,
    };

    // Pooled scratch maps when the pipeline fits the pool sizing.
    let pooled = ctx.pipeline_cap() <= value_pool().size();
    let mut values = if pooled {
        value_pool().get()
    } else {
        HashMap::with_capacity(ctx.pipeline_cap())
    };
    let mut bits = if pooled {
        bit_pool().get()
    } else {
        HashMap::with_capacity(ctx.pipeline_cap())
    };

    let full_bits = if scans.len() == 64 {
        -1i64
    } else {
        (1i64 << scans.len()) - 1
    };

    let (merge_tx, merge_rx) = sync_channel::<ScanMsg>(ctx.pipeline_cap());
    std::thread::scope(|s| {
        for (i, scan) in scans.iter().enumerate() {
            let merge_tx = merge_tx.clone();
            s.spawn(move || run_child(scan, i as u8, ctx, merge_tx));
        }
        drop(merge_tx);

        let mut state = Sweep {
            child_bits: 0,
            sent: 0,
            stopped: false,
        };
        let mut merge_rx = Some(merge_rx);
        let mut remaining = scans.len();
        while let Some(rx) = merge_rx.as_ref() {
            let Ok(msg) = rx.recv() else { break };
            if ctx.stopped() {
                state.stopped = true;
                break;
            }
            match msg {
                ScanMsg::Done(bit) => {
                    state.child_bits |= 1i64 << bit;
                    remaining -= 1;
                    if remaining == 0 {
                        break;
                    }
                }
                ScanMsg::Item(item) => {
                    if !process_key(
                        item, &mut values, &mut bits, full_bits, limit, &mut state, ctx,
                        &output,
                    ) {
                        // Limit reached or consumer gone: cancel children by
                        // dropping the merge channel.
                        merge_rx = None;
                    }
                }
            }
        }
        if let Some(rx) = merge_rx.take() {
            drop(rx);
        }
        // Children unblock on the dropped channel; the scope joins them.

        if !state.stopped
            && !ctx.stopped()
            && state.child_bits != 0
            && (limit <= 0 || state.sent < limit)
        {
            send_remaining(&values, &bits, state.child_bits, ctx, &output);
        }
    });

    if pooled {
        value_pool().put(values);
        bit_pool().put(bits);
    }
}

/// Runs one child scan, tagging its items with its bit and announcing its
/// termination on the merge channel.
fn run_child(scan: &Operator, bit: u8, ctx: &ExecContext, merge_tx: SyncSender<ScanMsg>) {
    let (tx, rx) = item_channel(ctx);
    std::thread::scope(|s| {
        s.spawn(|| run_operator(scan, ctx, None, tx));
        while let Some(mut item) = recv_item(&rx, ctx) {
            item.set_bit(bit);
            if merge_tx.send(ScanMsg::Item(item)).is_err() {
                break;
            }
        }
    });
    let _ = merge_tx.send(ScanMsg::Done(bit));
}

struct Sweep {
    child_bits: i64,
    sent: i64,
    stopped: bool,
}

/// Records one incoming key. Returns false when forwarding must cease.
#[allow(clippy::too_many_arguments)]
fn process_key(
    item: Item,
    values: &mut HashMap<String, Item>,
    bits: &mut HashMap<String, i64>,
    full_bits: i64,
    limit: i64,
    state: &mut Sweep,
    ctx: &ExecContext,
    output: &ItemSender,
) -> bool {
    let Some(key) = item.meta_id().map(str::to_owned) else {
        ctx.fail(Error::InvalidValue {
            reason: "intersect scan item is missing its primary key".into(),
        });
        return false;
    };

    let entry = bits.entry(key.clone()).or_insert(0);
    if *entry == 0 {
        values.insert(key.clone(), item.clone());
    }
    *entry |= 1i64 << item.bit();

    if (*entry & full_bits) ^ full_bits == 0 {
        let mut matched = values.remove(&key).unwrap_or(item);
        bits.remove(&key);
        if limit > 0 {
            state.sent += 1;
        }
        matched.set_bit(0);
        if !send_item(output, matched, ctx) {
            return false;
        }
        return limit <= 0 || state.sent < limit;
    }
    true
}

/// Final sweep: emits entries matched by every child that produced.
fn send_remaining(
    values: &HashMap<String, Item>,
    bits: &HashMap<String, i64>,
    child_bits: i64,
    ctx: &ExecContext,
    output: &ItemSender,
) {
    for (key, key_bits) in bits {
        if (key_bits & child_bits) ^ child_bits == 0 {
            let Some(item) = values.get(key) else { continue };
            let mut item = item.clone();
            item.set_bit(0);
            if !send_item(output, item, ctx) {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::Keyspace;
    use crate::datastore::memory::MemDatastore;
    use crate::execution::base::item_channel;
    use crate::plan::{Cost, KeyspaceRef, Span2};
    use crate::value::Value;
    use std::sync::Arc;

    /// Builds a keyspace where `flag<i>` fields select different key sets.
    fn seeded() -> Arc<MemDatastore> {
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

    fn run_intersect(
        ctx: &ExecContext,
        scans: Vec<Operator>,
        limit: Option<Expr>,
    ) -> Vec<String> {
        let (tx, rx) = item_channel(ctx);
        run(&scans, limit.as_ref(), ctx, tx);
        let mut keys = Vec::new();
        while let Some(item) = recv_item(&rx, ctx) {
            keys.push(item.meta_id().unwrap().to_owned());
        }
        keys.sort();
        keys
    }

    #[test]
    fn emits_exactly_the_intersection() {
        let ctx = ExecContext::new(seeded());
        // a → {k1,k2,k3}, b → {k2,k3,k4}, c → {k3,k5}
        let keys = run_intersect(
            &ctx,
            vec![scan_for("a"), scan_for("b"), scan_for("c")],
            None,
        );
        assert_eq!(keys, vec!["k3"]);
    }

    #[test]
    fn two_way_intersection() {
        let ctx = ExecContext::new(seeded());
        let keys = run_intersect(&ctx, vec![scan_for("a"), scan_for("b")], None);
        assert_eq!(keys, vec!["k2", "k3"]);
    }

    #[test]
    fn limit_caps_emission() {
        let ctx = ExecContext::new(seeded());
        let keys = run_intersect(
            &ctx,
            vec![scan_for("a"), scan_for("b")],
            Some(Expr::literal(1.0)),
        );
        assert_eq!(keys.len(), 1);
    }

    #[test]
    fn empty_child_empties_the_result() {
        let store = seeded();
        let ks = store.keyspace_or_create("default", "d");
        ks.create_index("ix_zz", vec![Expr::field(["zz"])]);
        let ctx = ExecContext::new(store);
        let keys = run_intersect(&ctx, vec![scan_for("a"), scan_for("zz")], None);
        assert!(keys.is_empty());
    }
}

//! Scan operators: dummy, primary, and secondary index scans.

use std::sync::mpsc::sync_channel;
use std::time::Instant;

use crate::datastore::{IndexItem, ScanSink};
use crate::errors::Error;
use crate::expression::Expr;
use crate::plan::{IndexProjection, KeyspaceRef, Spans2};
use crate::value::{AnnotatedValue, Value};

use super::base::{eval_count, send_item, set_path, Item, ItemSender};
use super::context::{ExecContext, Phase};

/// Emits a single empty item, driving FROM-less projections and
/// values-style DML.
pub(super) fn run_dummy(ctx: &ExecContext, output: ItemSender) {
    send_item(&output, AnnotatedValue::new(Value::object(Vec::<(String, crate::value::Value)>::new())), ctx);
}

pub(super) fn run_primary(
    index: &str,
    keyspace: &KeyspaceRef,
    limit: Option<&Expr>,
    ctx: &ExecContext,
    output: ItemSender,
) {
    let limit = match limit.map(|l| eval_count(l, ctx)) {
        Some(None) => return,
        Some(Some(n)) => Some(n as u64),
        None => None,
    };
    scan_into(index, keyspace, &[], limit, ctx, |entry| {
        Some(AnnotatedValue::with_meta_id(
            Value::object(Vec::<(String, crate::value::Value)>::new()),
            entry.primary_key,
        ))
    }, output);
}

#[allow(clippy::too_many_arguments)]
pub(super) fn run_index(
    index: &str,
    keyspace: &KeyspaceRef,
    spans: &Spans2,
    covers: &[Expr],
    index_projection: Option<&IndexProjection>,
    offset: Option<&Expr>,
    limit: Option<&Expr>,
    ctx: &ExecContext,
    output: ItemSender,
) {
    let offset = match offset.map(|o| eval_count(o, ctx)) {
        Some(None) => return,
        Some(Some(n)) => n as u64,
        None => 0,
    };
    let limit = match limit.map(|l| eval_count(l, ctx)) {
        Some(None) => return,
        Some(Some(n)) => Some(n as u64),
        None => None,
    };
    // The index applies the cap after the skip, so widen it.
    let scan_limit = limit.map(|l| l.saturating_add(offset));

    let mut resolved = Vec::with_capacity(spans.len());
    for span in spans {
        match span.resolve(ctx) {
            Ok(vs) => resolved.push(vs),
            Err(err) => {
                ctx.fail(err);
                return;
            }
        }
    }

    let entry_keys: Vec<usize> = index_projection
        .map(|p| p.entry_keys.clone())
        .unwrap_or_default();
    let covering = !covers.is_empty();
    let mut skipped = 0u64;
    scan_into(index, keyspace, &resolved, scan_limit, ctx, |entry| {
        if skipped < offset {
            skipped += 1;
            return None;
        }
        let mut value = Value::object(Vec::<(String, crate::value::Value)>::new());
        if covering {
            // Surface the projected index keys under their covered paths so
            // downstream expressions evaluate without a fetch.
            for &pos in &entry_keys {
                let (Some(cover), Some(v)) = (covers.get(pos), entry.entry_values.get(pos))
                else {
                    continue;
                };
                if let Expr::Field(path) = cover {
                    set_path(&mut value, path, v.clone());
                }
            }
        }
        Some(AnnotatedValue::with_meta_id(value, entry.primary_key))
    }, output);
}

/// Drives a datastore index scan, transforming entries into items.
fn scan_into(
    index_name: &str,
    keyspace: &KeyspaceRef,
    spans: &[crate::datastore::ValueSpan],
    limit: Option<u64>,
    ctx: &ExecContext,
    mut to_item: impl FnMut(IndexItem) -> Option<Item>,
    output: ItemSender,
) {
    let started = Instant::now();
    let keyspace_handle = match ctx.datastore().keyspace(&keyspace.namespace, &keyspace.keyspace)
    {
        Ok(ks) => ks,
        Err(err) => {
            ctx.fail(err);
            return;
        }
    };
    let index = match keyspace_handle.index_by_name(index_name) {
        Ok(Some(ix)) => ix,
        Ok(None) => {
            ctx.fail(Error::Datastore {
                reason: format!("no such index: {index_name}"),
            });
            return;
        }
        Err(err) => {
            ctx.fail(err);
            return;
        }
    };

    let (tx, rx) = sync_channel::<IndexItem>(ctx.pipeline_cap());
    std::thread::scope(|s| {
        s.spawn(|| {
            let stopped = || ctx.stopped();
            let sink = ScanSink::new(tx, &stopped);
            if let Err(err) = index.scan(spans, limit, &sink) {
                ctx.fail(err);
            }
        });
        for entry in rx.iter() {
            if ctx.stopped() {
                break;
            }
            if let Some(item) = to_item(entry) {
                if !send_item(&output, item, ctx) {
                    break;
                }
            }
        }
        // Unblock the producer if we left early.
        while rx.try_recv().is_ok() {}
    });
    ctx.record_phase(Phase::Scan, started);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::Keyspace;
    use crate::datastore::memory::MemDatastore;
    use crate::execution::base::{item_channel, recv_item};
    use crate::plan::{Span2, SpanRange};
    use std::sync::Arc;

    fn seeded() -> Arc<MemDatastore> {
        let store = Arc::new(MemDatastore::new());
        let ks = store.keyspace_or_create("default", "orders");
        ks.upsert(&[
            ("k1".into(), Value::object([("n", Value::from(1.0))])),
            ("k2".into(), Value::object([("n", Value::from(2.0))])),
            ("k3".into(), Value::object([("n", Value::from(3.0))])),
        ])
        .unwrap();
        ks.create_primary_index("#primary");
        ks.create_index("ix_n", vec![Expr::field(["n"])]);
        store
    }

    fn keyspace_ref() -> KeyspaceRef {
        KeyspaceRef::new("default", "orders", Some("o".into()))
    }

    fn collect_keys(ctx: &ExecContext, f: impl FnOnce(ItemSender)) -> Vec<String> {
        let (tx, rx) = item_channel(ctx);
        f(tx);
        let mut keys = Vec::new();
        while let Some(item) = recv_item(&rx, ctx) {
            keys.push(item.meta_id().unwrap().to_owned());
        }
        keys
    }

    #[test]
    fn primary_scan_emits_meta_ids() {
        let ctx = ExecContext::new(seeded());
        let keys = collect_keys(&ctx, |tx| {
            run_primary("#primary", &keyspace_ref(), None, &ctx, tx)
        });
        assert_eq!(keys, vec!["k1", "k2", "k3"]);
    }

    #[test]
    fn index_scan_applies_offset_and_limit() {
        let ctx = ExecContext::new(seeded());
        let spans = vec![Span2 {
            range: SpanRange::default(),
            exact: true,
        }];
        let keys = collect_keys(&ctx, |tx| {
            run_index(
                "ix_n",
                &keyspace_ref(),
                &spans,
                &[],
                None,
                Some(&Expr::literal(1.0)),
                Some(&Expr::literal(1.0)),
                &ctx,
                tx,
            )
        });
        assert_eq!(keys, vec!["k2"]);
    }

    #[test]
    fn covering_scan_surfaces_index_keys() {
        let ctx = ExecContext::new(seeded());
        let spans = vec![Span2::point(Expr::literal(2.0))];
        let covers = vec![Expr::field(["o", "n"])];
        let projection = IndexProjection {
            entry_keys: vec![0],
            primary_key: true,
        };
        let (tx, rx) = item_channel(&ctx);
        run_index(
            "ix_n",
            &keyspace_ref(),
            &spans,
            &covers,
            Some(&projection),
            None,
            None,
            &ctx,
            tx,
        );
        let item = recv_item(&rx, &ctx).unwrap();
        assert_eq!(item.value().field("o").field("n"), Value::from(2.0));
        assert_eq!(item.meta_id(), Some("k2"));
        assert!(recv_item(&rx, &ctx).is_none());
    }
}

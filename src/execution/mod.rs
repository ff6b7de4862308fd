//! Operator execution: a tree of threads connected by bounded channels.
//!
//! Every operator runs on its own thread inside a `std::thread::scope`;
//! composite operators open nested scopes for their children, so a parent
//! cannot return before its children have, and dropping a channel endpoint
//! is the cancellation edge that unblocks the other side. Items flow
//! through bounded channels sized to the request's pipeline capacity, which
//! is what provides back-pressure.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::warn;

use crate::errors::{Error, Result};
use crate::plan::Operator;
use crate::value::Value;

mod base;
pub mod context;
mod fetch;
mod group;
mod items;
mod join;
mod mutate;
mod order;
mod scan;
mod scan_intersect;
mod scan_union;
mod setops;
mod stream;

pub use base::{Item, ItemReceiver, ItemSender};
pub use context::{ExecContext, Phase, PhaseSnapshot};

/// Drains the process-wide operator scratch pools. Called on engine
/// shutdown so retained maps never read as leaks.
pub fn drain_pools() {
    scan_intersect::drain_pools();
}

/// Everything a finished request hands back.
#[derive(Debug, Default)]
pub struct ExecutionResult {
    /// Result rows in delivery order.
    pub rows: Vec<Value>,
    /// Non-fatal diagnostics.
    pub warnings: Vec<crate::errors::Warning>,
    /// Documents mutated by DML operators.
    pub mutations: u64,
    /// Accumulated phase times.
    pub phases: PhaseSnapshot,
}

/// Runs a plan to completion or cancellation, collecting delivered rows.
pub fn run(op: &Operator, ctx: &ExecContext) -> Result<ExecutionResult> {
    std::thread::scope(|s| {
        let (tx, rx) = base::item_channel(ctx);
        s.spawn(|| run_operator(op, ctx, None, tx));
        // Anything that reaches the root without passing a Stream operator
        // (subquery bodies, bare scans) is still a result.
        while let Some(item) = base::recv_item(&rx, ctx) {
            ctx.emit_result(item.into_value());
        }
        base::drain(&rx);
    });
    if let Some(err) = ctx.error() {
        return Err(err);
    }
    Ok(ExecutionResult {
        rows: ctx.take_results(),
        warnings: ctx.take_warnings(),
        mutations: ctx.mutations(),
        phases: ctx.phase_snapshot(),
    })
}

/// Runs one operator on the current thread. Completion is signalled by
/// dropping `output`; fatal errors are recorded on the context.
pub(crate) fn run_operator(
    op: &Operator,
    ctx: &ExecContext,
    input: Option<ItemReceiver>,
    output: ItemSender,
) {
    let result = catch_unwind(AssertUnwindSafe(|| dispatch(op, ctx, input, output)));
    if let Err(panic) = result {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic in operator".to_owned());
        warn!(operator = op.name(), %reason, "operator panicked");
        ctx.fail(Error::internal(format!(
            "{} panicked: {}",
            op.name(),
            reason
        )));
    }
}

fn dispatch(op: &Operator, ctx: &ExecContext, input: Option<ItemReceiver>, output: ItemSender) {
    match op {
        Operator::DummyScan {} => scan::run_dummy(ctx, output),
        Operator::PrimaryScan {
            index,
            keyspace,
            limit,
            ..
        } => scan::run_primary(index, keyspace, limit.as_ref(), ctx, output),
        Operator::IndexScan3 {
            index,
            keyspace,
            spans,
            covers,
            index_projection,
            offset,
            limit,
            ..
        } => scan::run_index(
            index,
            keyspace,
            spans,
            covers,
            index_projection.as_ref(),
            offset.as_ref(),
            limit.as_ref(),
            ctx,
            output,
        ),
        Operator::IntersectScan { scans, limit, .. } => {
            scan_intersect::run(scans, limit.as_ref(), ctx, output)
        }
        Operator::UnionScan { scans, limit, .. } => {
            scan_union::run(scans, limit.as_ref(), ctx, output)
        }
        Operator::Fetch { keyspace, .. } => fetch::run(keyspace, ctx, input, output),
        Operator::Filter { condition, .. } => items::run_filter(condition, ctx, input, output),
        Operator::Project { terms, raw } => items::run_project(terms, *raw, ctx, input, output),
        Operator::Alias { as_alias } => items::run_alias(as_alias, ctx, input, output),
        Operator::Unnest { expr, alias, outer } => {
            items::run_unnest(expr, alias, *outer, ctx, input, output)
        }
        Operator::NLJoin {
            alias,
            on,
            outer,
            child,
        } => join::run_nl_join(alias, on, *outer, child, ctx, input, output),
        Operator::HashJoin {
            alias,
            probe,
            build,
            outer,
            child,
        } => join::run_hash_join(alias, probe, build, *outer, child, ctx, input, output),
        Operator::NLNest {
            alias,
            on,
            outer,
            child,
        } => join::run_nl_nest(alias, on, *outer, child, ctx, input, output),
        Operator::Order {
            terms,
            offset,
            limit,
            ..
        } => order::run_order(terms, offset.as_ref(), limit.as_ref(), ctx, input, output),
        Operator::Offset { expr } => order::run_offset(expr, ctx, input, output),
        Operator::Limit { expr } => order::run_limit(expr, ctx, input, output),
        Operator::Distinct {} => order::run_distinct(ctx, input, output),
        Operator::InitialGroup { keys, aggregates } => {
            group::run_initial(keys, aggregates, ctx, input, output)
        }
        Operator::IntermediateGroup { keys, aggregates } => {
            group::run_intermediate(keys, aggregates, ctx, input, output)
        }
        Operator::FinalGroup { keys, aggregates } => {
            group::run_final(keys, aggregates, ctx, input, output)
        }
        Operator::UnionAll { children } => setops::run_union_all(children, ctx, output),
        Operator::IntersectAll { first, second } => {
            setops::run_intersect_all(first, second, ctx, output)
        }
        Operator::ExceptAll { first, second } => {
            setops::run_except_all(first, second, ctx, output)
        }
        Operator::Stream {} => stream::run_stream(ctx, input),
        Operator::Collect {} => stream::run_collect(ctx, input, output),
        Operator::Sequence { children } => run_sequence(children, ctx, input, output),
        Operator::Parallel {
            child,
            max_parallelism: _,
        } => run_parallel(op.max_parallelism(), child, ctx, input, output),
        Operator::SendInsert { keyspace, pairs } => {
            mutate::run_insert(keyspace, pairs, false, ctx, output)
        }
        Operator::SendUpsert { keyspace, pairs } => {
            mutate::run_insert(keyspace, pairs, true, ctx, output)
        }
        Operator::SendDelete { keyspace, limit } => {
            mutate::run_delete(keyspace, limit.as_ref(), ctx, input, output)
        }
        Operator::SendUpdate {
            keyspace,
            set,
            unset,
            limit,
        } => mutate::run_update(keyspace, set, unset, limit.as_ref(), ctx, input, output),
        Operator::Merge {
            keyspace,
            key,
            update,
            delete,
            insert,
        } => mutate::run_merge(
            keyspace,
            key,
            update.as_deref(),
            *delete,
            insert.as_ref(),
            ctx,
            input,
            output,
        ),
    }
}

/// Wires children output-to-input and runs them concurrently; the stages of
/// a sequence form one pipeline, not a series of barriers.
fn run_sequence(
    children: &[Operator],
    ctx: &ExecContext,
    input: Option<ItemReceiver>,
    output: ItemSender,
) {
    match children {
        [] => {}
        [only] => run_operator(only, ctx, input, output),
        [first, rest @ ..] => {
            let (tx, rx) = base::item_channel(ctx);
            std::thread::scope(|s| {
                s.spawn(|| run_operator(first, ctx, input, tx));
                run_sequence(rest, ctx, Some(rx), output);
            });
        }
    }
}

/// Runs up to `copies` clones of the child over a shared input channel.
fn run_parallel(
    copies: usize,
    child: &Operator,
    ctx: &ExecContext,
    input: Option<ItemReceiver>,
    output: ItemSender,
) {
    let copies = copies.max(1);
    std::thread::scope(|s| {
        for _ in 0..copies {
            let input = input.clone();
            let output = output.clone();
            s.spawn(move || run_operator(child, ctx, input, output));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::Keyspace;
    use crate::datastore::memory::MemDatastore;
    use crate::expression::Expr;
    use crate::plan::{Cost, KeyspaceRef, ProjectTerm};
    use std::sync::Arc;

    fn seeded() -> Arc<MemDatastore> {
        let store = Arc::new(MemDatastore::new());
        let ks = store.keyspace_or_create("default", "orders");
        ks.upsert(&[
            (
                "k1".into(),
                Value::object([("n", Value::from(1.0)), ("tag", Value::from("a"))]),
            ),
            (
                "k2".into(),
                Value::object([("n", Value::from(2.0)), ("tag", Value::from("b"))]),
            ),
            (
                "k3".into(),
                Value::object([("n", Value::from(3.0)), ("tag", Value::from("a"))]),
            ),
        ])
        .unwrap();
        ks.create_primary_index("#primary");
        ks.create_index("ix_n", vec![Expr::field(["n"])]);
        store
    }

    #[test]
    fn dummy_scan_project_stream() {
        let ctx = ExecContext::new(seeded());
        let plan = Operator::Sequence {
            children: vec![
                Operator::DummyScan {},
                Operator::Project {
                    terms: vec![ProjectTerm {
                        expr: Some(Expr::literal(1.0)),
                        star: false,
                        as_alias: "$1".into(),
                    }],
                    raw: false,
                },
                Operator::Stream {},
            ],
        };
        let result = run(&plan, &ctx).unwrap();
        assert_eq!(result.rows, vec![Value::object([("$1", Value::from(1.0))])]);
    }

    #[test]
    fn primary_scan_fetch_stream_returns_documents() {
        let ctx = ExecContext::new(seeded());
        let plan = Operator::Sequence {
            children: vec![
                Operator::PrimaryScan {
                    index: "#primary".into(),
                    keyspace: KeyspaceRef::new("default", "orders", Some("o".into())),
                    limit: None,
                    cost: Cost::default(),
                },
                Operator::Fetch {
                    keyspace: KeyspaceRef::new("default", "orders", Some("o".into())),
                    cost: Cost::default(),
                },
                Operator::Stream {},
            ],
        };
        let result = run(&plan, &ctx).unwrap();
        assert_eq!(result.rows.len(), 3);
        assert_eq!(result.rows[0].field("o").field("n"), Value::from(1.0));
    }

    #[test]
    fn stop_before_run_yields_no_rows() {
        let ctx = ExecContext::new(seeded());
        ctx.send_stop();
        let plan = Operator::Sequence {
            children: vec![Operator::DummyScan {}, Operator::Stream {}],
        };
        let result = run(&plan, &ctx).unwrap();
        assert!(result.rows.is_empty());
    }
}

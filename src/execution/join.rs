//! Join operators: nested-loop join and nest, hash join.

use std::collections::HashMap;
use std::time::Instant;

use crate::expression::Expr;
use crate::plan::Operator;
use crate::value::Value;

use super::base::{item_channel, recv_item, send_item, Item, ItemReceiver, ItemSender};
use super::context::{ExecContext, Phase};
use super::run_operator;

/// Runs the right-side plan to completion, collecting its rows.
fn collect_right(child: &Operator, ctx: &ExecContext) -> Vec<Value> {
    let (tx, rx) = item_channel(ctx);
    let mut rows = Vec::new();
    std::thread::scope(|s| {
        s.spawn(|| run_operator(child, ctx, None, tx));
        while let Some(item) = recv_item(&rx, ctx) {
            rows.push(item.into_value());
        }
    });
    rows
}

fn merged(left: &Item, right: &Value) -> Item {
    let mut item = left.clone();
    let mut value = item.value().clone();
    if let (Value::Object(map), Value::Object(bindings)) = (&mut value, right) {
        for (k, v) in bindings {
            map.insert(k.clone(), v.clone());
        }
    }
    item.set_value(value);
    item
}

#[allow(clippy::too_many_arguments)]
pub(super) fn run_nl_join(
    alias: &str,
    on: &Expr,
    outer: bool,
    child: &Operator,
    ctx: &ExecContext,
    input: Option<ItemReceiver>,
    output: ItemSender,
) {
    let Some(input) = input else { return };
    let _ = alias;
    let started = Instant::now();
    // The right side is re-scanned once and reused across left rows; a
    // nested-loop over a live subtree per row would re-plan nothing anyway.
    let right_rows = collect_right(child, ctx);
    while let Some(left) = recv_item(&input, ctx) {
        let mut matched = false;
        for right in &right_rows {
            let candidate = merged(&left, right);
            match on.evaluate(candidate.value(), ctx) {
                Ok(v) if v.truth() => {
                    matched = true;
                    if !send_item(&output, candidate, ctx) {
                        return;
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    ctx.fail(err);
                    return;
                }
            }
        }
        if outer && !matched {
            if !send_item(&output, left, ctx) {
                return;
            }
        }
    }
    ctx.record_phase(Phase::Join, started);
}

#[allow(clippy::too_many_arguments)]
pub(super) fn run_hash_join(
    alias: &str,
    probe: &Expr,
    build: &Expr,
    outer: bool,
    child: &Operator,
    ctx: &ExecContext,
    input: Option<ItemReceiver>,
    output: ItemSender,
) {
    let Some(input) = input else { return };
    let _ = alias;
    let started = Instant::now();
    let mut table: HashMap<String, Vec<Value>> = HashMap::new();
    for right in collect_right(child, ctx) {
        match build.evaluate(&right, ctx) {
            Ok(key) if !matches!(key, Value::Missing | Value::Null) => {
                let bucket = serde_json::to_string(&key).unwrap_or_default();
                table.entry(bucket).or_default().push(right);
            }
            Ok(_) => {}
            Err(err) => {
                ctx.fail(err);
                return;
            }
        }
    }

    while let Some(left) = recv_item(&input, ctx) {
        let key = match probe.evaluate(left.value(), ctx) {
            Ok(key) => key,
            Err(err) => {
                ctx.fail(err);
                return;
            }
        };
        let bucket = serde_json::to_string(&key).unwrap_or_default();
        let matches = if matches!(key, Value::Missing | Value::Null) {
            None
        } else {
            table.get(&bucket)
        };
        match matches {
            Some(rows) => {
                for right in rows {
                    if !send_item(&output, merged(&left, right), ctx) {
                        return;
                    }
                }
            }
            None => {
                if outer {
                    if !send_item(&output, left, ctx) {
                        return;
                    }
                }
            }
        }
    }
    ctx.record_phase(Phase::Join, started);
}

#[allow(clippy::too_many_arguments)]
pub(super) fn run_nl_nest(
    alias: &str,
    on: &Expr,
    outer: bool,
    child: &Operator,
    ctx: &ExecContext,
    input: Option<ItemReceiver>,
    output: ItemSender,
) {
    let Some(input) = input else { return };
    let started = Instant::now();
    let right_rows = collect_right(child, ctx);
    while let Some(left) = recv_item(&input, ctx) {
        let mut nested = Vec::new();
        for right in &right_rows {
            let candidate = merged(&left, right);
            match on.evaluate(candidate.value(), ctx) {
                Ok(v) if v.truth() => {
                    // Nest collects the right-hand document itself.
                    if let Value::Object(bindings) = right {
                        if let Some(doc) = bindings.values().next() {
                            nested.push(doc.clone());
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    ctx.fail(err);
                    return;
                }
            }
        }
        if nested.is_empty() && !outer {
            continue;
        }
        let mut item = left.clone();
        let mut value = item.value().clone();
        if let Value::Object(map) = &mut value {
            map.insert(alias.to_owned(), Value::Array(nested));
        }
        item.set_value(value);
        if !send_item(&output, item, ctx) {
            return;
        }
    }
    ctx.record_phase(Phase::Join, started);
}

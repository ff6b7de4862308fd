//! Set operations over result rows: UNION ALL, INTERSECT ALL, EXCEPT ALL.

use std::collections::HashMap;

use crate::plan::Operator;
use crate::value::Value;

use super::base::{item_channel, recv_item, send_item, ItemSender};
use super::context::ExecContext;
use super::run_operator;

fn fingerprint(v: &Value) -> String {
    serde_json::to_string(v).unwrap_or_default()
}

/// Runs children one after another, concatenating their outputs.
pub(super) fn run_union_all(children: &[Operator], ctx: &ExecContext, output: ItemSender) {
    for child in children {
        if ctx.stopped() {
            return;
        }
        let (tx, rx) = item_channel(ctx);
        std::thread::scope(|s| {
            s.spawn(|| run_operator(child, ctx, None, tx));
            while let Some(item) = recv_item(&rx, ctx) {
                if !send_item(&output, item, ctx) {
                    break;
                }
            }
        });
    }
}

/// Collects the second child into a multiset of row fingerprints.
fn collect_multiset(child: &Operator, ctx: &ExecContext) -> HashMap<String, u64> {
    let (tx, rx) = item_channel(ctx);
    let mut counts: HashMap<String, u64> = HashMap::new();
    std::thread::scope(|s| {
        s.spawn(|| run_operator(child, ctx, None, tx));
        while let Some(item) = recv_item(&rx, ctx) {
            *counts.entry(fingerprint(item.value())).or_insert(0) += 1;
        }
    });
    counts
}

/// INTERSECT ALL: emits each first-child row as many times as it appears in
/// both children.
pub(super) fn run_intersect_all(
    first: &Operator,
    second: &Operator,
    ctx: &ExecContext,
    output: ItemSender,
) {
    let mut counts = collect_multiset(second, ctx);
    if ctx.stopped() {
        return;
    }
    let (tx, rx) = item_channel(ctx);
    std::thread::scope(|s| {
        s.spawn(|| run_operator(first, ctx, None, tx));
        while let Some(item) = recv_item(&rx, ctx) {
            let fp = fingerprint(item.value());
            match counts.get_mut(&fp) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    if !send_item(&output, item, ctx) {
                        break;
                    }
                }
                _ => {}
            }
        }
    });
}

/// EXCEPT ALL: emits first-child rows, each cancelled by one matching
/// second-child row.
pub(super) fn run_except_all(
    first: &Operator,
    second: &Operator,
    ctx: &ExecContext,
    output: ItemSender,
) {
    let mut counts = collect_multiset(second, ctx);
    if ctx.stopped() {
        return;
    }
    let (tx, rx) = item_channel(ctx);
    std::thread::scope(|s| {
        s.spawn(|| run_operator(first, ctx, None, tx));
        while let Some(item) = recv_item(&rx, ctx) {
            let fp = fingerprint(item.value());
            match counts.get_mut(&fp) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                }
                _ => {
                    if !send_item(&output, item, ctx) {
                        break;
                    }
                }
            }
        }
    });
}

//! Blocking and row-accounting operators: order, offset, limit, distinct.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::time::Instant;

use crate::expression::Expr;
use crate::plan::SortTerm;
use crate::value::Value;

use super::base::{eval_count, recv_item, send_item, Item, ItemReceiver, ItemSender};
use super::context::{ExecContext, Phase};

pub(super) fn run_order(
    terms: &[SortTerm],
    offset: Option<&Expr>,
    limit: Option<&Expr>,
    ctx: &ExecContext,
    input: Option<ItemReceiver>,
    output: ItemSender,
) {
    let Some(input) = input else { return };
    let mut buffered: Vec<(Vec<Value>, Item)> = Vec::new();
    while let Some(item) = recv_item(&input, ctx) {
        let mut keys = Vec::with_capacity(terms.len());
        for term in terms {
            match term.expr.evaluate(item.value(), ctx) {
                Ok(v) => keys.push(v),
                Err(err) => {
                    ctx.fail(err);
                    return;
                }
            }
        }
        buffered.push((keys, item));
    }
    if ctx.stopped() {
        return;
    }

    let started = Instant::now();
    buffered.sort_by(|(a, _), (b, _)| {
        for (i, term) in terms.iter().enumerate() {
            let ord = a[i].collate(&b[i]);
            let ord = if term.desc { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    ctx.record_phase(Phase::Sort, started);

    // Offset/limit folded into the sort when the planner pushed them here.
    let skip = match offset.map(|o| eval_count(o, ctx)) {
        Some(None) => return,
        Some(Some(n)) => n as usize,
        None => 0,
    };
    let cap = match limit.map(|l| eval_count(l, ctx)) {
        Some(None) => return,
        Some(Some(n)) => Some(n as usize),
        None => None,
    };
    let iter = buffered.into_iter().skip(skip);
    let iter: Box<dyn Iterator<Item = (Vec<Value>, Item)>> = match cap {
        Some(cap) => Box::new(iter.take(cap)),
        None => Box::new(iter),
    };
    for (_, item) in iter {
        if !send_item(&output, item, ctx) {
            return;
        }
    }
}

pub(super) fn run_offset(
    expr: &Expr,
    ctx: &ExecContext,
    input: Option<ItemReceiver>,
    output: ItemSender,
) {
    let Some(input) = input else { return };
    let Some(skip) = eval_count(expr, ctx) else { return };
    let mut seen = 0i64;
    while let Some(item) = recv_item(&input, ctx) {
        seen += 1;
        if seen <= skip {
            continue;
        }
        if !send_item(&output, item, ctx) {
            return;
        }
    }
}

pub(super) fn run_limit(
    expr: &Expr,
    ctx: &ExecContext,
    input: Option<ItemReceiver>,
    output: ItemSender,
) {
    let Some(input) = input else { return };
    let Some(cap) = eval_count(expr, ctx) else { return };
    let mut sent = 0i64;
    while sent < cap {
        let Some(item) = recv_item(&input, ctx) else { return };
        if !send_item(&output, item, ctx) {
            return;
        }
        sent += 1;
    }
    // Cap reached: stop consuming so upstream sees the disconnect.
}

pub(super) fn run_distinct(
    ctx: &ExecContext,
    input: Option<ItemReceiver>,
    output: ItemSender,
) {
    let Some(input) = input else { return };
    let mut seen: HashSet<String> = HashSet::new();
    while let Some(item) = recv_item(&input, ctx) {
        let fingerprint = serde_json::to_string(item.value()).unwrap_or_default();
        if !seen.insert(fingerprint) {
            continue;
        }
        if !send_item(&output, item, ctx) {
            return;
        }
    }
}

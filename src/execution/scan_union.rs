//! Union scan: OR-combination of child scans, deduplicated by primary key.

use std::collections::HashSet;
use std::sync::mpsc::{sync_channel, SyncSender};

use crate::errors::Error;
use crate::expression::Expr;
use crate::plan::Operator;

use super::base::{eval_count, item_channel, recv_item, send_item, Item, ItemSender};
use super::context::ExecContext;
use super::run_operator;

enum ScanMsg {
    Item(Item),
    Done,
}

pub(super) fn run(
    scans: &[Operator],
    limit: Option<&Expr>,
    ctx: &ExecContext,
    output: ItemSender,
) {
    if scans.is_empty() {
        ctx.fail(Error::internal("union scan has no scans"));
        return;
    }
    let limit = match limit.map(|l| eval_count(l, ctx)) {
        Some(None) => return,
        Some(Some(n)) => n,
        None => 0,
    };

    let (merge_tx, merge_rx) = sync_channel::<ScanMsg>(ctx.pipeline_cap());
    std::thread::scope(|s| {
        for (i, scan) in scans.iter().enumerate() {
            let merge_tx = merge_tx.clone();
            s.spawn(move || run_child(scan, i as u8, ctx, merge_tx));
        }
        drop(merge_tx);

        let mut seen: HashSet<String> = HashSet::new();
        let mut sent = 0i64;
        let mut remaining = scans.len();
        let mut merge_rx = Some(merge_rx);
        while let Some(rx) = merge_rx.as_ref() {
            let Ok(msg) = rx.recv() else { break };
            if ctx.stopped() {
                break;
            }
            match msg {
                ScanMsg::Done => {
                    remaining -= 1;
                    if remaining == 0 {
                        break;
                    }
                }
                ScanMsg::Item(mut item) => {
                    let Some(key) = item.meta_id().map(str::to_owned) else {
                        ctx.fail(Error::InvalidValue {
                            reason: "union scan item is missing its primary key".into(),
                        });
                        break;
                    };
                    if !seen.insert(key) {
                        continue;
                    }
                    item.set_bit(0);
                    if !send_item(&output, item, ctx) {
                        merge_rx = None;
                        continue;
                    }
                    sent += 1;
                    if limit > 0 && sent >= limit {
                        // Cancel children by dropping the merge channel.
                        merge_rx = None;
                    }
                }
            }
        }
        drop(merge_rx);
    });
}

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
    let _ = merge_tx.send(ScanMsg::Done);
}

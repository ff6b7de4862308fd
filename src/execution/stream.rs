//! Result delivery operators.

use super::base::{recv_item, send_item, ItemReceiver, ItemSender};
use super::context::ExecContext;

/// Delivers items to the request's result sink; the end of every
/// top-level pipeline.
pub(super) fn run_stream(ctx: &ExecContext, input: Option<ItemReceiver>) {
    let Some(input) = input else { return };
    while let Some(item) = recv_item(&input, ctx) {
        ctx.emit_result(item.into_value());
    }
}

/// Buffers the entire input before forwarding; used where a consumer needs
/// the complete result set at once (subqueries, EXECUTE over a collected
/// plan).
pub(super) fn run_collect(ctx: &ExecContext, input: Option<ItemReceiver>, output: ItemSender) {
    let Some(input) = input else { return };
    let mut buffered = Vec::new();
    while let Some(item) = recv_item(&input, ctx) {
        buffered.push(item);
    }
    if ctx.stopped() {
        return;
    }
    for item in buffered {
        if !send_item(&output, item, ctx) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::memory::MemDatastore;
    use crate::execution::base::item_channel;
    use crate::value::{AnnotatedValue, Value};
    use std::sync::Arc;

    #[test]
    fn collect_buffers_then_forwards_in_order() {
        let ctx = ExecContext::new(Arc::new(MemDatastore::new()));
        let (in_tx, in_rx) = item_channel(&ctx);
        for n in [1.0, 2.0, 3.0] {
            in_tx.send(AnnotatedValue::new(Value::from(n))).unwrap();
        }
        drop(in_tx);
        let (out_tx, out_rx) = item_channel(&ctx);
        run_collect(&ctx, Some(in_rx), out_tx);
        let out: Vec<Value> = std::iter::from_fn(|| recv_item(&out_rx, &ctx))
            .map(|i| i.into_value())
            .collect();
        assert_eq!(out, vec![Value::from(1.0), Value::from(2.0), Value::from(3.0)]);
    }
}

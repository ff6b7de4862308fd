//! Shared plumbing for execution operators: bounded item channels, shared
//! receivers, and expression helpers.

use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::errors::Error;
use crate::expression::Expr;
use crate::value::{AnnotatedValue, Value};

use super::context::ExecContext;

/// Item flowing between operators.
pub type Item = AnnotatedValue;

/// Sending half of an inter-operator channel.
pub type ItemSender = SyncSender<Item>;

/// Receiving half, shareable across parallel operator copies.
pub type ItemReceiver = Arc<Mutex<Receiver<Item>>>;

/// How long a blocked receive waits before re-checking the stop flag.
const RECV_TICK: Duration = Duration::from_millis(20);

/// Creates a bounded item channel at the request's pipeline capacity.
pub fn item_channel(ctx: &ExecContext) -> (ItemSender, ItemReceiver) {
    let (tx, rx) = sync_channel(ctx.pipeline_cap());
    (tx, Arc::new(Mutex::new(rx)))
}

/// Receives the next item, honouring stop and timeout at every tick.
/// Returns `None` on disconnect or cancellation.
pub fn recv_item(rx: &ItemReceiver, ctx: &ExecContext) -> Option<Item> {
    loop {
        if ctx.stopped() {
            return None;
        }
        let guard = rx.lock();
        match guard.recv_timeout(RECV_TICK) {
            Ok(item) => return Some(item),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
}

/// Forwards an item downstream. Returns false when the request stopped or
/// the consumer hung up.
pub fn send_item(tx: &ItemSender, item: Item, ctx: &ExecContext) -> bool {
    if ctx.stopped() {
        return false;
    }
    tx.send(item).is_ok()
}

/// Drains a receiver so blocked producers can observe the disconnect.
pub fn drain(rx: &ItemReceiver) {
    let guard = rx.lock();
    while guard.try_recv().is_ok() {}
}

/// Evaluates an expression to a non-negative integer, as used by OFFSET and
/// LIMIT. Parameters are resolved through the context.
pub fn eval_count(expr: &Expr, ctx: &ExecContext) -> Option<i64> {
    match expr.evaluate(&Value::Missing, ctx) {
        Ok(Value::Number(n)) if n >= 0.0 => Some(n as i64),
        Ok(other) => {
            ctx.fail(Error::InvalidValue {
                reason: format!("expected a non-negative number, got {}", other.type_of()),
            });
            None
        }
        Err(err) => {
            ctx.fail(err);
            None
        }
    }
}

/// Sets a nested field on an object value, creating intermediate objects.
pub fn set_path(target: &mut Value, path: &[String], new_value: Value) {
    if path.is_empty() {
        *target = new_value;
        return;
    }
    if !matches!(target, Value::Object(_)) {
        *target = Value::Object(Default::default());
    }
    let Value::Object(map) = target else { unreachable!() };
    let slot = map
        .entry(path[0].clone())
        .or_insert(Value::Object(Default::default()));
    set_path(slot, &path[1..], new_value);
}

/// Removes a nested field from an object value.
pub fn unset_path(target: &mut Value, path: &[String]) {
    let Value::Object(map) = target else { return };
    match path {
        [] => {}
        [last] => {
            map.remove(last);
        }
        [head, rest @ ..] => {
            if let Some(child) = map.get_mut(head) {
                unset_path(child, rest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::memory::MemDatastore;

    fn ctx() -> ExecContext {
        ExecContext::new(Arc::new(MemDatastore::new()))
    }

    #[test]
    fn recv_returns_none_after_disconnect() {
        let c = ctx();
        let (tx, rx) = item_channel(&c);
        drop(tx);
        assert!(recv_item(&rx, &c).is_none());
    }

    #[test]
    fn recv_observes_stop() {
        let c = ctx();
        let (_tx, rx) = item_channel(&c);
        c.send_stop();
        assert!(recv_item(&rx, &c).is_none());
    }

    #[test]
    fn eval_count_rejects_non_numbers() {
        let c = ctx();
        assert_eq!(eval_count(&Expr::literal(3.0), &c), Some(3));
        assert_eq!(eval_count(&Expr::literal("x"), &c), None);
        assert_eq!(c.error().map(|e| e.code()), Some(5010));
    }

    #[test]
    fn set_and_unset_paths() {
        let mut doc = Value::object([("a", Value::from(1.0))]);
        set_path(
            &mut doc,
            &["b".to_owned(), "c".to_owned()],
            Value::from(2.0),
        );
        assert_eq!(doc.field("b").field("c"), Value::from(2.0));
        unset_path(&mut doc, &["b".to_owned(), "c".to_owned()]);
        assert_eq!(doc.field("b").field("c"), Value::Missing);
    }
}

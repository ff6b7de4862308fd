//! Document fetch by primary key.

use std::collections::HashMap;
use std::time::Instant;

use crate::plan::KeyspaceRef;
use crate::value::Value;

use super::base::{recv_item, send_item, Item, ItemReceiver, ItemSender};
use super::context::{ExecContext, Phase};

/// Keys are fetched in batches to amortise datastore round trips.
const FETCH_BATCH: usize = 64;

pub(super) fn run(
    keyspace: &KeyspaceRef,
    ctx: &ExecContext,
    input: Option<ItemReceiver>,
    output: ItemSender,
) {
    let Some(input) = input else { return };
    let handle = match ctx.datastore().keyspace(&keyspace.namespace, &keyspace.keyspace) {
        Ok(ks) => ks,
        Err(err) => {
            ctx.fail(err);
            return;
        }
    };
    let alias = keyspace.alias();

    let mut batch: Vec<Item> = Vec::with_capacity(FETCH_BATCH);
    loop {
        let next = recv_item(&input, ctx);
        let input_done = next.is_none();
        if let Some(item) = next {
            batch.push(item);
        }
        if !input_done && batch.len() < FETCH_BATCH {
            continue;
        }
        if !batch.is_empty() {
            let started = Instant::now();
            let keys: Vec<String> = batch
                .iter()
                .filter_map(|i| i.meta_id().map(str::to_owned))
                .collect();
            let fetched = match handle.fetch(&keys) {
                Ok(docs) => docs,
                Err(err) => {
                    ctx.fail(err);
                    return;
                }
            };
            ctx.record_phase(Phase::Fetch, started);
            let docs: HashMap<String, Value> = fetched.into_iter().collect();
            for mut item in batch.drain(..) {
                let Some(doc) = item.meta_id().and_then(|k| docs.get(k)).cloned() else {
                    // Deleted between scan and fetch; skip silently.
                    continue;
                };
                let mut value = item.value().clone();
                match &mut value {
                    Value::Object(map) => {
                        map.insert(alias.to_owned(), doc);
                    }
                    _ => value = Value::object([(alias, doc)]),
                }
                item.set_value(value);
                if !send_item(&output, item, ctx) {
                    return;
                }
            }
        }
        if input_done {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::Keyspace;
    use crate::datastore::memory::MemDatastore;
    use crate::execution::base::item_channel;
    use crate::value::AnnotatedValue;
    use std::sync::Arc;

    #[test]
    fn fetch_binds_documents_under_the_alias() {
        let store = Arc::new(MemDatastore::new());
        let ks = store.keyspace_or_create("default", "orders");
        ks.upsert(&[("k1".into(), Value::object([("n", Value::from(7.0))]))])
            .unwrap();
        let ctx = ExecContext::new(store);

        let (in_tx, in_rx) = item_channel(&ctx);
        let (out_tx, out_rx) = item_channel(&ctx);
        in_tx
            .send(AnnotatedValue::with_meta_id(Value::object(Vec::<(String, crate::value::Value)>::new()), "k1"))
            .unwrap();
        in_tx
            .send(AnnotatedValue::with_meta_id(Value::object(Vec::<(String, crate::value::Value)>::new()), "gone"))
            .unwrap();
        drop(in_tx);

        run(
            &KeyspaceRef::new("default", "orders", Some("o".into())),
            &ctx,
            Some(in_rx),
            out_tx,
        );
        let item = recv_item(&out_rx, &ctx).unwrap();
        assert_eq!(item.value().field("o").field("n"), Value::from(7.0));
        assert_eq!(item.meta_id(), Some("k1"));
        // The missing key is skipped, not errored.
        assert!(recv_item(&out_rx, &ctx).is_none());
        assert!(ctx.error().is_none());
    }
}

//! Mutation operators: insert, upsert, delete, update, merge.

use crate::errors::Error;
use crate::expression::Expr;
use crate::plan::{InsertPair, KeyspaceRef, UpdateSet};
use crate::value::{AnnotatedValue, Value};

use super::base::{eval_count, recv_item, send_item, set_path, unset_path, ItemReceiver, ItemSender};
use super::context::ExecContext;

fn resolve_keyspace(
    keyspace: &KeyspaceRef,
    ctx: &ExecContext,
) -> Option<std::sync::Arc<dyn crate::datastore::Keyspace>> {
    match ctx.datastore().keyspace(&keyspace.namespace, &keyspace.keyspace) {
        Ok(ks) => Some(ks),
        Err(err) => {
            ctx.fail(err);
            None
        }
    }
}

/// Evaluates the key/value pairs and writes them. Emits one item per
/// mutation carrying the new document under the keyspace alias.
pub(super) fn run_insert(
    keyspace: &KeyspaceRef,
    pairs: &[InsertPair],
    upsert: bool,
    ctx: &ExecContext,
    output: ItemSender,
) {
    let Some(handle) = resolve_keyspace(keyspace, ctx) else { return };
    let mut resolved = Vec::with_capacity(pairs.len());
    for pair in pairs {
        let key = match pair.key.evaluate(&Value::Missing, ctx) {
            Ok(Value::String(k)) => k,
            Ok(other) => {
                ctx.fail(Error::InvalidValue {
                    reason: format!("document key must be a string, got {}", other.type_of()),
                });
                return;
            }
            Err(err) => {
                ctx.fail(err);
                return;
            }
        };
        let value = match pair.value.evaluate(&Value::Missing, ctx) {
            Ok(v) => v,
            Err(err) => {
                ctx.fail(err);
                return;
            }
        };
        resolved.push((key, value));
    }
    let written = if upsert {
        handle.upsert(&resolved)
    } else {
        handle.insert(&resolved)
    };
    match written {
        Ok(n) => ctx.add_mutations(n),
        Err(err) => {
            ctx.fail(err);
            return;
        }
    }
    for (key, value) in resolved {
        let item = AnnotatedValue::with_meta_id(
            Value::object([(keyspace.alias(), value)]),
            key,
        );
        if !send_item(&output, item, ctx) {
            return;
        }
    }
}

/// Deletes incoming items by their `meta.id`, forwarding the deleted rows.
pub(super) fn run_delete(
    keyspace: &KeyspaceRef,
    limit: Option<&Expr>,
    ctx: &ExecContext,
    input: Option<ItemReceiver>,
    output: ItemSender,
) {
    let Some(input) = input else { return };
    let Some(handle) = resolve_keyspace(keyspace, ctx) else { return };
    let limit = match limit.map(|l| eval_count(l, ctx)) {
        Some(None) => return,
        Some(Some(n)) => Some(n as u64),
        None => None,
    };
    let mut done = 0u64;
    while let Some(item) = recv_item(&input, ctx) {
        if let Some(cap) = limit {
            if done >= cap {
                return;
            }
        }
        let Some(key) = item.meta_id().map(str::to_owned) else {
            ctx.fail(Error::InvalidValue {
                reason: "delete item is missing its primary key".into(),
            });
            return;
        };
        match handle.delete(std::slice::from_ref(&key)) {
            Ok(n) => {
                ctx.add_mutations(n);
                done += n;
            }
            Err(err) => {
                ctx.fail(err);
                return;
            }
        }
        if !send_item(&output, item, ctx) {
            return;
        }
    }
}

/// Applies SET/UNSET clauses to incoming items and writes them back.
#[allow(clippy::too_many_arguments)]
pub(super) fn run_update(
    keyspace: &KeyspaceRef,
    set: &[UpdateSet],
    unset: &[Vec<String>],
    limit: Option<&Expr>,
    ctx: &ExecContext,
    input: Option<ItemReceiver>,
    output: ItemSender,
) {
    let Some(input) = input else { return };
    let Some(handle) = resolve_keyspace(keyspace, ctx) else { return };
    let alias = keyspace.alias();
    let limit = match limit.map(|l| eval_count(l, ctx)) {
        Some(None) => return,
        Some(Some(n)) => Some(n as u64),
        None => None,
    };
    let mut done = 0u64;
    while let Some(mut item) = recv_item(&input, ctx) {
        if let Some(cap) = limit {
            if done >= cap {
                return;
            }
        }
        let Some(key) = item.meta_id().map(str::to_owned) else {
            ctx.fail(Error::InvalidValue {
                reason: "update item is missing its primary key".into(),
            });
            return;
        };
        let mut doc = item.value().field(alias);
        for clause in set {
            // SET values see the pre-update item scope.
            match clause.value.evaluate(item.value(), ctx) {
                Ok(v) => set_path(&mut doc, &clause.path, v),
                Err(err) => {
                    ctx.fail(err);
                    return;
                }
            }
        }
        for path in unset {
            unset_path(&mut doc, path);
        }
        match handle.update(&[(key, doc.clone())]) {
            Ok(n) => {
                ctx.add_mutations(n);
                done += n;
            }
            Err(err) => {
                ctx.fail(err);
                return;
            }
        }
        let mut value = item.value().clone();
        if let Value::Object(map) = &mut value {
            map.insert(alias.to_owned(), doc);
        }
        item.set_value(value);
        if !send_item(&output, item, ctx) {
            return;
        }
    }
}

/// Routes each source row to the matched or unmatched action against the
/// target keyspace.
#[allow(clippy::too_many_arguments)]
pub(super) fn run_merge(
    keyspace: &KeyspaceRef,
    key: &Expr,
    update: Option<&[UpdateSet]>,
    delete: bool,
    insert: Option<&Expr>,
    ctx: &ExecContext,
    input: Option<ItemReceiver>,
    output: ItemSender,
) {
    let Some(input) = input else { return };
    let Some(handle) = resolve_keyspace(keyspace, ctx) else { return };
    while let Some(item) = recv_item(&input, ctx) {
        let target_key = match key.evaluate(item.value(), ctx) {
            Ok(Value::String(k)) => k,
            Ok(Value::Missing) | Ok(Value::Null) => continue,
            Ok(other) => {
                ctx.fail(Error::InvalidValue {
                    reason: format!("merge key must be a string, got {}", other.type_of()),
                });
                return;
            }
            Err(err) => {
                ctx.fail(err);
                return;
            }
        };
        let existing = match handle.fetch(std::slice::from_ref(&target_key)) {
            Ok(docs) => docs.into_iter().next().map(|(_, doc)| doc),
            Err(err) => {
                ctx.fail(err);
                return;
            }
        };
        match existing {
            Some(mut doc) => {
                if delete {
                    match handle.delete(std::slice::from_ref(&target_key)) {
                        Ok(n) => ctx.add_mutations(n),
                        Err(err) => {
                            ctx.fail(err);
                            return;
                        }
                    }
                } else if let Some(set) = update {
                    for clause in set {
                        match clause.value.evaluate(item.value(), ctx) {
                            Ok(v) => set_path(&mut doc, &clause.path, v),
                            Err(err) => {
                                ctx.fail(err);
                                return;
                            }
                        }
                    }
                    match handle.update(&[(target_key.clone(), doc)]) {
                        Ok(n) => ctx.add_mutations(n),
                        Err(err) => {
                            ctx.fail(err);
                            return;
                        }
                    }
                }
            }
            None => {
                if let Some(insert_expr) = insert {
                    let doc = match insert_expr.evaluate(item.value(), ctx) {
                        Ok(v) => v,
                        Err(err) => {
                            ctx.fail(err);
                            return;
                        }
                    };
                    match handle.insert(&[(target_key.clone(), doc)]) {
                        Ok(n) => ctx.add_mutations(n),
                        Err(err) => {
                            ctx.fail(err);
                            return;
                        }
                    }
                }
            }
        }
        if !send_item(&output, item, ctx) {
            return;
        }
    }
}

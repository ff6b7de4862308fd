//! Per-item operators: filter, projection, aliasing, unnest.

use crate::errors::Error;
use crate::expression::Expr;
use crate::plan::ProjectTerm;
use crate::value::Value;

use super::base::{recv_item, send_item, ItemReceiver, ItemSender};
use super::context::ExecContext;

pub(super) fn run_filter(
    condition: &Expr,
    ctx: &ExecContext,
    input: Option<ItemReceiver>,
    output: ItemSender,
) {
    let Some(input) = input else { return };
    while let Some(item) = recv_item(&input, ctx) {
        match condition.evaluate(item.value(), ctx) {
            Ok(v) if v.truth() => {
                if !send_item(&output, item, ctx) {
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
}

pub(super) fn run_project(
    terms: &[ProjectTerm],
    raw: bool,
    ctx: &ExecContext,
    input: Option<ItemReceiver>,
    output: ItemSender,
) {
    let Some(input) = input else { return };
    while let Some(mut item) = recv_item(&input, ctx) {
        let row = match project_row(terms, raw, item.value(), ctx) {
            Ok(row) => row,
            Err(err) => {
                ctx.fail(err);
                return;
            }
        };
        item.set_value(row);
        if !send_item(&output, item, ctx) {
            return;
        }
    }
}

fn project_row(
    terms: &[ProjectTerm],
    raw: bool,
    item: &Value,
    ctx: &ExecContext,
) -> crate::errors::Result<Value> {
    if raw {
        let expr = terms
            .first()
            .and_then(|t| t.expr.as_ref())
            .ok_or_else(|| Error::internal("raw projection without an expression"))?;
        return expr.evaluate(item, ctx);
    }
    let mut row: std::collections::BTreeMap<String, Value> = Default::default();
    for term in terms {
        if term.star {
            match &term.expr {
                // `alias.*` expands the referenced document's fields.
                Some(e) => {
                    if let Value::Object(fields) = e.evaluate(item, ctx)? {
                        for (k, v) in fields {
                            row.insert(k, v);
                        }
                    }
                }
                // Bare `*` expands every binding's document side by side.
                None => {
                    if let Value::Object(bindings) = item {
                        for doc in bindings.values() {
                            if let Value::Object(fields) = doc {
                                for (k, v) in fields {
                                    row.insert(k.clone(), v.clone());
                                }
                            }
                        }
                    }
                }
            }
            continue;
        }
        let Some(expr) = &term.expr else { continue };
        let v = expr.evaluate(item, ctx)?;
        if v != Value::Missing {
            row.insert(term.as_alias.clone(), v);
        }
    }
    Ok(Value::Object(row))
}

pub(super) fn run_alias(
    alias: &str,
    ctx: &ExecContext,
    input: Option<ItemReceiver>,
    output: ItemSender,
) {
    let Some(input) = input else { return };
    while let Some(mut item) = recv_item(&input, ctx) {
        let rebound = Value::object([(alias, item.value().clone())]);
        item.set_value(rebound);
        if !send_item(&output, item, ctx) {
            return;
        }
    }
}

pub(super) fn run_unnest(
    expr: &Expr,
    alias: &str,
    outer: bool,
    ctx: &ExecContext,
    input: Option<ItemReceiver>,
    output: ItemSender,
) {
    let Some(input) = input else { return };
    while let Some(item) = recv_item(&input, ctx) {
        let source = match expr.evaluate(item.value(), ctx) {
            Ok(v) => v,
            Err(err) => {
                ctx.fail(err);
                return;
            }
        };
        let elems = match source {
            Value::Array(elems) if !elems.is_empty() => elems,
            _ => {
                if outer {
                    // Unmatched rows survive with the alias missing.
                    if !send_item(&output, item, ctx) {
                        return;
                    }
                }
                continue;
            }
        };
        for elem in elems {
            let mut flattened = item.clone();
            let mut value = flattened.value().clone();
            if let Value::Object(map) = &mut value {
                map.insert(alias.to_owned(), elem);
            }
            flattened.set_value(value);
            if !send_item(&output, flattened, ctx) {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::memory::MemDatastore;
    use crate::execution::base::item_channel;
    use crate::expression::CmpOp;
    use crate::value::AnnotatedValue;
    use std::sync::Arc;

    fn ctx() -> ExecContext {
        ExecContext::new(Arc::new(MemDatastore::new()))
    }

    fn feed(ctx: &ExecContext, items: Vec<Value>) -> ItemReceiver {
        let (tx, rx) = item_channel(ctx);
        for v in items {
            tx.send(AnnotatedValue::new(v)).unwrap();
        }
        rx
    }

    #[test]
    fn filter_drops_non_true_rows() {
        let c = ctx();
        let input = feed(
            &c,
            vec![
                Value::object([("n", Value::from(1.0))]),
                Value::object([("n", Value::from(5.0))]),
                Value::object(Vec::<(String, crate::value::Value)>::new()),
            ],
        );
        let cond = Expr::Cmp(
            CmpOp::Gt,
            Box::new(Expr::field(["n"])),
            Box::new(Expr::literal(2.0)),
        );
        let (out_tx, out_rx) = item_channel(&c);
        run_filter(&cond, &c, Some(input), out_tx);
        let survivors: Vec<_> = std::iter::from_fn(|| recv_item(&out_rx, &c)).collect();
        // MISSING comparison is not TRUE, so the empty object is dropped.
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].value().field("n"), Value::from(5.0));
    }

    #[test]
    fn project_star_flattens_the_binding() {
        let c = ctx();
        let input = feed(
            &c,
            vec![Value::object([(
                "o",
                Value::object([("a", Value::from(1.0))]),
            )])],
        );
        let (out_tx, out_rx) = item_channel(&c);
        run_project(
            &[ProjectTerm {
                expr: None,
                star: true,
                as_alias: String::new(),
            }],
            false,
            &c,
            Some(input),
            out_tx,
        );
        let row = recv_item(&out_rx, &c).unwrap();
        assert_eq!(row.value().field("a"), Value::from(1.0));
    }

    #[test]
    fn raw_projection_emits_bare_values() {
        let c = ctx();
        let input = feed(&c, vec![Value::object([("n", Value::from(3.0))])]);
        let (out_tx, out_rx) = item_channel(&c);
        run_project(
            &[ProjectTerm {
                expr: Some(Expr::field(["n"])),
                star: false,
                as_alias: "$1".into(),
            }],
            true,
            &c,
            Some(input),
            out_tx,
        );
        assert_eq!(recv_item(&out_rx, &c).unwrap().value(), &Value::from(3.0));
    }

    #[test]
    fn unnest_flattens_arrays() {
        let c = ctx();
        let input = feed(
            &c,
            vec![Value::object([
                ("id", Value::from(1.0)),
                (
                    "tags",
                    Value::Array(vec![Value::from("x"), Value::from("y")]),
                ),
            ])],
        );
        let (out_tx, out_rx) = item_channel(&c);
        run_unnest(&Expr::field(["tags"]), "t", false, &c, Some(input), out_tx);
        let rows: Vec<_> = std::iter::from_fn(|| recv_item(&out_rx, &c)).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].value().field("t"), Value::from("x"));
        assert_eq!(rows[1].value().field("t"), Value::from("y"));
    }
}

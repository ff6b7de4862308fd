//! Scalar function dispatch.

use crate::errors::{Error, Result};
use crate::value::Value;

use super::{EvalContext, Expr};

pub(super) fn evaluate(
    name: &str,
    args: &[Expr],
    item: &Value,
    ctx: &dyn EvalContext,
) -> Result<Value> {
    let mut vals = Vec::with_capacity(args.len());
    for a in args {
        vals.push(a.evaluate(item, ctx)?);
    }
    match name {
        "lower" => unary_string(&vals, |s| Value::String(s.to_lowercase())),
        "upper" => unary_string(&vals, |s| Value::String(s.to_uppercase())),
        "length" => unary_string(&vals, |s| Value::Number(s.chars().count() as f64)),
        "abs" => unary_number(&vals, |n| Value::Number(n.abs())),
        "floor" => unary_number(&vals, |n| Value::Number(n.floor())),
        "ceil" => unary_number(&vals, |n| Value::Number(n.ceil())),
        "type" => Ok(Value::String(
            vals.first()
                .map(|v| v.type_of().as_str())
                .unwrap_or("missing")
                .to_owned(),
        )),
        "meta_id" => {
            // Surfaced by scan operators as a plain field on the item.
            Ok(item.field("meta").field("id"))
        }
        "now_millis" => {
            let since = ctx
                .now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default();
            Ok(Value::Number(since.as_millis() as f64))
        }
        other => Err(Error::Semantics {
            reason: format!("unknown function: {other}"),
        }),
    }
}

fn unary_string(vals: &[Value], f: impl FnOnce(&str) -> Value) -> Result<Value> {
    match vals.first() {
        Some(Value::Missing) | None => Ok(Value::Missing),
        Some(Value::String(s)) => Ok(f(s)),
        Some(_) => Ok(Value::Null),
    }
}

fn unary_number(vals: &[Value], f: impl FnOnce(f64) -> Value) -> Result<Value> {
    match vals.first() {
        Some(Value::Missing) | None => Ok(Value::Missing),
        Some(Value::Number(n)) => Ok(f(*n)),
        Some(_) => Ok(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::SimpleContext;

    #[test]
    fn string_functions_propagate_missing_and_null() {
        let ctx = SimpleContext::default();
        let call = |arg: Value| {
            evaluate("lower", &[Expr::Literal(arg)], &Value::Missing, &ctx).unwrap()
        };
        assert_eq!(call(Value::from("AbC")), Value::from("abc"));
        assert_eq!(call(Value::Missing), Value::Missing);
        assert_eq!(call(Value::from(1.0)), Value::Null);
    }

    #[test]
    fn unknown_function_is_a_semantic_error() {
        let ctx = SimpleContext::default();
        let err = evaluate("zap", &[], &Value::Missing, &ctx).unwrap_err();
        assert_eq!(err.code(), 3100);
    }
}

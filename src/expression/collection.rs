//! Collection predicates ANY and EVERY over array bindings.

use crate::errors::Result;
use crate::value::Value;

use super::{Binding, EvalContext, Expr};

fn child_scope(item: &Value, vars: &[(&str, &Value)]) -> Value {
    let mut map = match item {
        Value::Object(m) => m.clone(),
        _ => Default::default(),
    };
    for (name, v) in vars {
        map.insert((*name).to_owned(), (*v).clone());
    }
    Value::Object(map)
}

fn for_each_combination<F>(
    bindings: &[Binding],
    item: &Value,
    ctx: &dyn EvalContext,
    f: &mut F,
) -> Result<bool>
where
    F: FnMut(&Value) -> Result<bool>,
{
    fn recurse<F>(
        bindings: &[Binding],
        vars: &mut Vec<(String, Value)>,
        item: &Value,
        ctx: &dyn EvalContext,
        f: &mut F,
    ) -> Result<bool>
    where
        F: FnMut(&Value) -> Result<bool>,
    {
        let Some((first, rest)) = bindings.split_first() else {
            let borrowed: Vec<(&str, &Value)> =
                vars.iter().map(|(n, v)| (n.as_str(), v)).collect();
            let scope = child_scope(item, &borrowed);
            return f(&scope);
        };
        let source = first.source.evaluate(item, ctx)?;
        let elems = match source {
            Value::Array(items) => items,
            _ => Vec::new(),
        };
        for elem in elems {
            vars.push((first.variable.clone(), elem));
            let keep_going = recurse(rest, vars, item, ctx, f)?;
            vars.pop();
            if !keep_going {
                return Ok(false);
            }
        }
        Ok(true)
    }
    recurse(bindings, &mut Vec::new(), item, ctx, f)
}

/// `ANY … SATISFIES cond END`: true when any combination of bound elements
/// satisfies the predicate; false otherwise, including over empty sources.
pub(super) fn eval_any(
    bindings: &[Binding],
    satisfies: &Expr,
    item: &Value,
    ctx: &dyn EvalContext,
) -> Result<Value> {
    let mut found = false;
    for_each_combination(bindings, item, ctx, &mut |scope| {
        if satisfies.evaluate(scope, ctx)?.truth() {
            found = true;
            return Ok(false);
        }
        Ok(true)
    })?;
    Ok(Value::Bool(found))
}

/// `EVERY … SATISFIES cond END`: true when every combination satisfies the
/// predicate; vacuously true over empty sources.
pub(super) fn eval_every(
    bindings: &[Binding],
    satisfies: &Expr,
    item: &Value,
    ctx: &dyn EvalContext,
) -> Result<Value> {
    let mut all = true;
    for_each_combination(bindings, item, ctx, &mut |scope| {
        if !satisfies.evaluate(scope, ctx)?.truth() {
            all = false;
            return Ok(false);
        }
        Ok(true)
    })?;
    Ok(Value::Bool(all))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{CmpOp, SimpleContext};

    fn bindings() -> Vec<Binding> {
        vec![Binding {
            variable: "t".into(),
            source: Box::new(Expr::field(["tags"])),
        }]
    }

    fn satisfies_eq(target: &str) -> Expr {
        Expr::Cmp(
            CmpOp::Eq,
            Box::new(Expr::field(["t"])),
            Box::new(Expr::literal(target)),
        )
    }

    fn doc() -> Value {
        Value::object([(
            "tags",
            Value::Array(vec![Value::from("red"), Value::from("blue")]),
        )])
    }

    #[test]
    fn any_finds_a_match() {
        let ctx = SimpleContext::default();
        let out = eval_any(&bindings(), &satisfies_eq("blue"), &doc(), &ctx).unwrap();
        assert_eq!(out, Value::TRUE);
        let out = eval_any(&bindings(), &satisfies_eq("green"), &doc(), &ctx).unwrap();
        assert_eq!(out, Value::FALSE);
    }

    #[test]
    fn every_is_vacuously_true_on_empty() {
        let ctx = SimpleContext::default();
        let empty = Value::object([("tags", Value::Array(vec![]))]);
        let out = eval_every(&bindings(), &satisfies_eq("red"), &empty, &ctx).unwrap();
        assert_eq!(out, Value::TRUE);
    }

    #[test]
    fn non_array_source_behaves_as_empty() {
        let ctx = SimpleContext::default();
        let scalar = Value::object([("tags", Value::from(1.0))]);
        assert_eq!(
            eval_any(&bindings(), &satisfies_eq("red"), &scalar, &ctx).unwrap(),
            Value::FALSE
        );
    }
}

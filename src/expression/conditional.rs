//! Conditional numeric functions: IFINF, IFNAN, IFNANORINF.

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::value::Value;

use super::{EvalContext, Expr};

/// Which member of the conditional numeric family a node represents.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum CondNumKind {
    /// First non-MISSING, non-infinite number.
    IfInf,
    /// First non-MISSING, non-NaN number.
    IfNaN,
    /// First non-MISSING finite number.
    IfNaNOrInf,
}

impl CondNumKind {
    /// Canonical lower-case function name.
    pub fn name(&self) -> &'static str {
        match self {
            CondNumKind::IfInf => "ifinf",
            CondNumKind::IfNaN => "ifnan",
            CondNumKind::IfNaNOrInf => "ifnanorinf",
        }
    }

    fn qualifies(&self, n: f64) -> bool {
        match self {
            CondNumKind::IfInf => !n.is_infinite(),
            CondNumKind::IfNaN => !n.is_nan(),
            CondNumKind::IfNaNOrInf => n.is_finite(),
        }
    }
}

/// Scans operands left to right and returns the first qualifying NUMBER.
/// Degrades to MISSING only when every operand was MISSING, otherwise NULL.
/// All operands are evaluated so that evaluation errors surface regardless
/// of position.
pub(super) fn evaluate(
    kind: CondNumKind,
    operands: &[Expr],
    item: &Value,
    ctx: &dyn EvalContext,
) -> Result<Value> {
    let mut winner: Option<Value> = None;
    let mut all_missing = true;
    for op in operands {
        let v = op.evaluate(item, ctx)?;
        if v == Value::Missing {
            continue;
        }
        all_missing = false;
        if winner.is_none() {
            if let Value::Number(n) = v {
                if kind.qualifies(n) {
                    winner = Some(v);
                }
            }
        }
    }
    if let Some(v) = winner {
        return Ok(v);
    }
    if all_missing && !operands.is_empty() {
        Ok(Value::Missing)
    } else {
        Ok(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::SimpleContext;

    fn eval(kind: CondNumKind, vals: Vec<Value>) -> Value {
        let operands: Vec<Expr> = vals.into_iter().map(Expr::Literal).collect();
        evaluate(kind, &operands, &Value::Missing, &SimpleContext::default()).unwrap()
    }

    #[test]
    fn ifinf_skips_infinities() {
        let out = eval(
            CondNumKind::IfInf,
            vec![
                Value::Number(f64::INFINITY),
                Value::Number(2.0),
                Value::Number(3.0),
            ],
        );
        assert_eq!(out, Value::Number(2.0));
    }

    #[test]
    fn ifnan_skips_nan_but_accepts_infinity() {
        let out = eval(
            CondNumKind::IfNaN,
            vec![Value::Number(f64::NAN), Value::Number(f64::INFINITY)],
        );
        assert_eq!(out, Value::Number(f64::INFINITY));
    }

    #[test]
    fn all_missing_degrades_to_missing() {
        let out = eval(CondNumKind::IfNaNOrInf, vec![Value::Missing, Value::Missing]);
        assert_eq!(out, Value::Missing);
    }

    #[test]
    fn non_number_operand_forces_null() {
        let out = eval(
            CondNumKind::IfNaNOrInf,
            vec![Value::Missing, Value::from("nope")],
        );
        assert_eq!(out, Value::Null);
    }

    #[test]
    fn first_qualifying_wins_over_later_ones() {
        let out = eval(
            CondNumKind::IfNaNOrInf,
            vec![Value::Number(1.0), Value::Number(2.0)],
        );
        assert_eq!(out, Value::Number(1.0));
    }
}

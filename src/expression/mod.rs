//! Immutable expression trees and their purely functional evaluation.
//!
//! Expressions are built once (by the parser or the planner) and never
//! mutated; evaluation takes an item and a context and produces a value or
//! fails. The planner interrogates the same trees for sargability, coverage,
//! and constant-foldability, so the structural accessors here
//! ([`Expr::equivalent_to`], [`Expr::depends_on`], [`Expr::covered_by`],
//! [`Expr::static_value`]) are as load-bearing as evaluation itself.

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::value::Value;

mod collection;
mod conditional;
mod context;
mod functions;
mod like;

pub use conditional::CondNumKind;
pub use context::{EvalContext, SimpleContext};
pub use like::{like_prefix, like_to_regex, prefix_successor};

/// Comparison operator kinds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum CmpOp {
    /// `=`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

/// Arithmetic operator kinds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ArithOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Mod,
}

/// Aggregate function kinds referenced from projections and HAVING clauses.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum AggKind {
    /// `COUNT(*)` / `COUNT(expr)`
    Count,
    /// `SUM(expr)`
    Sum,
    /// `AVG(expr)`
    Avg,
    /// `MIN(expr)`
    Min,
    /// `MAX(expr)`
    Max,
    /// `STDDEV_SAMP(expr)`
    StddevSamp,
}

impl AggKind {
    /// Canonical lower-case function name.
    pub fn name(&self) -> &'static str {
        match self {
            AggKind::Count => "count",
            AggKind::Sum => "sum",
            AggKind::Avg => "avg",
            AggKind::Min => "min",
            AggKind::Max => "max",
            AggKind::StddevSamp => "stddev_samp",
        }
    }
}

/// A named binding over an array expression, used by ANY/EVERY.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    /// Bound variable name.
    pub variable: String,
    /// Array expression the variable ranges over.
    pub source: Box<Expr>,
}

/// Immutable expression tree node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Constant value.
    Literal(Value),
    /// Identifier path rooted at a binding or keyspace alias.
    Field(Vec<String>),
    /// Positional placeholder `$1`, `$2`, …
    PositionalParam(usize),
    /// Named placeholder `$name`.
    NamedParam(String),
    /// Binary arithmetic.
    Arith(ArithOp, Box<Expr>, Box<Expr>),
    /// Unary negation.
    Neg(Box<Expr>),
    /// Binary comparison.
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    /// `expr BETWEEN low AND high`.
    Between {
        /// Tested expression.
        expr: Box<Expr>,
        /// Inclusive lower bound.
        low: Box<Expr>,
        /// Inclusive upper bound.
        high: Box<Expr>,
    },
    /// `expr LIKE pattern`.
    Like {
        /// Tested expression.
        expr: Box<Expr>,
        /// Pattern expression (`%`/`_` wildcards).
        pattern: Box<Expr>,
    },
    /// `expr IN list`.
    In {
        /// Tested expression.
        expr: Box<Expr>,
        /// Candidate expressions.
        list: Vec<Expr>,
    },
    /// `expr IS NULL`.
    IsNull(Box<Expr>),
    /// `expr IS NOT NULL`.
    IsNotNull(Box<Expr>),
    /// `expr IS MISSING`.
    IsMissing(Box<Expr>),
    /// `expr IS VALUED` (neither NULL nor MISSING).
    IsValued(Box<Expr>),
    /// N-ary conjunction.
    And(Vec<Expr>),
    /// N-ary disjunction.
    Or(Vec<Expr>),
    /// Negation.
    Not(Box<Expr>),
    /// Conditional numeric family (IFINF/IFNAN/IFNANORINF).
    CondNum(CondNumKind, Vec<Expr>),
    /// `ANY var IN source SATISFIES cond END`.
    Any {
        /// Range bindings.
        bindings: Vec<Binding>,
        /// Predicate tested per element.
        satisfies: Box<Expr>,
    },
    /// `EVERY var IN source SATISFIES cond END`.
    Every {
        /// Range bindings.
        bindings: Vec<Binding>,
        /// Predicate tested per element.
        satisfies: Box<Expr>,
    },
    /// Scalar function call.
    Func {
        /// Lower-case function name.
        name: String,
        /// Argument expressions.
        args: Vec<Expr>,
    },
    /// Aggregate reference; resolved by the grouping operators.
    Aggregate {
        /// Aggregate kind.
        kind: AggKind,
        /// Aggregated expression; `None` for `COUNT(*)`.
        expr: Option<Box<Expr>>,
        /// DISTINCT modifier.
        distinct: bool,
    },
}

impl Expr {
    /// Shorthand for a field path.
    pub fn field<I, S>(path: I) -> Expr
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Expr::Field(path.into_iter().map(Into::into).collect())
    }

    /// Shorthand for a literal.
    pub fn literal(v: impl Into<Value>) -> Expr {
        Expr::Literal(v.into())
    }

    /// Structural equivalence. Two nodes are equivalent when one can be
    /// substituted for the other in any plan.
    pub fn equivalent_to(&self, other: &Expr) -> bool {
        self == other
    }

    /// Whether `other` occurs anywhere within this tree.
    pub fn depends_on(&self, other: &Expr) -> bool {
        if self.equivalent_to(other) {
            return true;
        }
        self.children().iter().any(|c| c.depends_on(other))
    }

    /// Whether this expression is computable from `covers` alone, without a
    /// document fetch. A field reference must appear verbatim in the cover
    /// set; every other node is covered when all of its children are.
    pub fn covered_by(&self, covers: &[Expr]) -> bool {
        if covers.iter().any(|c| c.equivalent_to(self)) {
            return true;
        }
        match self {
            Expr::Field(_) => false,
            Expr::Aggregate { expr, .. } => {
                expr.as_ref().map(|e| e.covered_by(covers)).unwrap_or(true)
            }
            _ => self.children().iter().all(|c| c.covered_by(covers)),
        }
    }

    /// Constant-folds the expression. Returns the folded value when the tree
    /// references no fields, parameters, or aggregates.
    pub fn static_value(&self) -> Option<Value> {
        if !self.is_static() {
            return None;
        }
        let ctx = SimpleContext::default();
        self.evaluate(&Value::Missing, &ctx).ok()
    }

    fn is_static(&self) -> bool {
        match self {
            Expr::Field(_)
            | Expr::PositionalParam(_)
            | Expr::NamedParam(_)
            | Expr::Aggregate { .. } => false,
            _ => self.children().iter().all(|c| c.is_static()),
        }
    }

    /// Whether a MISSING operand forces a MISSING result.
    pub fn propagates_missing(&self) -> bool {
        !matches!(
            self,
            Expr::CondNum(..)
                | Expr::IsNull(_)
                | Expr::IsNotNull(_)
                | Expr::IsMissing(_)
                | Expr::IsValued(_)
                | Expr::And(_)
                | Expr::Or(_)
        )
    }

    /// Whether a NULL operand forces a NULL result.
    pub fn propagates_null(&self) -> bool {
        self.propagates_missing()
    }

    /// Immediate child expressions.
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Literal(_)
            | Expr::Field(_)
            | Expr::PositionalParam(_)
            | Expr::NamedParam(_) => Vec::new(),
            Expr::Arith(_, a, b) | Expr::Cmp(_, a, b) => vec![a, b],
            Expr::Neg(a)
            | Expr::IsNull(a)
            | Expr::IsNotNull(a)
            | Expr::IsMissing(a)
            | Expr::IsValued(a)
            | Expr::Not(a) => vec![a],
            Expr::Between { expr, low, high } => vec![expr, low, high],
            Expr::Like { expr, pattern } => vec![expr, pattern],
            Expr::In { expr, list } => {
                let mut out: Vec<&Expr> = vec![expr];
                out.extend(list.iter());
                out
            }
            Expr::And(items) | Expr::Or(items) | Expr::CondNum(_, items) => {
                items.iter().collect()
            }
            Expr::Any {
                bindings,
                satisfies,
            }
            | Expr::Every {
                bindings,
                satisfies,
            } => {
                let mut out: Vec<&Expr> = bindings.iter().map(|b| b.source.as_ref()).collect();
                out.push(satisfies);
                out
            }
            Expr::Func { args, .. } => args.iter().collect(),
            Expr::Aggregate { expr, .. } => expr.iter().map(|e| e.as_ref()).collect(),
        }
    }

    /// Alias used when this expression heads an unaliased projection term:
    /// the final path segment of a field reference, empty otherwise.
    pub fn alias(&self) -> &str {
        match self {
            Expr::Field(path) => path.last().map(String::as_str).unwrap_or(""),
            _ => "",
        }
    }

    /// Canonical textual form used for aggregate result keys and explain
    /// output.
    pub fn canonical(&self) -> String {
        match self {
            Expr::Literal(v) => serde_json::to_string(v).unwrap_or_default(),
            Expr::Field(path) => path.join("."),
            Expr::PositionalParam(i) => format!("${i}"),
            Expr::NamedParam(n) => format!("${n}"),
            Expr::Arith(op, a, b) => {
                let sym = match op {
                    ArithOp::Add => "+",
                    ArithOp::Sub => "-",
                    ArithOp::Mul => "*",
                    ArithOp::Div => "/",
                    ArithOp::Mod => "%",
                };
                format!("({} {} {})", a.canonical(), sym, b.canonical())
            }
            Expr::Neg(a) => format!("(-{})", a.canonical()),
            Expr::Cmp(op, a, b) => {
                let sym = match op {
                    CmpOp::Eq => "=",
                    CmpOp::Ne => "!=",
                    CmpOp::Lt => "<",
                    CmpOp::Le => "<=",
                    CmpOp::Gt => ">",
                    CmpOp::Ge => ">=",
                };
                format!("({} {} {})", a.canonical(), sym, b.canonical())
            }
            Expr::Between { expr, low, high } => format!(
                "({} between {} and {})",
                expr.canonical(),
                low.canonical(),
                high.canonical()
            ),
            Expr::Like { expr, pattern } => {
                format!("({} like {})", expr.canonical(), pattern.canonical())
            }
            Expr::In { expr, list } => {
                let items: Vec<String> = list.iter().map(Expr::canonical).collect();
                format!("({} in [{}])", expr.canonical(), items.join(", "))
            }
            Expr::IsNull(a) => format!("({} is null)", a.canonical()),
            Expr::IsNotNull(a) => format!("({} is not null)", a.canonical()),
            Expr::IsMissing(a) => format!("({} is missing)", a.canonical()),
            Expr::IsValued(a) => format!("({} is valued)", a.canonical()),
            Expr::And(items) => {
                let parts: Vec<String> = items.iter().map(Expr::canonical).collect();
                format!("({})", parts.join(" and "))
            }
            Expr::Or(items) => {
                let parts: Vec<String> = items.iter().map(Expr::canonical).collect();
                format!("({})", parts.join(" or "))
            }
            Expr::Not(a) => format!("(not {})", a.canonical()),
            Expr::CondNum(kind, items) => {
                let parts: Vec<String> = items.iter().map(Expr::canonical).collect();
                format!("{}({})", kind.name(), parts.join(", "))
            }
            Expr::Any { .. } => "any(...)".to_owned(),
            Expr::Every { .. } => "every(...)".to_owned(),
            Expr::Func { name, args } => {
                let parts: Vec<String> = args.iter().map(Expr::canonical).collect();
                format!("{}({})", name, parts.join(", "))
            }
            Expr::Aggregate {
                kind,
                expr,
                distinct,
            } => {
                let inner = match expr {
                    Some(e) => e.canonical(),
                    None => "*".to_owned(),
                };
                if *distinct {
                    format!("{}(distinct {})", kind.name(), inner)
                } else {
                    format!("{}({})", kind.name(), inner)
                }
            }
        }
    }

    /// Evaluates the expression against `item`.
    pub fn evaluate(&self, item: &Value, ctx: &dyn EvalContext) -> Result<Value> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Field(path) => {
                let mut cur = item.clone();
                for seg in path {
                    cur = cur.field(seg);
                }
                Ok(cur)
            }
            Expr::PositionalParam(i) => ctx
                .positional_param(*i)
                .ok_or_else(|| Error::Semantics {
                    reason: format!("no value for positional parameter ${i}"),
                }),
            Expr::NamedParam(name) => ctx.named_param(name).ok_or_else(|| Error::Semantics {
                reason: format!("no value for named parameter ${name}"),
            }),
            Expr::Arith(op, a, b) => {
                let av = a.evaluate(item, ctx)?;
                let bv = b.evaluate(item, ctx)?;
                Ok(eval_arith(*op, &av, &bv))
            }
            Expr::Neg(a) => {
                let av = a.evaluate(item, ctx)?;
                Ok(match av {
                    Value::Missing => Value::Missing,
                    Value::Number(n) => Value::Number(-n),
                    _ => Value::Null,
                })
            }
            Expr::Cmp(op, a, b) => {
                let av = a.evaluate(item, ctx)?;
                let bv = b.evaluate(item, ctx)?;
                Ok(eval_cmp(*op, &av, &bv))
            }
            Expr::Between { expr, low, high } => {
                let v = expr.evaluate(item, ctx)?;
                let lo = low.evaluate(item, ctx)?;
                let hi = high.evaluate(item, ctx)?;
                let ge = eval_cmp(CmpOp::Ge, &v, &lo);
                let le = eval_cmp(CmpOp::Le, &v, &hi);
                Ok(and2(ge, le))
            }
            Expr::Like { expr, pattern } => {
                let v = expr.evaluate(item, ctx)?;
                let p = pattern.evaluate(item, ctx)?;
                match (&v, &p) {
                    (Value::Missing, _) | (_, Value::Missing) => Ok(Value::Missing),
                    (Value::String(s), Value::String(pat)) => {
                        let re = ctx.like_regex(pat)?;
                        Ok(Value::Bool(re.is_match(s)))
                    }
                    _ => Ok(Value::Null),
                }
            }
            Expr::In { expr, list } => {
                let v = expr.evaluate(item, ctx)?;
                let mut null = false;
                let mut missing = false;
                for cand in list {
                    let cv = cand.evaluate(item, ctx)?;
                    match v.equals(&cv) {
                        Value::Bool(true) => return Ok(Value::TRUE),
                        Value::Missing => missing = true,
                        Value::Null => null = true,
                        _ => {}
                    }
                }
                if missing {
                    Ok(Value::Missing)
                } else if null {
                    Ok(Value::Null)
                } else {
                    Ok(Value::FALSE)
                }
            }
            Expr::IsNull(a) => {
                let v = a.evaluate(item, ctx)?;
                Ok(match v {
                    Value::Missing => Value::Missing,
                    Value::Null => Value::TRUE,
                    _ => Value::FALSE,
                })
            }
            Expr::IsNotNull(a) => {
                let v = a.evaluate(item, ctx)?;
                Ok(match v {
                    Value::Missing => Value::Missing,
                    Value::Null => Value::FALSE,
                    _ => Value::TRUE,
                })
            }
            Expr::IsMissing(a) => {
                let v = a.evaluate(item, ctx)?;
                Ok(Value::Bool(v == Value::Missing))
            }
            Expr::IsValued(a) => {
                let v = a.evaluate(item, ctx)?;
                Ok(Value::Bool(!matches!(v, Value::Missing | Value::Null)))
            }
            Expr::And(items) => {
                let mut missing = false;
                let mut null = false;
                for e in items {
                    match e.evaluate(item, ctx)? {
                        Value::Missing => missing = true,
                        Value::Null => null = true,
                        v if !v.truth() => return Ok(Value::FALSE),
                        _ => {}
                    }
                }
                if missing {
                    Ok(Value::Missing)
                } else if null {
                    Ok(Value::Null)
                } else {
                    Ok(Value::TRUE)
                }
            }
            Expr::Or(items) => {
                let mut missing = false;
                let mut null = false;
                for e in items {
                    match e.evaluate(item, ctx)? {
                        Value::Missing => missing = true,
                        Value::Null => null = true,
                        v if v.truth() => return Ok(Value::TRUE),
                        _ => {}
                    }
                }
                if null {
                    Ok(Value::Null)
                } else if missing {
                    Ok(Value::Missing)
                } else {
                    Ok(Value::FALSE)
                }
            }
            Expr::Not(a) => {
                let v = a.evaluate(item, ctx)?;
                Ok(match v {
                    Value::Missing => Value::Missing,
                    Value::Null => Value::Null,
                    other => Value::Bool(!other.truth()),
                })
            }
            Expr::CondNum(kind, items) => conditional::evaluate(*kind, items, item, ctx),
            Expr::Any {
                bindings,
                satisfies,
            } => collection::eval_any(bindings, satisfies, item, ctx),
            Expr::Every {
                bindings,
                satisfies,
            } => collection::eval_every(bindings, satisfies, item, ctx),
            Expr::Func { name, args } => functions::evaluate(name, args, item, ctx),
            Expr::Aggregate { .. } => Ok(item.field(&self.canonical())),
        }
    }
}

fn eval_arith(op: ArithOp, a: &Value, b: &Value) -> Value {
    if matches!(a, Value::Missing) || matches!(b, Value::Missing) {
        return Value::Missing;
    }
    let (x, y) = match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => (x, y),
        _ => return Value::Null,
    };
    let r = match op {
        ArithOp::Add => x + y,
        ArithOp::Sub => x - y,
        ArithOp::Mul => x * y,
        ArithOp::Div => x / y,
        ArithOp::Mod => x % y,
    };
    Value::Number(r)
}

fn eval_cmp(op: CmpOp, a: &Value, b: &Value) -> Value {
    match op {
        CmpOp::Eq => a.equals(b),
        CmpOp::Ne => match a.equals(b) {
            Value::Bool(x) => Value::Bool(!x),
            other => other,
        },
        _ => {
            if matches!(a, Value::Missing) || matches!(b, Value::Missing) {
                return Value::Missing;
            }
            if matches!(a, Value::Null) || matches!(b, Value::Null) {
                return Value::Null;
            }
            let ord = a.collate(b);
            let truth = match op {
                CmpOp::Lt => ord.is_lt(),
                CmpOp::Le => ord.is_le(),
                CmpOp::Gt => ord.is_gt(),
                CmpOp::Ge => ord.is_ge(),
                CmpOp::Eq | CmpOp::Ne => unreachable!(),
            };
            Value::Bool(truth)
        }
    }
}

fn and2(a: Value, b: Value) -> Value {
    match (&a, &b) {
        (v, _) if !v.truth() && !matches!(v, Value::Missing | Value::Null) => Value::FALSE,
        (_, v) if !v.truth() && !matches!(v, Value::Missing | Value::Null) => Value::FALSE,
        (Value::Missing, _) | (_, Value::Missing) => Value::Missing,
        (Value::Null, _) | (_, Value::Null) => Value::Null,
        _ => Value::TRUE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> SimpleContext {
        SimpleContext::default()
    }

    fn doc() -> Value {
        Value::object([
            ("a", Value::from(10.0)),
            ("s", Value::from("widget")),
            ("n", Value::Null),
        ])
    }

    #[test]
    fn field_navigation() {
        let e = Expr::field(["a"]);
        assert_eq!(e.evaluate(&doc(), &ctx()).unwrap(), Value::from(10.0));
        let missing = Expr::field(["zz"]);
        assert_eq!(missing.evaluate(&doc(), &ctx()).unwrap(), Value::Missing);
    }

    #[test]
    fn comparison_three_valued() {
        let lt = Expr::Cmp(
            CmpOp::Lt,
            Box::new(Expr::field(["a"])),
            Box::new(Expr::literal(20.0)),
        );
        assert_eq!(lt.evaluate(&doc(), &ctx()).unwrap(), Value::TRUE);

        let vs_null = Expr::Cmp(
            CmpOp::Lt,
            Box::new(Expr::field(["n"])),
            Box::new(Expr::literal(20.0)),
        );
        assert_eq!(vs_null.evaluate(&doc(), &ctx()).unwrap(), Value::Null);

        let vs_missing = Expr::Cmp(
            CmpOp::Lt,
            Box::new(Expr::field(["zz"])),
            Box::new(Expr::literal(20.0)),
        );
        assert_eq!(vs_missing.evaluate(&doc(), &ctx()).unwrap(), Value::Missing);
    }

    #[test]
    fn and_truth_table() {
        let f = Expr::literal(false);
        let m = Expr::field(["zz"]);
        let and = Expr::And(vec![f, m]);
        // FALSE dominates MISSING.
        assert_eq!(and.evaluate(&doc(), &ctx()).unwrap(), Value::FALSE);

        let and2 = Expr::And(vec![Expr::literal(true), Expr::field(["zz"])]);
        assert_eq!(and2.evaluate(&doc(), &ctx()).unwrap(), Value::Missing);
    }

    #[test]
    fn in_list_reports_null_on_miss_with_null() {
        let e = Expr::In {
            expr: Box::new(Expr::field(["a"])),
            list: vec![Expr::literal(1.0), Expr::Literal(Value::Null)],
        };
        assert_eq!(e.evaluate(&doc(), &ctx()).unwrap(), Value::Null);

        let hit = Expr::In {
            expr: Box::new(Expr::field(["a"])),
            list: vec![Expr::literal(10.0), Expr::Literal(Value::Null)],
        };
        assert_eq!(hit.evaluate(&doc(), &ctx()).unwrap(), Value::TRUE);
    }

    #[test]
    fn static_folding() {
        let e = Expr::Arith(
            ArithOp::Add,
            Box::new(Expr::literal(1.0)),
            Box::new(Expr::literal(2.0)),
        );
        assert_eq!(e.static_value(), Some(Value::from(3.0)));
        assert_eq!(Expr::field(["a"]).static_value(), None);
    }

    #[test]
    fn covered_by_requires_verbatim_fields() {
        let key = Expr::field(["a"]);
        let sum = Expr::Arith(
            ArithOp::Add,
            Box::new(Expr::field(["a"])),
            Box::new(Expr::literal(1.0)),
        );
        assert!(sum.covered_by(std::slice::from_ref(&key)));
        let other = Expr::Arith(
            ArithOp::Add,
            Box::new(Expr::field(["b"])),
            Box::new(Expr::literal(1.0)),
        );
        assert!(!other.covered_by(std::slice::from_ref(&key)));
    }

    #[test]
    fn depends_on_walks_the_tree() {
        let key = Expr::field(["a"]);
        let pred = Expr::Cmp(
            CmpOp::Eq,
            Box::new(Expr::Arith(
                ArithOp::Mul,
                Box::new(Expr::field(["a"])),
                Box::new(Expr::literal(2.0)),
            )),
            Box::new(Expr::literal(4.0)),
        );
        assert!(pred.depends_on(&key));
        assert!(!pred.depends_on(&Expr::field(["b"])));
    }
}

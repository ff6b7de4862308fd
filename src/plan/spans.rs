//! Index scan spans: unevaluated low/high/inclusion ranges over index keys.

use serde::{Deserialize, Serialize};

use crate::datastore::{Inclusion, ValueSpan};
use crate::errors::Result;
use crate::expression::{EvalContext, Expr};
use crate::value::Value;

/// Unevaluated range over one composite index key.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SpanRange {
    /// Per-key low bound expressions; empty means unbounded below.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub low: Vec<Expr>,
    /// Per-key high bound expressions; empty means unbounded above.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub high: Vec<Expr>,
    /// Endpoint inclusion.
    #[serde(default)]
    pub inclusion: Inclusion,
}

/// One span of a [`Spans2`] set.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Span2 {
    /// The key range.
    pub range: SpanRange,
    /// Whether the span exactly represents the predicate it was derived
    /// from; inexact spans require a residual filter.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub exact: bool,
}

/// Ordered list of composite spans driving an index scan.
pub type Spans2 = Vec<Span2>;

impl Span2 {
    /// Point span: low = high = `expr`, both inclusive, exact.
    pub fn point(expr: Expr) -> Self {
        Self {
            range: SpanRange {
                low: vec![expr.clone()],
                high: vec![expr],
                inclusion: Inclusion::Both,
            },
            exact: true,
        }
    }

    /// Evaluates the bound expressions into a [`ValueSpan`].
    pub fn resolve(&self, ctx: &dyn EvalContext) -> Result<ValueSpan> {
        let eval = |exprs: &[Expr]| -> Result<Vec<Value>> {
            exprs
                .iter()
                .map(|e| e.evaluate(&Value::Missing, ctx))
                .collect()
        };
        Ok(ValueSpan {
            low: eval(&self.range.low)?,
            high: eval(&self.range.high)?,
            inclusion: self.range.inclusion,
        })
    }
}

/// Expression bound used as the NULL fence: values collate above NULL.
pub fn null_expr() -> Expr {
    Expr::Literal(Value::Null)
}

/// Whole-range span: any value of the key satisfies the predicate.
pub fn self_spans() -> Spans2 {
    vec![Span2 {
        range: SpanRange::default(),
        exact: true,
    }]
}

/// Any non-null, non-missing value; the predicate still needs a residual
/// filter.
pub fn valued_spans() -> Spans2 {
    vec![Span2 {
        range: SpanRange {
            low: vec![null_expr()],
            high: Vec::new(),
            inclusion: Inclusion::Neither,
        },
        exact: false,
    }]
}

/// Any non-null, non-missing value, with no residual filter required.
pub fn exact_valued_spans() -> Spans2 {
    let mut spans = valued_spans();
    spans[0].exact = true;
    spans
}

/// Whether every span in the set exactly represents its predicate.
pub fn spans_exact(spans: &Spans2) -> bool {
    spans.iter().all(|s| s.exact)
}

/// Describes which index keys a covering scan must surface.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexProjection {
    /// Positions of index keys the operator needs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entry_keys: Vec<usize>,
    /// Whether the primary key must be surfaced.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub primary_key: bool,
}

impl IndexProjection {
    /// Projection surfacing only the primary key.
    pub fn primary_only() -> Self {
        Self {
            entry_keys: Vec::new(),
            primary_key: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::SimpleContext;

    #[test]
    fn point_span_resolves_to_closed_range() {
        let span = Span2::point(Expr::literal(7.0));
        let resolved = span.resolve(&SimpleContext::default()).unwrap();
        assert_eq!(resolved.low, vec![Value::from(7.0)]);
        assert_eq!(resolved.high, vec![Value::from(7.0)]);
        assert_eq!(resolved.inclusion, Inclusion::Both);
        assert!(resolved.contains(&[Value::from(7.0)]));
        assert!(!resolved.contains(&[Value::from(8.0)]));
    }

    #[test]
    fn valued_spans_exclude_null() {
        let spans = valued_spans();
        let resolved = spans[0].resolve(&SimpleContext::default()).unwrap();
        assert!(!resolved.contains(&[Value::Null]));
        assert!(resolved.contains(&[Value::from(0.0)]));
        assert!(resolved.contains(&[Value::from("")]));
    }

    #[test]
    fn sentinel_exactness() {
        assert!(spans_exact(&self_spans()));
        assert!(!spans_exact(&valued_spans()));
        assert!(spans_exact(&exact_valued_spans()));
    }

    #[test]
    fn span_json_omits_empty_bounds() {
        let json = serde_json::to_value(&self_spans()).unwrap();
        let range = &json[0]["range"];
        assert!(range.get("low").is_none());
        assert!(range.get("high").is_none());
    }
}

//! Sargability: converting predicates into index spans.
//!
//! For a candidate index key and one conjunct of the WHERE predicate the
//! functions here derive the span set that the index scan must cover:
//!
//! * `None` — the conjunct does not mention the key and puts no constraint
//!   on this index.
//! * Valued spans — the conjunct depends on the key but is not structurally
//!   sargable; scan everything non-null and re-filter.
//! * A concrete span set, `exact` when the spans alone decide membership.

use crate::datastore::Inclusion;
use crate::expression::{like_prefix, CmpOp, Expr};
use crate::plan::{
    exact_valued_spans, null_expr, self_spans, valued_spans, Span2, SpanRange, Spans2,
};
use crate::value::Value;

/// Derives spans constraining `key` from a single predicate tree.
pub fn sarg_for(pred: &Expr, key: &Expr) -> Option<Spans2> {
    if pred.equivalent_to(key) {
        return Some(self_spans());
    }
    match pred {
        Expr::Cmp(op, a, b) => sarg_cmp(pred, *op, a, b, key),
        Expr::Between { expr, low, high } => sarg_between(pred, expr, low, high, key),
        Expr::In { expr, list } => sarg_in(pred, expr, list, key),
        Expr::IsNotNull(inner) | Expr::IsValued(inner) => {
            if inner.equivalent_to(key) {
                Some(exact_valued_spans())
            } else {
                dependent_fallback(pred, key)
            }
        }
        Expr::IsNull(inner) => {
            if inner.equivalent_to(key) {
                Some(vec![Span2::point(null_expr())])
            } else {
                dependent_fallback(pred, key)
            }
        }
        // Missing keys have no index entry, so no span can serve this.
        Expr::IsMissing(_) => None,
        Expr::Like { expr, pattern } => sarg_like(pred, expr, pattern, key),
        Expr::And(conjuncts) => sarg_and(conjuncts, key),
        Expr::Or(disjuncts) => sarg_or(disjuncts, key),
        _ => dependent_fallback(pred, key),
    }
}

fn dependent_fallback(pred: &Expr, key: &Expr) -> Option<Spans2> {
    if pred.depends_on(key) && strongly_propagates(pred, key) {
        Some(valued_spans())
    } else {
        None
    }
}

/// Whether a MISSING or NULL key value is guaranteed to flow through to a
/// MISSING/NULL (hence non-true) predicate result. A valued-spans scan
/// skips such rows, so the fallback is only sound when this holds;
/// conditional functions and IS-checks break the propagation.
fn strongly_propagates(expr: &Expr, key: &Expr) -> bool {
    if !expr.depends_on(key) {
        return true;
    }
    match expr {
        Expr::Field(_) => true,
        Expr::Arith(..)
        | Expr::Neg(_)
        | Expr::Cmp(..)
        | Expr::Between { .. }
        | Expr::Like { .. }
        | Expr::In { .. }
        | Expr::And(_)
        | Expr::Or(_)
        | Expr::Not(_) => expr
            .children()
            .iter()
            .all(|c| strongly_propagates(c, key)),
        _ => false,
    }
}

fn static_bound(expr: &Expr) -> Option<Expr> {
    expr.static_value().map(Expr::Literal)
}

fn sarg_cmp(pred: &Expr, op: CmpOp, a: &Expr, b: &Expr, key: &Expr) -> Option<Spans2> {
    // Orient the comparison so the key is on the left.
    let (bound, op) = if a.equivalent_to(key) {
        (b, op)
    } else if b.equivalent_to(key) {
        let flipped = match op {
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Le => CmpOp::Ge,
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::Ge => CmpOp::Le,
            other => other,
        };
        (a, flipped)
    } else {
        return dependent_fallback(pred, key);
    };
    let Some(bound) = static_bound(bound) else {
        return Some(valued_spans());
    };
    let span = match op {
        CmpOp::Eq => Span2::point(bound),
        CmpOp::Ne => return Some(valued_spans()),
        CmpOp::Lt => Span2 {
            range: SpanRange {
                low: vec![null_expr()],
                high: vec![bound],
                inclusion: Inclusion::Neither,
            },
            exact: true,
        },
        CmpOp::Le => Span2 {
            range: SpanRange {
                low: vec![null_expr()],
                high: vec![bound],
                inclusion: Inclusion::High,
            },
            exact: true,
        },
        CmpOp::Gt => Span2 {
            range: SpanRange {
                low: vec![bound],
                high: Vec::new(),
                inclusion: Inclusion::Neither,
            },
            exact: true,
        },
        CmpOp::Ge => Span2 {
            range: SpanRange {
                low: vec![bound],
                high: Vec::new(),
                inclusion: Inclusion::Low,
            },
            exact: true,
        },
    };
    Some(vec![span])
}

fn sarg_between(pred: &Expr, expr: &Expr, low: &Expr, high: &Expr, key: &Expr) -> Option<Spans2> {
    if !expr.equivalent_to(key) {
        return dependent_fallback(pred, key);
    }
    match (static_bound(low), static_bound(high)) {
        (Some(low), Some(high)) => Some(vec![Span2 {
            range: SpanRange {
                low: vec![low],
                high: vec![high],
                inclusion: Inclusion::Both,
            },
            exact: true,
        }]),
        _ => Some(valued_spans()),
    }
}

fn sarg_in(pred: &Expr, expr: &Expr, list: &[Expr], key: &Expr) -> Option<Spans2> {
    if !expr.equivalent_to(key) {
        return dependent_fallback(pred, key);
    }
    if list.is_empty() {
        return Some(valued_spans());
    }
    let mut spans = Vec::with_capacity(list.len());
    for cand in list {
        match static_bound(cand) {
            Some(bound) => spans.push(Span2::point(bound)),
            None => return Some(valued_spans()),
        }
    }
    Some(spans)
}

fn sarg_like(pred: &Expr, expr: &Expr, pattern: &Expr, key: &Expr) -> Option<Spans2> {
    if !expr.equivalent_to(key) {
        return dependent_fallback(pred, key);
    }
    let Some(Value::String(pattern)) = pattern.static_value() else {
        return Some(valued_spans());
    };
    let (prefix, complete) = like_prefix(&pattern);
    if complete {
        return Some(vec![Span2::point(Expr::literal(prefix))]);
    }
    if prefix.is_empty() {
        // Leading wildcard: nothing to seek on.
        return Some(valued_spans());
    }
    // The span is exact only when the pattern is pure prefix-match; any
    // trailing structure needs a residual filter.
    let exact = pattern == format!("{prefix}%");
    let high = match crate::expression::prefix_successor(&prefix) {
        Some(succ) => vec![Expr::literal(succ)],
        None => Vec::new(),
    };
    Some(vec![Span2 {
        range: SpanRange {
            low: vec![Expr::literal(prefix)],
            high,
            inclusion: Inclusion::Low,
        },
        exact,
    }])
}

fn sarg_and(conjuncts: &[Expr], key: &Expr) -> Option<Spans2> {
    let mut combined: Option<Spans2> = None;
    for conjunct in conjuncts {
        let Some(spans) = sarg_for(conjunct, key) else {
            continue;
        };
        combined = Some(match combined {
            None => spans,
            Some(prev) => intersect_spans(prev, spans),
        });
    }
    combined
}

fn sarg_or(disjuncts: &[Expr], key: &Expr) -> Option<Spans2> {
    // Every disjunct must constrain the key, otherwise the OR as a whole
    // does not.
    let mut out: Spans2 = Vec::new();
    for disjunct in disjuncts {
        match sarg_for(disjunct, key) {
            Some(spans) => out.extend(spans),
            None => return dependent_fallback(&Expr::Or(disjuncts.to_vec()), key),
        }
    }
    Some(out)
}

/// Intersects two span sets pairwise, tightening bounds where both are
/// static. Pairs with provably empty intersections are dropped.
fn intersect_spans(a: Spans2, b: Spans2) -> Spans2 {
    let mut out = Vec::new();
    for left in &a {
        for right in &b {
            if let Some(merged) = intersect_pair(left, right) {
                out.push(merged);
            }
        }
    }
    if out.is_empty() {
        // Provably empty predicate; an empty exact point keeps the scan
        // trivially empty rather than unbounded.
        out.push(Span2 {
            range: SpanRange {
                low: vec![null_expr()],
                high: vec![null_expr()],
                inclusion: Inclusion::Neither,
            },
            exact: true,
        });
    }
    out
}

fn bound_value(exprs: &[Expr]) -> Option<Value> {
    exprs.first().and_then(Expr::static_value)
}

fn intersect_pair(a: &Span2, b: &Span2) -> Option<Span2> {
    use std::cmp::Ordering;

    // Pick the tighter low bound.
    let (low, low_inclusive) = match (bound_value(&a.range.low), bound_value(&b.range.low)) {
        (Some(x), Some(y)) => match x.collate(&y) {
            Ordering::Greater => (a.range.low.clone(), a.range.inclusion.includes_low()),
            Ordering::Less => (b.range.low.clone(), b.range.inclusion.includes_low()),
            Ordering::Equal => (
                a.range.low.clone(),
                a.range.inclusion.includes_low() && b.range.inclusion.includes_low(),
            ),
        },
        (Some(_), None) => (a.range.low.clone(), a.range.inclusion.includes_low()),
        (None, _) => (b.range.low.clone(), b.range.inclusion.includes_low()),
    };
    // Pick the tighter high bound.
    let (high, high_inclusive) = match (bound_value(&a.range.high), bound_value(&b.range.high)) {
        (Some(x), Some(y)) => match x.collate(&y) {
            Ordering::Less => (a.range.high.clone(), a.range.inclusion.includes_high()),
            Ordering::Greater => (b.range.high.clone(), b.range.inclusion.includes_high()),
            Ordering::Equal => (
                a.range.high.clone(),
                a.range.inclusion.includes_high() && b.range.inclusion.includes_high(),
            ),
        },
        (Some(_), None) => (a.range.high.clone(), a.range.inclusion.includes_high()),
        (None, _) => (b.range.high.clone(), b.range.inclusion.includes_high()),
    };

    // Drop provably empty ranges.
    if let (Some(lo), Some(hi)) = (bound_value(&low), bound_value(&high)) {
        match lo.collate(&hi) {
            Ordering::Greater => return None,
            Ordering::Equal if !(low_inclusive && high_inclusive) => return None,
            _ => {}
        }
    }

    let inclusion = match (low_inclusive && !low.is_empty(), high_inclusive && !high.is_empty()) {
        (true, true) => Inclusion::Both,
        (true, false) => Inclusion::Low,
        (false, true) => Inclusion::High,
        (false, false) => Inclusion::Neither,
    };
    Some(Span2 {
        range: SpanRange {
            low,
            high,
            inclusion,
        },
        exact: a.exact && b.exact,
    })
}

//! Post-parse semantic checks.

use crate::config::FeatureControls;
use crate::errors::{Error, Result};
use crate::expression::Expr;

use super::select::{Select, SetOpTree, Subselect};
use super::Statement;

/// Validates a statement after parsing and before formalisation.
///
/// With the passthrough feature control set the walk is skipped entirely;
/// reprepare paths use this since the text was checked when first prepared.
pub fn check(stmt: &Statement, controls: FeatureControls) -> Result<()> {
    if controls.has(FeatureControls::SEMANTICS_PASSTHROUGH) {
        return Ok(());
    }
    match stmt {
        Statement::Select(sel) => check_select(sel),
        Statement::Prepare { statement, .. } => check(statement, controls),
        Statement::Explain(inner) | Statement::Advise(inner) => check(inner, controls),
        Statement::Insert(ins) => {
            if ins.values.is_empty() {
                return Err(Error::Semantics {
                    reason: "INSERT requires at least one VALUES clause".into(),
                });
            }
            Ok(())
        }
        Statement::Upsert(ups) => {
            if ups.values.is_empty() {
                return Err(Error::Semantics {
                    reason: "UPSERT requires at least one VALUES clause".into(),
                });
            }
            Ok(())
        }
        Statement::Merge(m) => {
            if m.matched.is_none() && m.unmatched.is_none() {
                return Err(Error::Semantics {
                    reason: "MERGE requires at least one WHEN clause".into(),
                });
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn check_select(sel: &Select) -> Result<()> {
    check_body(&sel.body)
}

fn check_body(body: &SetOpTree) -> Result<()> {
    match body {
        SetOpTree::Subselect(sub) => check_subselect(sub),
        SetOpTree::SetOp { left, right, .. } => {
            check_body(left)?;
            check_body(right)
        }
    }
}

fn check_subselect(sub: &Subselect) -> Result<()> {
    if sub.projection.terms.is_empty() {
        return Err(Error::Semantics {
            reason: "projection cannot be empty".into(),
        });
    }
    if sub.projection.raw && sub.projection.terms.len() != 1 {
        return Err(Error::Semantics {
            reason: "RAW projection takes exactly one expression".into(),
        });
    }
    if let Some(pred) = &sub.where_pred {
        if contains_aggregate(pred) {
            return Err(Error::Semantics {
                reason: "aggregates are not allowed in WHERE".into(),
            });
        }
    }
    let has_aggregates = sub
        .projection
        .terms
        .iter()
        .filter_map(|t| t.expr.as_ref())
        .any(contains_aggregate);
    if has_aggregates && sub.group.is_none() && sub.projection.terms.len() > 1 {
        // Mixed aggregate and non-aggregate terms need GROUP BY.
        let mixed = sub
            .projection
            .terms
            .iter()
            .filter_map(|t| t.expr.as_ref())
            .any(|e| !contains_aggregate(e));
        if mixed {
            return Err(Error::Semantics {
                reason: "mixing aggregates and fields requires GROUP BY".into(),
            });
        }
    }
    Ok(())
}

fn contains_aggregate(expr: &Expr) -> bool {
    if matches!(expr, Expr::Aggregate { .. }) {
        return true;
    }
    expr.children().iter().any(|c| contains_aggregate(c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::{KeyspaceTerm, Projection};
    use crate::expression::AggKind;

    fn select_with_projection(projection: Projection) -> Statement {
        Statement::Select(Select::simple(
            KeyspaceTerm::new("default", "orders", None),
            None,
            projection,
        ))
    }

    #[test]
    fn aggregates_in_where_are_rejected() {
        let agg = Expr::Aggregate {
            kind: AggKind::Count,
            expr: None,
            distinct: false,
        };
        let stmt = Statement::Select(Select::simple(
            KeyspaceTerm::new("default", "orders", None),
            Some(agg),
            Projection::star(),
        ));
        assert_eq!(
            check(&stmt, FeatureControls::default()).unwrap_err().code(),
            3100
        );
    }

    #[test]
    fn passthrough_skips_the_walk() {
        let stmt = select_with_projection(Projection::terms(vec![]));
        assert!(check(&stmt, FeatureControls::default()).is_err());
        let pass = FeatureControls(FeatureControls::SEMANTICS_PASSTHROUGH);
        assert!(check(&stmt, pass).is_ok());
    }
}

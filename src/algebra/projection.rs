//! Projections and result terms.

use crate::expression::Expr;

/// Single projection term.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultTerm {
    /// Projected expression; `None` for a bare `*`.
    pub expr: Option<Expr>,
    /// Star marker: `*` or `alias.*`.
    pub star: bool,
    /// Explicit `AS` alias.
    pub as_alias: Option<String>,
    /// Derived alias filled in by [`Projection::set_aliases`].
    alias: String,
}

impl ResultTerm {
    /// Expression term with an optional explicit alias.
    pub fn expr(expr: Expr, as_alias: Option<&str>) -> Self {
        Self {
            expr: Some(expr),
            star: false,
            as_alias: as_alias.map(str::to_owned),
            alias: String::new(),
        }
    }

    /// Star term, optionally scoped to an expression (`alias.*`).
    pub fn star(expr: Option<Expr>) -> Self {
        Self {
            expr,
            star: true,
            as_alias: None,
            alias: String::new(),
        }
    }

    /// Output column name: the explicit alias, the expression's natural
    /// alias, or the derived `$n`.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Assigns this term's alias; returns the next anonymous ordinal.
    fn set_alias(&mut self, mut next: usize) -> usize {
        if self.star {
            return next;
        }
        if let Some(as_alias) = &self.as_alias {
            self.alias = as_alias.clone();
        } else if let Some(expr) = &self.expr {
            self.alias = expr.alias().to_owned();
        }
        if self.alias.is_empty() {
            self.alias = format!("${next}");
            next += 1;
        }
        next
    }
}

/// Projection clause: raw single expression or a list of terms.
#[derive(Clone, Debug, PartialEq)]
pub struct Projection {
    /// DISTINCT modifier.
    pub distinct: bool,
    /// RAW modifier: emit the bare value of the single term.
    pub raw: bool,
    /// Projection terms.
    pub terms: Vec<ResultTerm>,
}

impl Projection {
    /// Projection over a list of terms; derives anonymous aliases
    /// left-to-right.
    pub fn terms(terms: Vec<ResultTerm>) -> Self {
        let mut p = Self {
            distinct: false,
            raw: false,
            terms,
        };
        p.set_aliases();
        p
    }

    /// `SELECT RAW expr`.
    pub fn raw(expr: Expr) -> Self {
        let mut p = Self {
            distinct: false,
            raw: true,
            terms: vec![ResultTerm::expr(expr, None)],
        };
        p.set_aliases();
        p
    }

    /// `SELECT *`.
    pub fn star() -> Self {
        Self {
            distinct: false,
            raw: false,
            terms: vec![ResultTerm::star(None)],
        }
    }

    /// Marks the projection DISTINCT.
    pub fn with_distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Derives `$1, $2, …` aliases for anonymous non-star terms,
    /// left-to-right.
    pub fn set_aliases(&mut self) {
        let mut next = 1;
        for term in &mut self.terms {
            next = term.set_alias(next);
        }
    }

    /// Expressions referenced by the projection.
    pub fn collect_expressions<'a>(&'a self, out: &mut Vec<&'a Expr>) {
        out.extend(self.terms.iter().filter_map(|t| t.expr.as_ref()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{ArithOp, Expr};

    #[test]
    fn derived_aliases_skip_star_and_named_terms() {
        let p = Projection::terms(vec![
            ResultTerm::expr(
                Expr::Arith(
                    ArithOp::Add,
                    Box::new(Expr::literal(1.0)),
                    Box::new(Expr::literal(2.0)),
                ),
                None,
            ),
            ResultTerm::star(None),
            ResultTerm::expr(Expr::field(["o", "total"]), None),
            ResultTerm::expr(Expr::literal(9.0), Some("nine")),
            ResultTerm::expr(Expr::literal(0.0), None),
        ]);
        assert_eq!(p.terms[0].alias(), "$1");
        assert_eq!(p.terms[1].alias(), "");
        assert_eq!(p.terms[2].alias(), "total");
        assert_eq!(p.terms[3].alias(), "nine");
        assert_eq!(p.terms[4].alias(), "$2");
    }
}

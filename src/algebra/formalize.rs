//! Identifier formalisation.
//!
//! After parsing, field references are bare paths. Formalisation rewrites
//! every path so its head resolves to a binding in scope (FROM alias, LET
//! variable, ANY/EVERY binding) or to a field of the block's single
//! keyspace, in which case the alias is prepended. Unresolved heads are
//! semantic errors. LET variables are substituted by their bound
//! expressions.

use std::collections::HashSet;

use crate::errors::{Error, Result};
use crate::expression::{Binding, Expr};

use super::select::{FromTerm, KeyspaceTerm, Subselect};

/// Rewrites expressions so every identifier is resolved.
pub struct Formalizer {
    allowed: HashSet<String>,
    default_alias: Option<String>,
    lets: Vec<(String, Expr)>,
    /// Aliases visible from an enclosing query block. Resolving through
    /// these marks the block correlated.
    outer: HashSet<String>,
    used_outer: bool,
}

impl Formalizer {
    /// Formalizer for a DML statement over one keyspace.
    pub fn for_keyspace(ks: &KeyspaceTerm) -> Self {
        Self {
            allowed: std::iter::once(ks.alias().to_owned()).collect(),
            default_alias: Some(ks.alias().to_owned()),
            lets: Vec::new(),
            outer: HashSet::new(),
            used_outer: false,
        }
    }

    /// Formalizer for MERGE clauses: both the source and target aliases are
    /// in scope, and bare references resolve to the source row, which is
    /// what the merge actions evaluate against.
    pub fn for_merge(source: &KeyspaceTerm, target: &KeyspaceTerm) -> Self {
        Self {
            allowed: [source.alias().to_owned(), target.alias().to_owned()]
                .into_iter()
                .collect(),
            default_alias: Some(source.alias().to_owned()),
            lets: Vec::new(),
            outer: HashSet::new(),
            used_outer: false,
        }
    }

    /// Formalizer seeded from a subselect's own scope.
    pub fn for_subselect(sub: &Subselect) -> Self {
        let mut allowed: HashSet<String> = HashSet::new();
        let mut default_alias = None;
        if let Some(from) = &sub.from {
            for alias in from.aliases() {
                allowed.insert(alias.to_owned());
            }
            if let FromTerm::Keyspace(ks) = from {
                default_alias = Some(ks.alias().to_owned());
            }
        }
        Self {
            allowed,
            default_alias,
            lets: sub
                .let_bindings
                .iter()
                .map(|b| (b.variable.clone(), b.expr.clone()))
                .collect(),
            outer: HashSet::new(),
            used_outer: false,
        }
    }

    /// Adds an enclosing scope for correlation detection.
    pub fn with_outer(mut self, outer: HashSet<String>) -> Self {
        self.outer = outer;
        self
    }

    /// Whether resolution reached into the enclosing scope.
    pub fn used_outer(&self) -> bool {
        self.used_outer
    }

    /// Formalizes every clause of `sub` in place.
    pub fn run(&mut self, sub: &mut Subselect) -> Result<()> {
        // LET bindings may reference earlier LET bindings.
        let pending = std::mem::take(&mut self.lets);
        for (name, expr) in pending {
            let mapped = self.map(expr)?;
            self.lets.push((name, mapped));
        }

        if let Some(pred) = sub.where_pred.take() {
            sub.where_pred = Some(self.map(pred)?);
        }
        if let Some(group) = &mut sub.group {
            for by in &mut group.by {
                *by = self.map(std::mem::replace(by, Expr::literal(false)))?;
            }
            if let Some(having) = group.having.take() {
                group.having = Some(self.map(having)?);
            }
        }
        for term in &mut sub.projection.terms {
            if let Some(expr) = term.expr.take() {
                term.expr = Some(self.map(expr)?);
            }
        }
        sub.projection.set_aliases();
        sub.correlated = self.used_outer;
        Ok(())
    }

    /// Rewrites one expression tree.
    pub fn map(&mut self, expr: Expr) -> Result<Expr> {
        self.map_scoped(expr, &HashSet::new())
    }

    fn map_scoped(&mut self, expr: Expr, locals: &HashSet<String>) -> Result<Expr> {
        match expr {
            Expr::Field(path) => self.resolve_field(path, locals),
            Expr::Any {
                bindings,
                satisfies,
            } => {
                let (bindings, satisfies) = self.map_collection(bindings, *satisfies, locals)?;
                Ok(Expr::Any {
                    bindings,
                    satisfies: Box::new(satisfies),
                })
            }
            Expr::Every {
                bindings,
                satisfies,
            } => {
                let (bindings, satisfies) = self.map_collection(bindings, *satisfies, locals)?;
                Ok(Expr::Every {
                    bindings,
                    satisfies: Box::new(satisfies),
                })
            }
            other => map_children(other, &mut |child| self.map_scoped(child, locals)),
        }
    }

    fn map_collection(
        &mut self,
        bindings: Vec<Binding>,
        satisfies: Expr,
        locals: &HashSet<String>,
    ) -> Result<(Vec<Binding>, Expr)> {
        let mut inner = locals.clone();
        let mut mapped = Vec::with_capacity(bindings.len());
        for b in bindings {
            let source = self.map_scoped(*b.source, &inner)?;
            inner.insert(b.variable.clone());
            mapped.push(Binding {
                variable: b.variable,
                source: Box::new(source),
            });
        }
        let satisfies = self.map_scoped(satisfies, &inner)?;
        Ok((mapped, satisfies))
    }

    fn resolve_field(&mut self, path: Vec<String>, locals: &HashSet<String>) -> Result<Expr> {
        let head = match path.first() {
            Some(h) => h.as_str(),
            None => {
                return Err(Error::Semantics {
                    reason: "empty identifier path".into(),
                })
            }
        };
        if locals.contains(head) || self.allowed.contains(head) {
            return Ok(Expr::Field(path));
        }
        if let Some((_, bound)) = self.lets.iter().find(|(name, _)| name == head) {
            if path.len() > 1 {
                return Err(Error::Semantics {
                    reason: format!("cannot navigate into LET binding {head}"),
                });
            }
            return Ok(bound.clone());
        }
        if let Some(alias) = &self.default_alias {
            let mut qualified = Vec::with_capacity(path.len() + 1);
            qualified.push(alias.clone());
            qualified.extend(path);
            return Ok(Expr::Field(qualified));
        }
        if self.outer.contains(head) {
            // Resolves in the enclosing block: legal, but correlated.
            self.used_outer = true;
            return Ok(Expr::Field(path));
        }
        Err(Error::Semantics {
            reason: format!("unresolved identifier: {head}"),
        })
    }
}

fn map_children(expr: Expr, f: &mut impl FnMut(Expr) -> Result<Expr>) -> Result<Expr> {
    Ok(match expr {
        Expr::Literal(_)
        | Expr::Field(_)
        | Expr::PositionalParam(_)
        | Expr::NamedParam(_) => expr,
        Expr::Arith(op, a, b) => Expr::Arith(op, Box::new(f(*a)?), Box::new(f(*b)?)),
        Expr::Neg(a) => Expr::Neg(Box::new(f(*a)?)),
        Expr::Cmp(op, a, b) => Expr::Cmp(op, Box::new(f(*a)?), Box::new(f(*b)?)),
        Expr::Between { expr, low, high } => Expr::Between {
            expr: Box::new(f(*expr)?),
            low: Box::new(f(*low)?),
            high: Box::new(f(*high)?),
        },
        Expr::Like { expr, pattern } => Expr::Like {
            expr: Box::new(f(*expr)?),
            pattern: Box::new(f(*pattern)?),
        },
        Expr::In { expr, list } => Expr::In {
            expr: Box::new(f(*expr)?),
            list: list.into_iter().map(&mut *f).collect::<Result<_>>()?,
        },
        Expr::IsNull(a) => Expr::IsNull(Box::new(f(*a)?)),
        Expr::IsNotNull(a) => Expr::IsNotNull(Box::new(f(*a)?)),
        Expr::IsMissing(a) => Expr::IsMissing(Box::new(f(*a)?)),
        Expr::IsValued(a) => Expr::IsValued(Box::new(f(*a)?)),
        Expr::And(items) => Expr::And(items.into_iter().map(&mut *f).collect::<Result<_>>()?),
        Expr::Or(items) => Expr::Or(items.into_iter().map(&mut *f).collect::<Result<_>>()?),
        Expr::Not(a) => Expr::Not(Box::new(f(*a)?)),
        Expr::CondNum(kind, items) => {
            Expr::CondNum(kind, items.into_iter().map(&mut *f).collect::<Result<_>>()?)
        }
        Expr::Func { name, args } => Expr::Func {
            name,
            args: args.into_iter().map(&mut *f).collect::<Result<_>>()?,
        },
        Expr::Aggregate {
            kind,
            expr,
            distinct,
        } => Expr::Aggregate {
            kind,
            expr: match expr {
                Some(e) => Some(Box::new(f(*e)?)),
                None => None,
            },
            distinct,
        },
        Expr::Any { .. } | Expr::Every { .. } => unreachable!("handled by map_scoped"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::{Projection, Select, Statement};
    use crate::expression::CmpOp;

    fn select(pred: Expr) -> Statement {
        Statement::Select(Select::simple(
            KeyspaceTerm::new("default", "orders", Some("o".into())),
            Some(pred),
            Projection::star(),
        ))
    }

    #[test]
    fn bare_fields_get_qualified() {
        let mut stmt = select(Expr::Cmp(
            CmpOp::Eq,
            Box::new(Expr::field(["total"])),
            Box::new(Expr::literal(5.0)),
        ));
        stmt.formalize().unwrap();
        let exprs = stmt.expressions();
        let pred = exprs[0];
        assert!(pred.depends_on(&Expr::field(["o", "total"])));
    }

    #[test]
    fn qualified_fields_are_untouched() {
        let mut stmt = select(Expr::Cmp(
            CmpOp::Eq,
            Box::new(Expr::field(["o", "total"])),
            Box::new(Expr::literal(5.0)),
        ));
        stmt.formalize().unwrap();
        assert!(stmt.expressions()[0].depends_on(&Expr::field(["o", "total"])));
    }

    #[test]
    fn any_binding_variables_stay_local() {
        let any = Expr::Any {
            bindings: vec![Binding {
                variable: "t".into(),
                source: Box::new(Expr::field(["tags"])),
            }],
            satisfies: Box::new(Expr::Cmp(
                CmpOp::Eq,
                Box::new(Expr::field(["t"])),
                Box::new(Expr::literal("red")),
            )),
        };
        let mut stmt = select(any);
        stmt.formalize().unwrap();
        let pred = stmt.expressions()[0];
        match pred {
            Expr::Any {
                bindings,
                satisfies,
            } => {
                // Source is qualified, the bound variable is not.
                assert_eq!(*bindings[0].source, Expr::field(["o", "tags"]));
                assert!(satisfies.depends_on(&Expr::field(["t"])));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unresolved_identifier_errors_without_default_alias() {
        let mut f = Formalizer {
            allowed: HashSet::new(),
            default_alias: None,
            lets: Vec::new(),
            outer: HashSet::new(),
            used_outer: false,
        };
        let err = f.map(Expr::field(["ghost"])).unwrap_err();
        assert_eq!(err.code(), 3100);
    }
}

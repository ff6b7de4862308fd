//! SELECT statements: set-operation trees over subselects.

use crate::errors::Result;
use crate::expression::Expr;

use super::formalize::Formalizer;
use super::projection::Projection;

/// A namespace-qualified keyspace reference with an optional alias.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyspaceTerm {
    /// Namespace (logical container of keyspaces).
    pub namespace: String,
    /// Keyspace name.
    pub keyspace: String,
    /// Explicit alias, when given.
    pub as_alias: Option<String>,
    /// `USE INDEX` hints restricting planner index choice.
    pub hint_indexes: Vec<String>,
}

impl KeyspaceTerm {
    /// Builds a keyspace term.
    pub fn new(
        namespace: impl Into<String>,
        keyspace: impl Into<String>,
        as_alias: Option<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            keyspace: keyspace.into(),
            as_alias,
            hint_indexes: Vec::new(),
        }
    }

    /// Adds a `USE INDEX` hint.
    pub fn with_hint(mut self, index: impl Into<String>) -> Self {
        self.hint_indexes.push(index.into());
        self
    }

    /// Binding alias: the explicit alias or the keyspace name.
    pub fn alias(&self) -> &str {
        self.as_alias.as_deref().unwrap_or(&self.keyspace)
    }

    /// Full path for user-facing messages.
    pub fn path_string(&self) -> String {
        format!("{}:{}", self.namespace, self.keyspace)
    }
}

/// LET binding: a named expression available to later clauses.
#[derive(Clone, Debug, PartialEq)]
pub struct LetBinding {
    /// Variable name.
    pub variable: String,
    /// Bound expression.
    pub expr: Expr,
}

/// FROM clause term.
#[derive(Clone, Debug, PartialEq)]
pub enum FromTerm {
    /// Plain keyspace scan.
    Keyspace(KeyspaceTerm),
    /// Join between two terms on a boolean condition.
    Join {
        /// Left input.
        left: Box<FromTerm>,
        /// Right keyspace.
        right: KeyspaceTerm,
        /// Join condition.
        on: Expr,
        /// Whether unmatched left rows survive with MISSING right side.
        outer: bool,
    },
    /// Nest: like a join but the right side aggregates into an array.
    Nest {
        /// Left input.
        left: Box<FromTerm>,
        /// Right keyspace.
        right: KeyspaceTerm,
        /// Nest condition.
        on: Expr,
        /// Whether unmatched left rows survive with an empty array.
        outer: bool,
    },
    /// Unnest: flattens an array-valued expression of the left term.
    Unnest {
        /// Left input.
        left: Box<FromTerm>,
        /// Array-valued expression over the left term.
        expr: Expr,
        /// Alias for each flattened element.
        alias: String,
        /// Whether rows with empty arrays survive with MISSING.
        outer: bool,
    },
    /// Derived table: a parenthesised subquery with an alias.
    Subquery {
        /// Inner select.
        select: Box<Select>,
        /// Alias the subquery's rows bind to.
        alias: String,
    },
}

impl FromTerm {
    /// Aliases this term contributes to the scope, leftmost first.
    pub fn aliases(&self) -> Vec<&str> {
        match self {
            FromTerm::Keyspace(ks) => vec![ks.alias()],
            FromTerm::Join { left, right, .. } | FromTerm::Nest { left, right, .. } => {
                let mut out = left.aliases();
                out.push(right.alias());
                out
            }
            FromTerm::Unnest { left, alias, .. } => {
                let mut out = left.aliases();
                out.push(alias);
                out
            }
            FromTerm::Subquery { alias, .. } => vec![alias],
        }
    }

    /// Leftmost keyspace term, the scan driver.
    pub fn primary_term(&self) -> Option<&KeyspaceTerm> {
        match self {
            FromTerm::Keyspace(ks) => Some(ks),
            FromTerm::Join { left, .. }
            | FromTerm::Nest { left, .. }
            | FromTerm::Unnest { left, .. } => left.primary_term(),
            FromTerm::Subquery { .. } => None,
        }
    }
}

/// GROUP BY clause.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupBy {
    /// Grouping keys.
    pub by: Vec<Expr>,
    /// HAVING predicate over grouped rows.
    pub having: Option<Expr>,
}

/// Single ORDER BY term.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderTerm {
    /// Sort key expression.
    pub expr: Expr,
    /// Descending order when set.
    pub descending: bool,
}

/// ORDER BY clause.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    /// Sort terms, outermost first.
    pub terms: Vec<OrderTerm>,
}

/// Set-operation combinators.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SetOpKind {
    /// UNION / UNION ALL.
    Union,
    /// INTERSECT / INTERSECT ALL.
    Intersect,
    /// EXCEPT / EXCEPT ALL.
    Except,
}

/// Body of a SELECT: a single subselect or a set-op over two bodies.
#[derive(Clone, Debug, PartialEq)]
pub enum SetOpTree {
    /// Leaf subselect.
    Subselect(Subselect),
    /// Set operation over two subtrees.
    SetOp {
        /// Combinator kind.
        kind: SetOpKind,
        /// Whether duplicates are retained (ALL).
        all: bool,
        /// Left subtree.
        left: Box<SetOpTree>,
        /// Right subtree.
        right: Box<SetOpTree>,
    },
}

impl SetOpTree {
    fn formalize(&mut self, outer: &std::collections::HashSet<String>) -> Result<()> {
        match self {
            SetOpTree::Subselect(sub) => sub.formalize(outer),
            SetOpTree::SetOp { left, right, .. } => {
                left.formalize(outer)?;
                right.formalize(outer)
            }
        }
    }
}

/// One FROM/LET/WHERE/GROUP/projection block.
#[derive(Clone, Debug, PartialEq)]
pub struct Subselect {
    /// FROM clause, absent for `SELECT <expr>` without a source.
    pub from: Option<FromTerm>,
    /// LET bindings.
    pub let_bindings: Vec<LetBinding>,
    /// WHERE predicate.
    pub where_pred: Option<Expr>,
    /// GROUP BY clause.
    pub group: Option<GroupBy>,
    /// Projection.
    pub projection: Projection,
    /// Conservative correlation marker, set during formalisation: true when
    /// the block references identifiers it does not bind itself.
    pub correlated: bool,
}

impl Subselect {
    /// Builds a subselect over an optional keyspace with a WHERE predicate.
    pub fn new(from: Option<FromTerm>, where_pred: Option<Expr>, projection: Projection) -> Self {
        Self {
            from,
            let_bindings: Vec::new(),
            where_pred,
            group: None,
            projection,
            correlated: false,
        }
    }

    pub(super) fn formalize(&mut self, outer: &std::collections::HashSet<String>) -> Result<()> {
        let mut f = Formalizer::for_subselect(self).with_outer(outer.clone());
        if let Some(from) = self.from.as_mut() {
            // Nested derived tables see this block's aliases as their
            // enclosing scope; resolving through them marks correlation.
            let mut inner_outer = outer.clone();
            for alias in from.aliases() {
                inner_outer.insert(alias.to_owned());
            }
            if let FromTerm::Subquery { select, .. } = from {
                select.formalize_with_outer(&inner_outer)?;
            }
        }
        f.run(self)
    }

    pub(super) fn collect_expressions<'a>(&'a self, out: &mut Vec<&'a Expr>) {
        fn from_exprs<'a>(term: &'a FromTerm, out: &mut Vec<&'a Expr>) {
            match term {
                FromTerm::Keyspace(_) => {}
                FromTerm::Join { left, on, .. } | FromTerm::Nest { left, on, .. } => {
                    from_exprs(left, out);
                    out.push(on);
                }
                FromTerm::Unnest { left, expr, .. } => {
                    from_exprs(left, out);
                    out.push(expr);
                }
                FromTerm::Subquery { select, .. } => select.collect_expressions(out),
            }
        }
        if let Some(from) = &self.from {
            from_exprs(from, out);
        }
        for b in &self.let_bindings {
            out.push(&b.expr);
        }
        if let Some(w) = &self.where_pred {
            out.push(w);
        }
        if let Some(g) = &self.group {
            out.extend(g.by.iter());
            if let Some(h) = &g.having {
                out.push(h);
            }
        }
        self.projection.collect_expressions(out);
    }
}

/// Full SELECT statement.
#[derive(Clone, Debug, PartialEq)]
pub struct Select {
    /// Set-op tree body.
    pub body: SetOpTree,
    /// ORDER BY clause.
    pub order: Option<OrderBy>,
    /// OFFSET expression.
    pub offset: Option<Expr>,
    /// LIMIT expression.
    pub limit: Option<Expr>,
}

impl Select {
    /// Builds a single-subselect SELECT.
    pub fn simple(keyspace: KeyspaceTerm, where_pred: Option<Expr>, projection: Projection) -> Self {
        Self {
            body: SetOpTree::Subselect(Subselect::new(
                Some(FromTerm::Keyspace(keyspace)),
                where_pred,
                projection,
            )),
            order: None,
            offset: None,
            limit: None,
        }
    }

    /// Builds a sourceless `SELECT <expr>`.
    pub fn expression(expr: Expr) -> Self {
        Self {
            body: SetOpTree::Subselect(Subselect::new(
                None,
                None,
                Projection::terms(vec![super::projection::ResultTerm::expr(expr, None)]),
            )),
            order: None,
            offset: None,
            limit: None,
        }
    }

    pub(super) fn formalize(&mut self) -> Result<()> {
        self.formalize_with_outer(&std::collections::HashSet::new())
    }

    /// Formalizes with an enclosing scope; nested blocks that resolve names
    /// through `outer` are marked correlated.
    pub fn formalize_with_outer(
        &mut self,
        outer: &std::collections::HashSet<String>,
    ) -> Result<()> {
        self.body.formalize(outer)?;
        // ORDER BY, OFFSET, and LIMIT resolve in the scope of a
        // single-block body; set-op bodies reference output columns, which
        // need no qualification.
        if let SetOpTree::Subselect(sub) = &self.body {
            let mut f = Formalizer::for_subselect(sub).with_outer(outer.clone());
            if let Some(order) = &mut self.order {
                for term in &mut order.terms {
                    let expr = std::mem::replace(&mut term.expr, Expr::Literal(false.into()));
                    term.expr = f.map(expr)?;
                }
            }
            if let Some(offset) = self.offset.take() {
                self.offset = Some(f.map(offset)?);
            }
            if let Some(limit) = self.limit.take() {
                self.limit = Some(f.map(limit)?);
            }
        }
        Ok(())
    }

    pub(super) fn collect_expressions<'a>(&'a self, out: &mut Vec<&'a Expr>) {
        fn body<'a>(tree: &'a SetOpTree, out: &mut Vec<&'a Expr>) {
            match tree {
                SetOpTree::Subselect(sub) => sub.collect_expressions(out),
                SetOpTree::SetOp { left, right, .. } => {
                    body(left, out);
                    body(right, out);
                }
            }
        }
        body(&self.body, out);
        if let Some(order) = &self.order {
            out.extend(order.terms.iter().map(|t| &t.expr));
        }
        if let Some(o) = &self.offset {
            out.push(o);
        }
        if let Some(l) = &self.limit {
            out.push(l);
        }
    }
}

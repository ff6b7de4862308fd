//! Immutable algebraic representation of parsed statements.
//!
//! The parser for the dialect is a collaborator that produces these trees;
//! the engine only transforms them. After [`formalize`](Statement::formalize)
//! every identifier reference resolves to a binding or a qualified keyspace
//! field, and statements can be handed to the planner.

use crate::errors::{Error, Result};
use crate::expression::Expr;

mod dml;
mod formalize;
mod projection;
mod select;
mod semantics;

pub use dml::{Delete, Insert, Merge, MergeAction, SetClause, Update, Upsert};
pub use formalize::Formalizer;
pub use projection::{Projection, ResultTerm};
pub use select::{
    FromTerm, GroupBy, KeyspaceTerm, LetBinding, OrderBy, OrderTerm, Select, SetOpKind,
    SetOpTree, Subselect,
};
pub use semantics::check as semantic_check;

/// Top-level statement variants.
#[derive(Clone, Debug, PartialEq)]
pub enum Statement {
    /// `SELECT …`
    Select(Select),
    /// `INSERT INTO …`
    Insert(Insert),
    /// `UPSERT INTO …`
    Upsert(Upsert),
    /// `DELETE FROM …`
    Delete(Delete),
    /// `UPDATE …`
    Update(Update),
    /// `MERGE INTO …`
    Merge(Merge),
    /// `PREPARE [name] [FORCE] AS statement`
    Prepare {
        /// User-supplied name; `None` for anonymous prepares.
        name: Option<String>,
        /// FORCE modifier: replan even when a cached plan exists.
        force: bool,
        /// The statement being prepared.
        statement: Box<Statement>,
        /// Original text of the inner statement.
        text: String,
    },
    /// `EXECUTE name`
    Execute {
        /// Prepared reference: a name string or a decoded plan object.
        prepared: Expr,
    },
    /// `EXPLAIN statement`
    Explain(Box<Statement>),
    /// `ADVISE statement`
    Advise(Box<Statement>),
    /// `START TRANSACTION`
    StartTransaction,
    /// `COMMIT`
    CommitTransaction,
    /// `ROLLBACK`
    RollbackTransaction,
}

impl Statement {
    /// Statement type name as surfaced in request metadata.
    pub fn type_name(&self) -> &'static str {
        match self {
            Statement::Select(_) => "SELECT",
            Statement::Insert(_) => "INSERT",
            Statement::Upsert(_) => "UPSERT",
            Statement::Delete(_) => "DELETE",
            Statement::Update(_) => "UPDATE",
            Statement::Merge(_) => "MERGE",
            Statement::Prepare { .. } => "PREPARE",
            Statement::Execute { .. } => "EXECUTE",
            Statement::Explain(_) => "EXPLAIN",
            Statement::Advise(_) => "ADVISE",
            Statement::StartTransaction => "START_TRANSACTION",
            Statement::CommitTransaction => "COMMIT",
            Statement::RollbackTransaction => "ROLLBACK",
        }
    }

    /// Whether executing the statement cannot mutate documents.
    pub fn readonly(&self) -> bool {
        match self {
            Statement::Select(_)
            | Statement::Explain(_)
            | Statement::Advise(_)
            | Statement::Execute { .. } => true,
            Statement::Prepare { statement, .. } => statement.readonly(),
            _ => false,
        }
    }

    /// Number of placeholder parameters referenced anywhere in the
    /// statement. Auto-prepare refuses parameterised statements.
    pub fn params(&self) -> usize {
        let mut max_positional = 0usize;
        let mut named = std::collections::HashSet::new();
        for expr in self.expressions() {
            count_params(expr, &mut max_positional, &mut named);
        }
        max_positional + named.len()
    }

    /// Every expression reachable from the statement, in no particular
    /// order.
    pub fn expressions(&self) -> Vec<&Expr> {
        let mut out = Vec::new();
        self.collect_expressions(&mut out);
        out
    }

    fn collect_expressions<'a>(&'a self, out: &mut Vec<&'a Expr>) {
        match self {
            Statement::Select(s) => s.collect_expressions(out),
            Statement::Insert(i) => i.collect_expressions(out),
            Statement::Upsert(u) => u.collect_expressions(out),
            Statement::Delete(d) => d.collect_expressions(out),
            Statement::Update(u) => u.collect_expressions(out),
            Statement::Merge(m) => m.collect_expressions(out),
            Statement::Prepare { statement, .. } => statement.collect_expressions(out),
            Statement::Execute { prepared } => out.push(prepared),
            Statement::Explain(inner) | Statement::Advise(inner) => {
                inner.collect_expressions(out)
            }
            Statement::StartTransaction
            | Statement::CommitTransaction
            | Statement::RollbackTransaction => {}
        }
    }

    /// Resolves every identifier to a binding or qualified keyspace field.
    /// Fails with a semantic error on unresolved names.
    pub fn formalize(&mut self) -> Result<()> {
        match self {
            Statement::Select(s) => s.formalize(),
            Statement::Insert(i) => i.formalize(),
            Statement::Upsert(u) => u.formalize(),
            Statement::Delete(d) => d.formalize(),
            Statement::Update(u) => u.formalize(),
            Statement::Merge(m) => m.formalize(),
            Statement::Prepare { statement, .. } => statement.formalize(),
            Statement::Explain(inner) | Statement::Advise(inner) => inner.formalize(),
            Statement::Execute { .. }
            | Statement::StartTransaction
            | Statement::CommitTransaction
            | Statement::RollbackTransaction => Ok(()),
        }
    }
}

fn count_params<'a>(
    expr: &'a Expr,
    max_positional: &mut usize,
    named: &mut std::collections::HashSet<&'a str>,
) {
    match expr {
        Expr::PositionalParam(i) => *max_positional = (*max_positional).max(*i),
        Expr::NamedParam(name) => {
            named.insert(name.as_str());
        }
        _ => {}
    }
    for child in expr.children() {
        count_params(child, max_positional, named);
    }
}

/// Parser collaborator: the dialect grammar itself is outside the core.
///
/// The prepared cache re-parses statement text during reprepare; deployments
/// plug their parser in through this trait.
pub trait Parser: Send + Sync {
    /// Parses `text` into a statement.
    fn parse(&self, text: &str) -> Result<Statement>;
}

/// Parser stub that rejects everything; useful where reprepare is
/// impossible by construction.
pub struct NoParser;

impl Parser for NoParser {
    fn parse(&self, _text: &str) -> Result<Statement> {
        Err(Error::Reprepare {
            reason: "no parser configured".into(),
        })
    }
}

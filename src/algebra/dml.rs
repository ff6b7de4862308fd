//! DML statements: INSERT, UPSERT, DELETE, UPDATE, MERGE.

use crate::errors::Result;
use crate::expression::Expr;

use super::formalize::Formalizer;
use super::select::KeyspaceTerm;

/// `INSERT INTO keyspace (KEY k, VALUE v), …`
#[derive(Clone, Debug, PartialEq)]
pub struct Insert {
    /// Target keyspace.
    pub keyspace: KeyspaceTerm,
    /// Key/value expression pairs.
    pub values: Vec<(Expr, Expr)>,
}

impl Insert {
    /// Builds an insert over literal key/value pairs.
    pub fn new(keyspace: KeyspaceTerm, values: Vec<(Expr, Expr)>) -> Self {
        Self { keyspace, values }
    }

    pub(super) fn formalize(&mut self) -> Result<()> {
        // Values clauses evaluate against parameters only; nothing to
        // resolve.
        Ok(())
    }

    pub(super) fn collect_expressions<'a>(&'a self, out: &mut Vec<&'a Expr>) {
        for (k, v) in &self.values {
            out.push(k);
            out.push(v);
        }
    }
}

/// `UPSERT INTO keyspace (KEY k, VALUE v), …`
#[derive(Clone, Debug, PartialEq)]
pub struct Upsert {
    /// Target keyspace.
    pub keyspace: KeyspaceTerm,
    /// Key/value expression pairs.
    pub values: Vec<(Expr, Expr)>,
}

impl Upsert {
    /// Builds an upsert over literal key/value pairs.
    pub fn new(keyspace: KeyspaceTerm, values: Vec<(Expr, Expr)>) -> Self {
        Self { keyspace, values }
    }

    pub(super) fn formalize(&mut self) -> Result<()> {
        Ok(())
    }

    pub(super) fn collect_expressions<'a>(&'a self, out: &mut Vec<&'a Expr>) {
        for (k, v) in &self.values {
            out.push(k);
            out.push(v);
        }
    }
}

/// `DELETE FROM keyspace WHERE … LIMIT …`
#[derive(Clone, Debug, PartialEq)]
pub struct Delete {
    /// Target keyspace.
    pub keyspace: KeyspaceTerm,
    /// Row filter.
    pub where_pred: Option<Expr>,
    /// Mutation cap.
    pub limit: Option<Expr>,
}

impl Delete {
    /// Builds a delete.
    pub fn new(keyspace: KeyspaceTerm, where_pred: Option<Expr>, limit: Option<Expr>) -> Self {
        Self {
            keyspace,
            where_pred,
            limit,
        }
    }

    pub(super) fn formalize(&mut self) -> Result<()> {
        let mut f = Formalizer::for_keyspace(&self.keyspace);
        if let Some(pred) = self.where_pred.take() {
            self.where_pred = Some(f.map(pred)?);
        }
        Ok(())
    }

    pub(super) fn collect_expressions<'a>(&'a self, out: &mut Vec<&'a Expr>) {
        out.extend(self.where_pred.iter());
        out.extend(self.limit.iter());
    }
}

/// One `SET path = expr` assignment.
#[derive(Clone, Debug, PartialEq)]
pub struct SetClause {
    /// Path within the document, excluding the keyspace alias.
    pub path: Vec<String>,
    /// New value.
    pub value: Expr,
}

/// `UPDATE keyspace SET … UNSET … WHERE … LIMIT …`
#[derive(Clone, Debug, PartialEq)]
pub struct Update {
    /// Target keyspace.
    pub keyspace: KeyspaceTerm,
    /// SET assignments.
    pub set: Vec<SetClause>,
    /// UNSET paths.
    pub unset: Vec<Vec<String>>,
    /// Row filter.
    pub where_pred: Option<Expr>,
    /// Mutation cap.
    pub limit: Option<Expr>,
}

impl Update {
    /// Builds an update.
    pub fn new(
        keyspace: KeyspaceTerm,
        set: Vec<SetClause>,
        where_pred: Option<Expr>,
        limit: Option<Expr>,
    ) -> Self {
        Self {
            keyspace,
            set,
            unset: Vec::new(),
            where_pred,
            limit,
        }
    }

    pub(super) fn formalize(&mut self) -> Result<()> {
        let mut f = Formalizer::for_keyspace(&self.keyspace);
        if let Some(pred) = self.where_pred.take() {
            self.where_pred = Some(f.map(pred)?);
        }
        for clause in &mut self.set {
            let value = std::mem::replace(&mut clause.value, Expr::Literal(crate::value::Value::Null));
            clause.value = f.map(value)?;
        }
        Ok(())
    }

    pub(super) fn collect_expressions<'a>(&'a self, out: &mut Vec<&'a Expr>) {
        out.extend(self.set.iter().map(|c| &c.value));
        out.extend(self.where_pred.iter());
        out.extend(self.limit.iter());
    }
}

/// Action taken by MERGE for a matched or unmatched source row.
#[derive(Clone, Debug, PartialEq)]
pub enum MergeAction {
    /// Update the matched target document.
    Update(Vec<SetClause>),
    /// Insert a new document built from the source row.
    Insert(Expr),
    /// Delete the matched target document.
    Delete,
}

/// `MERGE INTO target USING source ON KEY key WHEN …`
#[derive(Clone, Debug, PartialEq)]
pub struct Merge {
    /// Target keyspace.
    pub keyspace: KeyspaceTerm,
    /// Source keyspace feeding the merge.
    pub source: KeyspaceTerm,
    /// Expression over source rows yielding the target key.
    pub on_key: Expr,
    /// Action for matched rows.
    pub matched: Option<MergeAction>,
    /// Action for unmatched rows.
    pub unmatched: Option<MergeAction>,
}

impl Merge {
    pub(super) fn formalize(&mut self) -> Result<()> {
        let mut f = Formalizer::for_merge(&self.source, &self.keyspace);
        let on_key = std::mem::replace(&mut self.on_key, Expr::Literal(crate::value::Value::Null));
        self.on_key = f.map(on_key)?;
        for action in self.matched.iter_mut().chain(self.unmatched.iter_mut()) {
            match action {
                MergeAction::Update(set) => {
                    for clause in set {
                        let value = std::mem::replace(
                            &mut clause.value,
                            Expr::Literal(crate::value::Value::Null),
                        );
                        clause.value = f.map(value)?;
                    }
                }
                MergeAction::Insert(expr) => {
                    let value =
                        std::mem::replace(expr, Expr::Literal(crate::value::Value::Null));
                    *expr = f.map(value)?;
                }
                MergeAction::Delete => {}
            }
        }
        Ok(())
    }

    pub(super) fn collect_expressions<'a>(&'a self, out: &mut Vec<&'a Expr>) {
        out.push(&self.on_key);
        for action in self.matched.iter().chain(self.unmatched.iter()) {
            match action {
                MergeAction::Update(set) => out.extend(set.iter().map(|c| &c.value)),
                MergeAction::Insert(e) => out.push(e),
                MergeAction::Delete => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::ArithOp;

    fn merge() -> Merge {
        Merge {
            keyspace: KeyspaceTerm::new("default", "orders", Some("t".into())),
            source: KeyspaceTerm::new("default", "updates", Some("s".into())),
            on_key: Expr::field(["key"]),
            matched: Some(MergeAction::Update(vec![SetClause {
                path: vec!["amount".into()],
                value: Expr::Arith(
                    ArithOp::Add,
                    Box::new(Expr::field(["amount"])),
                    Box::new(Expr::literal(1.0)),
                ),
            }])),
            unmatched: Some(MergeAction::Insert(Expr::field(["payload"]))),
        }
    }

    #[test]
    fn merge_formalizes_action_expressions() {
        let mut m = merge();
        m.formalize().unwrap();
        assert_eq!(m.on_key, Expr::field(["s", "key"]));
        match m.matched.as_ref().unwrap() {
            MergeAction::Update(set) => {
                // Bare references in SET values resolve to the source row.
                assert!(set[0].value.depends_on(&Expr::field(["s", "amount"])));
            }
            other => panic!("unexpected action {other:?}"),
        }
        match m.unmatched.as_ref().unwrap() {
            MergeAction::Insert(e) => assert_eq!(*e, Expr::field(["s", "payload"])),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn merge_keeps_qualified_source_and_target_references() {
        let mut m = merge();
        m.matched = Some(MergeAction::Update(vec![SetClause {
            path: vec!["note".into()],
            value: Expr::field(["t", "note"]),
        }]));
        m.unmatched = Some(MergeAction::Insert(Expr::field(["s"])));
        m.formalize().unwrap();
        match m.matched.as_ref().unwrap() {
            MergeAction::Update(set) => assert_eq!(set[0].value, Expr::field(["t", "note"])),
            other => panic!("unexpected action {other:?}"),
        }
        match m.unmatched.as_ref().unwrap() {
            MergeAction::Insert(e) => assert_eq!(*e, Expr::field(["s"])),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn update_set_values_resolve_against_the_document() {
        let mut upd = Update::new(
            KeyspaceTerm::new("default", "orders", Some("o".into())),
            vec![SetClause {
                path: vec!["total".into()],
                value: Expr::field(["total"]),
            }],
            None,
            None,
        );
        upd.formalize().unwrap();
        assert_eq!(upd.set[0].value, Expr::field(["o", "total"]));
    }

    #[test]
    fn merge_delete_has_nothing_to_resolve() {
        let mut m = merge();
        m.matched = Some(MergeAction::Delete);
        m.unmatched = None;
        m.formalize().unwrap();
        assert_eq!(m.matched, Some(MergeAction::Delete));
    }
}

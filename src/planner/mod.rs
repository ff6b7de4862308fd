//! Query planner: index selection, span construction, and plan emission.
//!
//! The planner takes a semantically valid, formalised statement plus live
//! datastore metadata and emits an operator tree that is semantically
//! equivalent, uses indexes where they help, and preserves pushed-down
//! offset/limit/order whenever that is safe. When a push-down is rejected
//! the planner falls back to standalone Order/Offset/Limit operators.

use std::sync::Arc;

use tracing::debug;

use crate::algebra::{
    Delete, FromTerm, GroupBy, Insert, KeyspaceTerm, Merge, MergeAction, OrderBy, Projection,
    Select, SetOpKind, SetOpTree, Statement, Subselect, Update, Upsert,
};
use crate::config::FeatureControls;
use crate::datastore::{Datastore, Index, IndexState};
use crate::errors::{Error, Result};
use crate::expression::{CmpOp, Expr};
use crate::plan::{
    spans_exact, valued_spans, Cost, IndexProjection, InsertPair, KeyspaceRef, Operator,
    Prepared, ProjectTerm, SortTerm, Spans2, UpdateSet,
};

mod cost;
mod sarg;

pub use cost::{CostModel, HeuristicCostModel};
pub use sarg::sarg_for;

/// Hook into the prepared-statement cache consulted while planning PREPARE.
pub trait PlanCache: Send + Sync {
    /// Normalises statement text before comparison, stripping a single
    /// FORCE keyword from the prefix.
    fn get_text(&self, text: &str, prefix_len: usize) -> String;

    /// Derives a name for an anonymous or auto-named prepared statement.
    fn get_name(
        &self,
        text: &str,
        index_api_version: u32,
        feature_controls: FeatureControls,
    ) -> Result<String>;

    /// Returns a still-valid cached plan for the name/text pair, if any.
    fn get_plan(
        &self,
        name: &str,
        text: &str,
        index_api_version: u32,
        feature_controls: FeatureControls,
    ) -> Result<Option<Arc<Prepared>>>;
}

/// Planner-internal description of one candidate index.
struct IndexEntry {
    index: Arc<dyn Index>,
    /// Alias-rooted key expressions.
    keys: Vec<Expr>,
    /// Alias-rooted partition key expressions.
    partition_keys: Vec<Expr>,
    spans: Spans2,
    /// Whether the spans exactly represent the predicate.
    exact: bool,
    /// Estimated selectivity of the spans.
    selectivity: f64,
    hinted: bool,
    covering: bool,
}

/// Outcome of scan construction for one keyspace term.
struct ScanChoice {
    op: Operator,
    /// Covering scan: no fetch required.
    covering: bool,
    /// No residual filter required.
    exact: bool,
    /// Alias-rooted index keys when the scan has a usable natural order.
    ordered_keys: Vec<Expr>,
}

/// Rule-based planner over a datastore snapshot.
pub struct Planner<'a> {
    datastore: &'a dyn Datastore,
    namespace: String,
    index_api_version: u32,
    feature_controls: FeatureControls,
    cost_model: HeuristicCostModel,
}

impl<'a> Planner<'a> {
    /// Creates a planner resolving unqualified keyspaces in `namespace`.
    pub fn new(
        datastore: &'a dyn Datastore,
        namespace: impl Into<String>,
        index_api_version: u32,
        feature_controls: FeatureControls,
    ) -> Self {
        Self {
            datastore,
            namespace: namespace.into(),
            index_api_version,
            feature_controls,
            cost_model: HeuristicCostModel,
        }
    }

    /// Index API version this planner emits plans for.
    pub fn index_api_version(&self) -> u32 {
        self.index_api_version
    }

    /// Feature controls in effect.
    pub fn feature_controls(&self) -> FeatureControls {
        self.feature_controls
    }

    /// Plans a statement into an executable operator tree.
    pub fn plan(&self, stmt: &Statement) -> Result<Operator> {
        match stmt {
            Statement::Select(sel) => self.plan_select(sel),
            Statement::Insert(ins) => self.plan_insert(ins),
            Statement::Upsert(ups) => self.plan_upsert(ups),
            Statement::Delete(del) => self.plan_delete(del),
            Statement::Update(upd) => self.plan_update(upd),
            Statement::Merge(merge) => self.plan_merge(merge),
            Statement::Explain(inner) | Statement::Advise(inner) => self.plan(inner),
            Statement::Prepare { statement, .. } => self.plan(statement),
            Statement::Execute { .. } => Err(Error::Planning {
                reason: "EXECUTE resolves through the prepared cache, not the planner".into(),
            }),
            Statement::StartTransaction => Err(Error::StartTransaction {
                reason: "no transaction manager configured".into(),
            }),
            Statement::CommitTransaction | Statement::RollbackTransaction => {
                Err(Error::Transaction {
                    reason: "no transaction in progress".into(),
                })
            }
        }
    }

    fn plan_select(&self, sel: &Select) -> Result<Operator> {
        let mut children = Vec::new();
        let mut order_done = false;
        let mut offset_done = false;
        let mut limit_done = false;

        match &sel.body {
            SetOpTree::Subselect(sub) => {
                let pushdown = Pushdown {
                    order: sel.order.as_ref(),
                    offset: sel.offset.as_ref(),
                    limit: sel.limit.as_ref(),
                };
                let planned = self.plan_subselect(sub, &pushdown)?;
                children.extend(planned.ops);
                order_done = planned.order_done;
                offset_done = planned.offset_done;
                limit_done = planned.limit_done;
            }
            body @ SetOpTree::SetOp { .. } => {
                children.push(self.plan_set_op(body)?);
            }
        }

        if let Some(order) = &sel.order {
            if !order_done {
                children.push(Operator::Order {
                    terms: order
                        .terms
                        .iter()
                        .map(|t| SortTerm {
                            expr: t.expr.clone(),
                            desc: t.descending,
                        })
                        .collect(),
                    offset: None,
                    limit: None,
                    cost: Cost::default(),
                });
            }
        }
        if let Some(offset) = &sel.offset {
            if !offset_done {
                children.push(Operator::Offset {
                    expr: offset.clone(),
                });
            }
        }
        if let Some(limit) = &sel.limit {
            if !limit_done {
                children.push(Operator::Limit { expr: limit.clone() });
            }
        }
        children.push(Operator::Stream {});
        Ok(Operator::Sequence { children })
    }

    fn plan_set_op(&self, body: &SetOpTree) -> Result<Operator> {
        match body {
            SetOpTree::Subselect(sub) => {
                let planned = self.plan_subselect(sub, &Pushdown::default())?;
                Ok(Operator::Sequence { children: planned.ops })
            }
            SetOpTree::SetOp {
                kind,
                all,
                left,
                right,
            } => {
                let left_op = self.plan_set_op(left)?;
                let right_op = self.plan_set_op(right)?;
                let combined = match kind {
                    SetOpKind::Union => Operator::UnionAll {
                        children: vec![left_op, right_op],
                    },
                    SetOpKind::Intersect => Operator::IntersectAll {
                        first: Box::new(left_op),
                        second: Box::new(right_op),
                    },
                    SetOpKind::Except => Operator::ExceptAll {
                        first: Box::new(left_op),
                        second: Box::new(right_op),
                    },
                };
                if *all {
                    Ok(combined)
                } else {
                    Ok(Operator::Sequence {
                        children: vec![combined, Operator::Distinct {}],
                    })
                }
            }
        }
    }

    fn plan_subselect(&self, sub: &Subselect, pushdown: &Pushdown<'_>) -> Result<PlannedBlock> {
        let mut out = PlannedBlock::default();

        let Some(from) = &sub.from else {
            // FROM-less select evaluates its projection against one empty
            // item.
            out.ops.push(Operator::DummyScan {});
            out.ops.push(self.projection_op(&sub.projection));
            if sub.projection.distinct {
                out.ops.push(Operator::Distinct {});
            }
            return Ok(out);
        };

        let term = from.primary_term().cloned();
        match (term, from) {
            (Some(term), _) => {
                self.plan_keyspace_block(sub, from, &term, pushdown, &mut out)?
            }
            (None, FromTerm::Subquery { select, alias }) => {
                let inner = self.plan_set_op_body(select)?;
                out.ops.extend(inner);
                out.ops.push(Operator::Alias {
                    as_alias: alias.clone(),
                });
                if let Some(pred) = &sub.where_pred {
                    out.ops.push(Operator::Filter {
                        condition: pred.clone(),
                        cost: Cost::default(),
                    });
                }
                self.finish_block(sub, &Pushdown::default(), &mut out)?;
            }
            (None, _) => {
                return Err(Error::Planning {
                    reason: "FROM term has no primary keyspace".into(),
                })
            }
        }
        Ok(out)
    }

    /// Plans the body of a nested select, without result delivery.
    fn plan_set_op_body(&self, sel: &Select) -> Result<Vec<Operator>> {
        let planned = self.plan_select(sel)?;
        match planned {
            Operator::Sequence { mut children } => {
                // Strip the trailing Stream; the consumer continues the
                // pipeline.
                if matches!(children.last(), Some(Operator::Stream {})) {
                    children.pop();
                }
                Ok(children)
            }
            other => Ok(vec![other]),
        }
    }

    fn plan_keyspace_block(
        &self,
        sub: &Subselect,
        from: &FromTerm,
        term: &KeyspaceTerm,
        pushdown: &Pushdown<'_>,
        out: &mut PlannedBlock,
    ) -> Result<()> {
        let has_star = sub.projection.terms.iter().any(|t| t.star);
        let single_term = matches!(from, FromTerm::Keyspace(_));
        let simple_block = single_term && sub.group.is_none() && !sub.projection.distinct;

        // Expressions a covering index would have to supply.
        let mut cover_exprs: Vec<Expr> = Vec::new();
        if !has_star {
            for t in &sub.projection.terms {
                if let Some(e) = &t.expr {
                    cover_exprs.push(e.clone());
                }
            }
        }
        if let Some(pred) = &sub.where_pred {
            cover_exprs.push(pred.clone());
        }
        if let Some(order) = pushdown.order {
            cover_exprs.extend(order.terms.iter().map(|t| t.expr.clone()));
        }
        if let Some(group) = &sub.group {
            cover_exprs.extend(group.by.iter().cloned());
        }
        let can_cover = !has_star && single_term;

        let order_keys: Option<Vec<Expr>> = pushdown.order.and_then(|order| {
            if order.terms.iter().any(|t| t.descending) {
                return None;
            }
            Some(order.terms.iter().map(|t| t.expr.clone()).collect())
        });

        let mut choice = self.build_scan(
            term,
            sub.where_pred.as_ref(),
            &cover_exprs,
            can_cover,
            order_keys.as_deref(),
        )?;

        // Offset/limit push into the scan only when no operator between the
        // scan and the consumer can drop rows.
        let can_push_rows = simple_block && choice.exact && !sub.correlated;
        if can_push_rows {
            match (&mut choice.op, pushdown.offset, pushdown.limit) {
                (
                    Operator::IndexScan3 { offset, limit, .. },
                    pushed_offset,
                    pushed_limit,
                ) if pushed_offset.is_some() || pushed_limit.is_some() => {
                    *offset = pushed_offset.cloned();
                    *limit = pushed_limit.cloned();
                    out.offset_done = pushed_offset.is_some();
                    out.limit_done = pushed_limit.is_some();
                }
                (Operator::PrimaryScan { limit, .. }, pushed_offset, Some(pushed_limit)) => {
                    // The primary scan takes a single cap; widen it to
                    // offset+limit and keep the Offset operator standalone.
                    *limit = Some(widened_limit(pushed_offset, pushed_limit));
                    out.limit_done = true;
                }
                _ => {}
            }
        }

        // Order pushes into the scan when the scan's natural order already
        // matches the requested keys.
        if let (Some(keys), false) = (order_keys.as_ref(), choice.ordered_keys.is_empty()) {
            let matches_prefix = keys.len() <= choice.ordered_keys.len()
                && keys
                    .iter()
                    .zip(choice.ordered_keys.iter())
                    .all(|(want, have)| want.equivalent_to(have));
            if matches_prefix && simple_block {
                if let Operator::IndexScan3 { ordered, .. } = &mut choice.op {
                    *ordered = true;
                    out.order_done = true;
                }
            }
        }

        let covering = choice.covering;
        let exact = choice.exact;
        out.ops.push(choice.op);

        // Per-item stage: fetch, residual filter, joins, projection.
        let mut stage: Vec<Operator> = Vec::new();
        if !covering {
            stage.push(Operator::Fetch {
                keyspace: keyspace_ref(term, &self.namespace),
                cost: Cost::default(),
            });
        }
        if let Some(pred) = &sub.where_pred {
            if !exact {
                stage.push(Operator::Filter {
                    condition: pred.clone(),
                    cost: Cost::default(),
                });
            }
        }
        self.plan_from_chain(from, &mut stage)?;

        // Sorting downstream restores determinism, so the per-item stage may
        // fan out; without an ORDER BY the scan's order is preserved by
        // running it serially.
        let parallelise = pushdown.order.is_some() && !out.order_done && sub.group.is_none();
        if parallelise && !stage.is_empty() {
            out.ops.push(Operator::Parallel {
                child: Box::new(Operator::Sequence { children: stage }),
                max_parallelism: 0,
            });
        } else {
            out.ops.append(&mut stage);
        }

        self.finish_block(sub, pushdown, out)?;
        Ok(())
    }

    /// Appends join/nest/unnest operators for every non-primary term of the
    /// FROM chain, innermost first.
    fn plan_from_chain(&self, from: &FromTerm, stage: &mut Vec<Operator>) -> Result<()> {
        match from {
            FromTerm::Keyspace(_) | FromTerm::Subquery { .. } => Ok(()),
            FromTerm::Join {
                left,
                right,
                on,
                outer,
            } => {
                self.plan_from_chain(left, stage)?;
                let child = self.right_side_plan(right)?;
                stage.push(match hash_join_keys(on, right.alias()) {
                    Some((probe, build)) => Operator::HashJoin {
                        alias: right.alias().to_owned(),
                        probe,
                        build,
                        outer: *outer,
                        child: Box::new(child),
                    },
                    None => Operator::NLJoin {
                        alias: right.alias().to_owned(),
                        on: on.clone(),
                        outer: *outer,
                        child: Box::new(child),
                    },
                });
                Ok(())
            }
            FromTerm::Nest {
                left,
                right,
                on,
                outer,
            } => {
                self.plan_from_chain(left, stage)?;
                let child = self.right_side_plan(right)?;
                stage.push(Operator::NLNest {
                    alias: right.alias().to_owned(),
                    on: on.clone(),
                    outer: *outer,
                    child: Box::new(child),
                });
                Ok(())
            }
            FromTerm::Unnest {
                left,
                expr,
                alias,
                outer,
            } => {
                self.plan_from_chain(left, stage)?;
                stage.push(Operator::Unnest {
                    expr: expr.clone(),
                    alias: alias.clone(),
                    outer: *outer,
                });
                Ok(())
            }
        }
    }

    /// Scan-plus-fetch plan for the right side of a join or nest.
    fn right_side_plan(&self, term: &KeyspaceTerm) -> Result<Operator> {
        let choice = self.build_scan(term, None, &[], false, None)?;
        Ok(Operator::Sequence {
            children: vec![
                choice.op,
                Operator::Fetch {
                    keyspace: keyspace_ref(term, &self.namespace),
                    cost: Cost::default(),
                },
            ],
        })
    }

    /// Appends grouping, ordering, row accounting, projection, and distinct
    /// stages. Order/offset/limit run before the projection so their
    /// expressions resolve against the source scope.
    fn finish_block(
        &self,
        sub: &Subselect,
        pushdown: &Pushdown<'_>,
        out: &mut PlannedBlock,
    ) -> Result<()> {
        if let Some(group) = &sub.group {
            self.plan_group(sub, group, out)?;
        }
        if let (Some(order), false) = (pushdown.order, out.order_done) {
            out.ops.push(Operator::Order {
                terms: order
                    .terms
                    .iter()
                    .map(|t| SortTerm {
                        expr: t.expr.clone(),
                        desc: t.descending,
                    })
                    .collect(),
                offset: None,
                limit: None,
                cost: Cost::default(),
            });
            out.order_done = true;
        }
        // DISTINCT must see every row before the cap applies, so row
        // accounting stays at the top level in that case.
        if !sub.projection.distinct {
            if let (Some(offset), false) = (pushdown.offset, out.offset_done) {
                out.ops.push(Operator::Offset {
                    expr: offset.clone(),
                });
                out.offset_done = true;
            }
            if let (Some(limit), false) = (pushdown.limit, out.limit_done) {
                out.ops.push(Operator::Limit { expr: limit.clone() });
                out.limit_done = true;
            }
        }
        out.ops.push(self.projection_op(&sub.projection));
        if sub.projection.distinct {
            out.ops.push(Operator::Distinct {});
        }
        Ok(())
    }

    fn plan_group(&self, sub: &Subselect, group: &GroupBy, out: &mut PlannedBlock) -> Result<()> {
        let mut aggregates: Vec<Expr> = Vec::new();
        let mut collect = |e: &Expr| collect_aggregates(e, &mut aggregates);
        for term in &sub.projection.terms {
            if let Some(e) = &term.expr {
                collect(e);
            }
        }
        if let Some(having) = &group.having {
            collect(having);
        }
        let keys = group.by.clone();
        out.ops.push(Operator::InitialGroup {
            keys: keys.clone(),
            aggregates: aggregates.clone(),
        });
        out.ops.push(Operator::IntermediateGroup {
            keys: keys.clone(),
            aggregates: aggregates.clone(),
        });
        out.ops.push(Operator::FinalGroup { keys, aggregates });
        if let Some(having) = &group.having {
            out.ops.push(Operator::Filter {
                condition: having.clone(),
                cost: Cost::default(),
            });
        }
        Ok(())
    }

    fn projection_op(&self, projection: &Projection) -> Operator {
        Operator::Project {
            terms: projection
                .terms
                .iter()
                .map(|t| ProjectTerm {
                    expr: t.expr.clone(),
                    star: t.star,
                    as_alias: t.alias().to_owned(),
                })
                .collect(),
            raw: projection.raw,
        }
    }

    /// Builds the access path for one keyspace term.
    fn build_scan(
        &self,
        term: &KeyspaceTerm,
        pred: Option<&Expr>,
        cover_exprs: &[Expr],
        can_cover: bool,
        order_keys: Option<&[Expr]>,
    ) -> Result<ScanChoice> {
        let namespace = self.namespace_of(term);
        let keyspace = self.datastore.keyspace(&namespace, &term.keyspace)?;
        let alias = term.alias();

        let online: Vec<Arc<dyn Index>> = keyspace
            .indexes()?
            .into_iter()
            .filter(|ix| ix.state() == IndexState::Online)
            .collect();

        let mut entries: Vec<IndexEntry> = Vec::new();
        if let Some(pred) = pred {
            for ix in &online {
                if ix.is_primary() {
                    continue;
                }
                let hinted = term.hint_indexes.iter().any(|h| h == ix.name());
                if !term.hint_indexes.is_empty() && !hinted {
                    continue;
                }
                if let Some(entry) = self.index_entry(ix, alias, pred, cover_exprs, can_cover, hinted)
                {
                    entries.push(entry);
                }
            }
        }

        // When no index derives a real constraint, a top-level OR may still
        // be servable as a union of per-disjunct scans over different
        // indexes.
        let has_constraining = entries.iter().any(|e| e.spans != valued_spans());
        if !has_constraining {
            if let Some(Expr::Or(disjuncts)) = pred {
                if let Some(choice) = self.build_union_scan(term, disjuncts, cover_exprs)? {
                    return Ok(choice);
                }
            }
        }
        if entries.is_empty() {
            return self.build_primary_scan(term, &online);
        }

        rank_entries(&mut entries, order_keys);
        let best = &entries[0];

        if !best.exact && entries.len() >= 2 {
            let constraining: Vec<&IndexEntry> = entries
                .iter()
                .filter(|e| e.spans != valued_spans())
                .collect();
            if constraining.len() >= 2 {
                let exact = pred
                    .map(|p| conjuncts_all_handled(p, &constraining))
                    .unwrap_or(false);
                let scans = constraining
                    .iter()
                    .take(64)
                    .map(|e| self.index_scan_op(term, e))
                    .collect();
                debug!(
                    keyspace = %term.keyspace,
                    scans = constraining.len().min(64),
                    "planned intersect scan"
                );
                return Ok(ScanChoice {
                    op: Operator::IntersectScan {
                        scans,
                        limit: None,
                        cost: Cost::default(),
                    },
                    covering: false,
                    exact,
                    ordered_keys: Vec::new(),
                });
            }
        }

        let op = self.index_scan_op(term, best);
        Ok(ScanChoice {
            covering: best.covering,
            exact: best.exact,
            ordered_keys: best.keys.clone(),
            op,
        })
    }

    fn index_entry(
        &self,
        ix: &Arc<dyn Index>,
        alias: &str,
        pred: &Expr,
        cover_exprs: &[Expr],
        can_cover: bool,
        hinted: bool,
    ) -> Option<IndexEntry> {
        let keys: Vec<Expr> = ix.keys().iter().map(|k| alias_root(k, alias)).collect();
        let leading = keys.first()?;
        let spans = match sarg_for(pred, leading) {
            Some(spans) => spans,
            None if hinted => valued_spans(),
            None => return None,
        };
        let exact = spans_exact(&spans) && mentions_only(pred, leading);
        let partition_keys: Vec<Expr> = ix
            .partition_keys()
            .iter()
            .map(|k| alias_root(k, alias))
            .collect();
        let covering = can_cover && {
            let mut covers = keys.clone();
            covers.extend(partition_keys.iter().cloned());
            !cover_exprs.is_empty() && cover_exprs.iter().all(|e| e.covered_by(&covers))
        };
        let selectivity = self.cost_model.span_selectivity(ix, &spans);
        Some(IndexEntry {
            index: Arc::clone(ix),
            keys,
            partition_keys,
            spans,
            exact,
            selectivity,
            hinted,
            covering,
        })
    }

    fn index_scan_op(&self, term: &KeyspaceTerm, entry: &IndexEntry) -> Operator {
        let covers = if entry.covering {
            let mut covers = entry.keys.clone();
            covers.extend(entry.partition_keys.iter().cloned());
            covers
        } else {
            Vec::new()
        };
        let index_projection = if entry.covering {
            Some(IndexProjection {
                entry_keys: (0..entry.keys.len()).collect(),
                primary_key: true,
            })
        } else {
            Some(IndexProjection::primary_only())
        };
        Operator::IndexScan3 {
            index: entry.index.name().to_owned(),
            keyspace: keyspace_ref(term, &self.namespace),
            spans: entry.spans.clone(),
            covers,
            index_projection,
            ordered: false,
            offset: None,
            limit: None,
            cost: Cost {
                cardinality: entry.selectivity,
                ..Cost::default()
            },
        }
    }

    fn build_union_scan(
        &self,
        term: &KeyspaceTerm,
        disjuncts: &[Expr],
        cover_exprs: &[Expr],
    ) -> Result<Option<ScanChoice>> {
        let mut scans = Vec::with_capacity(disjuncts.len());
        let mut exact = true;
        for disjunct in disjuncts {
            let choice = self.build_scan(term, Some(disjunct), cover_exprs, false, None)?;
            match &choice.op {
                Operator::IndexScan3 { .. } => {
                    exact &= choice.exact;
                    scans.push(choice.op);
                }
                // A disjunct that falls back to the primary makes the whole
                // union pointless.
                _ => return Ok(None),
            }
        }
        if scans.len() < 2 {
            return Ok(None);
        }
        Ok(Some(ScanChoice {
            op: Operator::UnionScan {
                scans,
                limit: None,
                cost: Cost::default(),
            },
            covering: false,
            // Union keys are deduplicated, but the predicate may still need
            // re-checking per row.
            exact,
            ordered_keys: Vec::new(),
        }))
    }

    fn build_primary_scan(
        &self,
        term: &KeyspaceTerm,
        online: &[Arc<dyn Index>],
    ) -> Result<ScanChoice> {
        // Hints first, then the first online primary.
        let hinted = online.iter().find(|ix| {
            ix.is_primary() && term.hint_indexes.iter().any(|h| h == ix.name())
        });
        let primary = hinted
            .or_else(|| online.iter().find(|ix| ix.is_primary()))
            .ok_or_else(|| Error::NoPrimaryIndex {
                keyspace: term.path_string(),
            })?;
        Ok(ScanChoice {
            op: Operator::PrimaryScan {
                index: primary.name().to_owned(),
                keyspace: keyspace_ref(term, &self.namespace),
                limit: None,
                cost: Cost::default(),
            },
            covering: false,
            // A primary scan constrains nothing; any predicate is residual.
            exact: false,
            ordered_keys: Vec::new(),
        })
    }

    fn plan_insert(&self, ins: &Insert) -> Result<Operator> {
        Ok(Operator::Sequence {
            children: vec![
                Operator::SendInsert {
                    keyspace: keyspace_ref(&ins.keyspace, &self.namespace),
                    pairs: pairs_of(&ins.values),
                },
                Operator::Stream {},
            ],
        })
    }

    fn plan_upsert(&self, ups: &Upsert) -> Result<Operator> {
        Ok(Operator::Sequence {
            children: vec![
                Operator::SendUpsert {
                    keyspace: keyspace_ref(&ups.keyspace, &self.namespace),
                    pairs: pairs_of(&ups.values),
                },
                Operator::Stream {},
            ],
        })
    }

    fn plan_delete(&self, del: &Delete) -> Result<Operator> {
        let mut children = self.dml_read_stage(&del.keyspace, del.where_pred.as_ref())?;
        children.push(Operator::SendDelete {
            keyspace: keyspace_ref(&del.keyspace, &self.namespace),
            limit: del.limit.clone(),
        });
        children.push(Operator::Stream {});
        Ok(Operator::Sequence { children })
    }

    fn plan_update(&self, upd: &Update) -> Result<Operator> {
        let mut children = self.dml_read_stage(&upd.keyspace, upd.where_pred.as_ref())?;
        children.push(Operator::SendUpdate {
            keyspace: keyspace_ref(&upd.keyspace, &self.namespace),
            set: upd
                .set
                .iter()
                .map(|c| UpdateSet {
                    path: c.path.clone(),
                    value: c.value.clone(),
                })
                .collect(),
            unset: upd.unset.clone(),
            limit: upd.limit.clone(),
        });
        children.push(Operator::Stream {});
        Ok(Operator::Sequence { children })
    }

    fn plan_merge(&self, merge: &Merge) -> Result<Operator> {
        let mut children = self.dml_read_stage(&merge.source, None)?;
        let (update, delete) = match &merge.matched {
            Some(MergeAction::Update(set)) => (
                Some(
                    set.iter()
                        .map(|c| UpdateSet {
                            path: c.path.clone(),
                            value: c.value.clone(),
                        })
                        .collect(),
                ),
                false,
            ),
            Some(MergeAction::Delete) => (None, true),
            _ => (None, false),
        };
        let insert = match &merge.unmatched {
            Some(MergeAction::Insert(e)) => Some(e.clone()),
            _ => None,
        };
        children.push(Operator::Merge {
            keyspace: keyspace_ref(&merge.keyspace, &self.namespace),
            key: merge.on_key.clone(),
            update,
            delete,
            insert,
        });
        children.push(Operator::Stream {});
        Ok(Operator::Sequence { children })
    }

    /// Scan + fetch + residual filter feeding a mutation operator.
    fn dml_read_stage(
        &self,
        term: &KeyspaceTerm,
        pred: Option<&Expr>,
    ) -> Result<Vec<Operator>> {
        let choice = self.build_scan(term, pred, &[], false, None)?;
        let exact = choice.exact;
        let mut children = vec![choice.op];
        children.push(Operator::Fetch {
            keyspace: keyspace_ref(term, &self.namespace),
            cost: Cost::default(),
        });
        if let Some(pred) = pred {
            if !exact {
                children.push(Operator::Filter {
                    condition: pred.clone(),
                    cost: Cost::default(),
                });
            }
        }
        Ok(children)
    }

    fn namespace_of(&self, term: &KeyspaceTerm) -> String {
        if term.namespace.is_empty() {
            self.namespace.clone()
        } else {
            term.namespace.clone()
        }
    }
}

/// Push-down candidates flowing from the enclosing SELECT.
#[derive(Default)]
struct Pushdown<'a> {
    order: Option<&'a OrderBy>,
    offset: Option<&'a Expr>,
    limit: Option<&'a Expr>,
}

/// Operators produced for one subselect plus which push-downs landed.
#[derive(Default)]
struct PlannedBlock {
    ops: Vec<Operator>,
    order_done: bool,
    offset_done: bool,
    limit_done: bool,
}

fn keyspace_ref(term: &KeyspaceTerm, default_namespace: &str) -> KeyspaceRef {
    let namespace = if term.namespace.is_empty() {
        default_namespace.to_owned()
    } else {
        term.namespace.clone()
    };
    KeyspaceRef::new(namespace, term.keyspace.clone(), term.as_alias.clone())
}

fn pairs_of(values: &[(Expr, Expr)]) -> Vec<InsertPair> {
    values
        .iter()
        .map(|(k, v)| InsertPair {
            key: k.clone(),
            value: v.clone(),
        })
        .collect()
}

fn widened_limit(offset: Option<&Expr>, limit: &Expr) -> Expr {
    match offset {
        Some(offset) => Expr::Arith(
            crate::expression::ArithOp::Add,
            Box::new(offset.clone()),
            Box::new(limit.clone()),
        ),
        None => limit.clone(),
    }
}

/// Prefixes every field path in `expr` with the binding alias, turning
/// document-rooted index keys into item-rooted expressions.
fn alias_root(expr: &Expr, alias: &str) -> Expr {
    match expr {
        Expr::Field(path) => {
            let mut rooted = Vec::with_capacity(path.len() + 1);
            rooted.push(alias.to_owned());
            rooted.extend(path.iter().cloned());
            Expr::Field(rooted)
        }
        other => {
            // Rebuild through serde-free structural clone, rewriting fields.
            let mut clone = other.clone();
            rewrite_fields(&mut clone, alias);
            clone
        }
    }
}

fn rewrite_fields(expr: &mut Expr, alias: &str) {
    if let Expr::Field(path) = expr {
        let mut rooted = Vec::with_capacity(path.len() + 1);
        rooted.push(alias.to_owned());
        rooted.append(path);
        *path = rooted;
        return;
    }
    match expr {
        Expr::Arith(_, a, b) | Expr::Cmp(_, a, b) => {
            rewrite_fields(a, alias);
            rewrite_fields(b, alias);
        }
        Expr::Neg(a)
        | Expr::IsNull(a)
        | Expr::IsNotNull(a)
        | Expr::IsMissing(a)
        | Expr::IsValued(a)
        | Expr::Not(a) => rewrite_fields(a, alias),
        Expr::Between { expr, low, high } => {
            rewrite_fields(expr, alias);
            rewrite_fields(low, alias);
            rewrite_fields(high, alias);
        }
        Expr::Like { expr, pattern } => {
            rewrite_fields(expr, alias);
            rewrite_fields(pattern, alias);
        }
        Expr::In { expr, list } => {
            rewrite_fields(expr, alias);
            for e in list {
                rewrite_fields(e, alias);
            }
        }
        Expr::And(items) | Expr::Or(items) | Expr::CondNum(_, items) => {
            for e in items {
                rewrite_fields(e, alias);
            }
        }
        Expr::Any {
            bindings,
            satisfies,
        }
        | Expr::Every {
            bindings,
            satisfies,
        } => {
            for b in bindings {
                rewrite_fields(&mut b.source, alias);
            }
            rewrite_fields(satisfies, alias);
        }
        Expr::Func { args, .. } => {
            for e in args {
                rewrite_fields(e, alias);
            }
        }
        Expr::Aggregate { expr: Some(e), .. } => rewrite_fields(e, alias),
        _ => {}
    }
}

/// Recognises an equi-join condition usable by the hash join: one side of
/// the equality must evaluate over the right alias, the other must not.
/// Returns `(probe, build)` — the left-row and right-row key expressions.
fn hash_join_keys(on: &Expr, right_alias: &str) -> Option<(Expr, Expr)> {
    let Expr::Cmp(CmpOp::Eq, a, b) = on else {
        return None;
    };
    let right_root = Expr::field([right_alias]);
    let roots_in_right = |e: &Expr| mentions_alias(e, right_alias);
    match (roots_in_right(a), roots_in_right(b)) {
        (false, true) => Some(((**a).clone(), (**b).clone())),
        (true, false) => Some(((**b).clone(), (**a).clone())),
        _ => None,
    }
    .filter(|_| {
        // A bare alias reference is not a usable key.
        !a.equivalent_to(&right_root) && !b.equivalent_to(&right_root)
    })
}

fn mentions_alias(expr: &Expr, alias: &str) -> bool {
    match expr {
        Expr::Field(path) => path.first().map(String::as_str) == Some(alias),
        _ => expr.children().iter().any(|c| mentions_alias(c, alias)),
    }
}

/// Whether every field referenced by `pred` is the key itself.
fn mentions_only(pred: &Expr, key: &Expr) -> bool {
    match pred {
        Expr::Field(_) => pred.equivalent_to(key),
        _ => pred.children().iter().all(|c| mentions_only(c, key)),
    }
}

fn flatten_conjuncts<'e>(pred: &'e Expr, out: &mut Vec<&'e Expr>) {
    match pred {
        Expr::And(items) => {
            for item in items {
                flatten_conjuncts(item, out);
            }
        }
        other => out.push(other),
    }
}

/// Whether every conjunct of `pred` is exactly represented by at least one
/// chosen intersect-scan leg.
fn conjuncts_all_handled(pred: &Expr, entries: &[&IndexEntry]) -> bool {
    let mut conjuncts = Vec::new();
    flatten_conjuncts(pred, &mut conjuncts);
    conjuncts.iter().all(|conjunct| {
        entries.iter().any(|entry| {
            let Some(leading) = entry.keys.first() else {
                return false;
            };
            match sarg_for(conjunct, leading) {
                Some(spans) => spans_exact(&spans) && mentions_only(conjunct, leading),
                None => false,
            }
        })
    })
}

fn collect_aggregates(expr: &Expr, out: &mut Vec<Expr>) {
    if matches!(expr, Expr::Aggregate { .. }) {
        if !out.contains(expr) {
            out.push(expr.clone());
        }
        return;
    }
    for child in expr.children() {
        collect_aggregates(child, out);
    }
}

fn rank_entries(entries: &mut [IndexEntry], order_keys: Option<&[Expr]>) {
    let order_score = |entry: &IndexEntry| -> bool {
        let Some(keys) = order_keys else { return false };
        keys.len() <= entry.keys.len()
            && keys
                .iter()
                .zip(entry.keys.iter())
                .all(|(want, have)| want.equivalent_to(have))
    };
    entries.sort_by(|a, b| {
        b.hinted
            .cmp(&a.hinted)
            .then_with(|| b.exact.cmp(&a.exact))
            .then_with(|| b.covering.cmp(&a.covering))
            .then_with(|| order_score(b).cmp(&order_score(a)))
            .then_with(|| a.keys.len().cmp(&b.keys.len()))
            .then_with(|| a.selectivity.total_cmp(&b.selectivity))
            .then_with(|| a.index.name().cmp(b.index.name()))
    });
}

/// Builds a complete prepared plan for a statement.
///
/// The statement must already be formalised. Name, text, and type are
/// recorded verbatim; reprepare relies on them being stable.
pub fn build_prepared(
    stmt: &Statement,
    name: &str,
    text: &str,
    datastore: &dyn Datastore,
    namespace: &str,
    index_api_version: u32,
    feature_controls: FeatureControls,
) -> Result<Prepared> {
    let planner = Planner::new(datastore, namespace, index_api_version, feature_controls);
    let operator = planner.plan(stmt)?;
    let mut prepared = Prepared::new(
        name,
        text,
        stmt.type_name(),
        operator,
        index_api_version,
        feature_controls,
    );
    prepared.namespace = namespace.to_owned();
    prepared.snapshot_versions(datastore)?;
    prepared.build_encoded_plan()?;
    Ok(prepared)
}

/// Convenience wrapper recording versions for an already-built operator
/// tree; used by tests that assemble plans by hand.
pub fn finish_prepared(mut prepared: Prepared, datastore: &dyn Datastore) -> Result<Prepared> {
    prepared.snapshot_versions(datastore)?;
    prepared.build_encoded_plan()?;
    Ok(prepared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::Keyspace;
    use crate::algebra::ResultTerm;
    use crate::datastore::memory::MemDatastore;
    use crate::expression::CmpOp;

    fn seeded() -> MemDatastore {
        let store = MemDatastore::new();
        let ks = store.keyspace_or_create("default", "orders");
        ks.upsert(&[(
            "k1".into(),
            crate::value::Value::object([("total", crate::value::Value::from(5.0))]),
        )])
        .unwrap();
        ks.create_primary_index("#primary");
        ks.create_index("ix_total", vec![Expr::field(["total"])]);
        store
    }

    fn planner(store: &MemDatastore) -> Planner<'_> {
        Planner::new(store, "default", 4, FeatureControls::default())
    }

    fn select_total_eq(v: f64) -> Statement {
        let mut stmt = Statement::Select(Select::simple(
            KeyspaceTerm::new("default", "orders", Some("o".into())),
            Some(Expr::Cmp(
                CmpOp::Eq,
                Box::new(Expr::field(["total"])),
                Box::new(Expr::literal(v)),
            )),
            Projection::star(),
        ));
        stmt.formalize().unwrap();
        stmt
    }

    fn first_scan(op: &Operator) -> &Operator {
        match op {
            Operator::Sequence { children } => &children[0],
            other => other,
        }
    }

    #[test]
    fn equality_predicate_selects_the_secondary_index() {
        let store = seeded();
        let plan = planner(&store).plan(&select_total_eq(5.0)).unwrap();
        match first_scan(&plan) {
            Operator::IndexScan3 { index, spans, .. } => {
                assert_eq!(index, "ix_total");
                assert!(spans_exact(spans));
            }
            other => panic!("expected IndexScan3, got {}", other.name()),
        }
        // The spans are exact, so no residual Filter appears.
        if let Operator::Sequence { children } = &plan {
            assert!(!children
                .iter()
                .any(|op| matches!(op, Operator::Filter { .. })));
        }
    }

    #[test]
    fn unsargable_predicate_falls_back_to_primary() {
        let store = seeded();
        let mut stmt = Statement::Select(Select::simple(
            KeyspaceTerm::new("default", "orders", Some("o".into())),
            Some(Expr::Cmp(
                CmpOp::Eq,
                Box::new(Expr::field(["untracked"])),
                Box::new(Expr::literal(1.0)),
            )),
            Projection::star(),
        ));
        stmt.formalize().unwrap();
        let plan = planner(&store).plan(&stmt).unwrap();
        match first_scan(&plan) {
            Operator::PrimaryScan { index, .. } => assert_eq!(index, "#primary"),
            other => panic!("expected PrimaryScan, got {}", other.name()),
        }
        // Residual filter must survive.
        if let Operator::Sequence { children } = &plan {
            assert!(children
                .iter()
                .any(|op| matches!(op, Operator::Filter { .. })));
        }
    }

    #[test]
    fn missing_primary_index_names_the_keyspace() {
        let store = MemDatastore::new();
        store.keyspace_or_create("default", "bare");
        let mut stmt = Statement::Select(Select::simple(
            KeyspaceTerm::new("default", "bare", None),
            None,
            Projection::star(),
        ));
        stmt.formalize().unwrap();
        let err = planner(&store).plan(&stmt).unwrap_err();
        assert_eq!(err.code(), 4000);
        assert!(err.to_string().contains("default:bare"));
        assert!(err.to_string().contains("CREATE PRIMARY INDEX"));
    }

    #[test]
    fn covering_projection_skips_the_fetch() {
        let store = seeded();
        let mut stmt = Statement::Select(Select::simple(
            KeyspaceTerm::new("default", "orders", Some("o".into())),
            Some(Expr::Cmp(
                CmpOp::Gt,
                Box::new(Expr::field(["total"])),
                Box::new(Expr::literal(1.0)),
            )),
            Projection::terms(vec![ResultTerm::expr(Expr::field(["total"]), None)]),
        ));
        stmt.formalize().unwrap();
        let plan = planner(&store).plan(&stmt).unwrap();
        let Operator::Sequence { children } = &plan else {
            panic!("expected sequence")
        };
        match &children[0] {
            Operator::IndexScan3 { covers, .. } => assert!(!covers.is_empty()),
            other => panic!("expected IndexScan3, got {}", other.name()),
        }
        assert!(!children.iter().any(|op| matches!(op, Operator::Fetch { .. })));
    }

    #[test]
    fn exact_spans_push_limit_into_the_scan() {
        let store = seeded();
        let mut sel = Select::simple(
            KeyspaceTerm::new("default", "orders", Some("o".into())),
            Some(Expr::Cmp(
                CmpOp::Eq,
                Box::new(Expr::field(["total"])),
                Box::new(Expr::literal(5.0)),
            )),
            Projection::star(),
        );
        sel.limit = Some(Expr::literal(10.0));
        let mut stmt = Statement::Select(sel);
        stmt.formalize().unwrap();
        let plan = planner(&store).plan(&stmt).unwrap();
        let Operator::Sequence { children } = &plan else {
            panic!("expected sequence")
        };
        match &children[0] {
            Operator::IndexScan3 { limit, .. } => assert!(limit.is_some()),
            other => panic!("expected IndexScan3, got {}", other.name()),
        }
        assert!(!children.iter().any(|op| matches!(op, Operator::Limit { .. })));
    }

    #[test]
    fn inexact_predicate_keeps_standalone_limit() {
        let store = seeded();
        let mut sel = Select::simple(
            KeyspaceTerm::new("default", "orders", Some("o".into())),
            Some(Expr::Cmp(
                CmpOp::Eq,
                Box::new(Expr::field(["untracked"])),
                Box::new(Expr::literal(1.0)),
            )),
            Projection::star(),
        );
        sel.limit = Some(Expr::literal(10.0));
        let mut stmt = Statement::Select(sel);
        stmt.formalize().unwrap();
        let plan = planner(&store).plan(&stmt).unwrap();
        let Operator::Sequence { children } = &plan else {
            panic!("expected sequence")
        };
        assert!(children.iter().any(|op| matches!(op, Operator::Limit { .. })));
    }

    #[test]
    fn hinted_index_wins() {
        let store = seeded();
        let ks = store.keyspace_or_create("default", "orders");
        ks.create_index("ix_other", vec![Expr::field(["total"])]);
        let mut stmt = Statement::Select(Select::simple(
            KeyspaceTerm::new("default", "orders", Some("o".into())).with_hint("ix_other"),
            Some(Expr::Cmp(
                CmpOp::Eq,
                Box::new(Expr::field(["total"])),
                Box::new(Expr::literal(5.0)),
            )),
            Projection::star(),
        ));
        stmt.formalize().unwrap();
        let plan = planner(&store).plan(&stmt).unwrap();
        match first_scan(&plan) {
            Operator::IndexScan3 { index, .. } => assert_eq!(index, "ix_other"),
            other => panic!("expected IndexScan3, got {}", other.name()),
        }
    }

    #[test]
    fn conjunction_over_two_indexes_plans_an_intersect_scan() {
        let store = seeded();
        let ks = store.keyspace_or_create("default", "orders");
        ks.create_index("ix_status", vec![Expr::field(["status"])]);
        let mut stmt = Statement::Select(Select::simple(
            KeyspaceTerm::new("default", "orders", Some("o".into())),
            Some(Expr::And(vec![
                Expr::Cmp(
                    CmpOp::Gt,
                    Box::new(Expr::field(["total"])),
                    Box::new(Expr::literal(1.0)),
                ),
                Expr::Cmp(
                    CmpOp::Eq,
                    Box::new(Expr::field(["status"])),
                    Box::new(Expr::literal("open")),
                ),
            ])),
            Projection::star(),
        ));
        stmt.formalize().unwrap();
        let plan = planner(&store).plan(&stmt).unwrap();
        match first_scan(&plan) {
            Operator::IntersectScan { scans, .. } => assert_eq!(scans.len(), 2),
            other => panic!("expected IntersectScan, got {}", other.name()),
        }
    }

    #[test]
    fn disjunction_over_two_indexes_plans_a_union_scan() {
        let store = seeded();
        let ks = store.keyspace_or_create("default", "orders");
        ks.create_index("ix_status", vec![Expr::field(["status"])]);
        let mut stmt = Statement::Select(Select::simple(
            KeyspaceTerm::new("default", "orders", Some("o".into())),
            Some(Expr::Or(vec![
                Expr::Cmp(
                    CmpOp::Eq,
                    Box::new(Expr::field(["total"])),
                    Box::new(Expr::literal(5.0)),
                ),
                Expr::Cmp(
                    CmpOp::Eq,
                    Box::new(Expr::field(["status"])),
                    Box::new(Expr::literal("open")),
                ),
            ])),
            Projection::star(),
        ));
        stmt.formalize().unwrap();
        let plan = planner(&store).plan(&stmt).unwrap();
        match first_scan(&plan) {
            Operator::UnionScan { scans, .. } => assert_eq!(scans.len(), 2),
            other => panic!("expected UnionScan, got {}", other.name()),
        }
    }

    #[test]
    fn build_prepared_records_versions_and_encoded_plan() {
        let store = seeded();
        let stmt = select_total_eq(5.0);
        let prepared = build_prepared(
            &stmt,
            "p1",
            "SELECT * FROM orders o WHERE total = 5",
            &store,
            "default",
            4,
            FeatureControls::default(),
        )
        .unwrap();
        assert!(!prepared.versions.is_empty());
        assert!(!prepared.encoded_plan.is_empty());
        assert!(prepared.readonly);
        let decoded = Prepared::decode(&prepared.encoded_plan).unwrap();
        assert_eq!(decoded.operator, prepared.operator);
    }
}

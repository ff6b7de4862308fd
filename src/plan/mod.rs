//! Physical plan object model.
//!
//! Operators form an acyclic ownership tree. Every operator serialises with
//! a `"#operator"` discriminator; single children live under `"~child"` and
//! child lists under `"~children"` (scans use `"scans"`). The JSON form is
//! the canonical portable representation: it feeds the encoded plan handed
//! to clients and the cluster-wide plan distribution.

use serde::{Deserialize, Serialize};

use crate::config;
use crate::datastore::Datastore;
use crate::errors::Result;
use crate::expression::Expr;

mod prepared;
mod spans;

pub use prepared::{MetadataVersion, Prepared};
pub use spans::{
    exact_valued_spans, null_expr, self_spans, spans_exact, valued_spans, IndexProjection,
    Span2, SpanRange, Spans2,
};

fn f64_is_zero(v: &f64) -> bool {
    *v == 0.0
}

fn i64_is_zero(v: &i64) -> bool {
    *v == 0
}

fn usize_is_zero(v: &usize) -> bool {
    *v == 0
}

/// Optimizer estimates; omitted from the wire when unknown (zero).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Cost {
    /// Total cost estimate.
    #[serde(default, skip_serializing_if = "f64_is_zero")]
    pub cost: f64,
    /// Output cardinality estimate.
    #[serde(default, skip_serializing_if = "f64_is_zero")]
    pub cardinality: f64,
    /// Average document size estimate in bytes.
    #[serde(default, skip_serializing_if = "i64_is_zero")]
    pub size: i64,
    /// First-row cost estimate.
    #[serde(default, rename = "frCost", skip_serializing_if = "f64_is_zero")]
    pub fr_cost: f64,
}

/// Namespace-qualified keyspace reference carried by keyspace-bound
/// operators.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyspaceRef {
    /// Namespace name.
    pub namespace: String,
    /// Keyspace name.
    pub keyspace: String,
    /// Binding alias.
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub as_alias: Option<String>,
}

impl KeyspaceRef {
    /// Builds a reference.
    pub fn new(
        namespace: impl Into<String>,
        keyspace: impl Into<String>,
        as_alias: Option<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            keyspace: keyspace.into(),
            as_alias,
        }
    }

    /// Alias items bind under: the explicit alias or the keyspace name.
    pub fn alias(&self) -> &str {
        self.as_alias.as_deref().unwrap_or(&self.keyspace)
    }
}

/// One projection term in a [`Operator::Project`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectTerm {
    /// Projected expression; absent for a bare star.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<Expr>,
    /// Star marker.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub star: bool,
    /// Output column name.
    #[serde(rename = "as", default, skip_serializing_if = "String::is_empty")]
    pub as_alias: String,
}

/// One ORDER BY term in an [`Operator::Order`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SortTerm {
    /// Sort key.
    pub expr: Expr,
    /// Descending when set.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub desc: bool,
}

/// Key/value pair of a SendInsert/SendUpsert.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InsertPair {
    /// Key expression.
    pub key: Expr,
    /// Value expression.
    pub value: Expr,
}

/// One SET assignment of a SendUpdate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateSet {
    /// Path within the document.
    pub path: Vec<String>,
    /// New value expression.
    pub value: Expr,
}

/// Physical operator descriptions.
///
/// The `"#operator"` discriminator doubles as the dispatch key during
/// decode; adding a variant is a wire-format change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "#operator")]
pub enum Operator {
    /// Emits a single empty item; drives FROM-less selects and
    /// values-style DML.
    DummyScan {},
    /// Full scan of a keyspace's primary index.
    PrimaryScan {
        /// Primary index name.
        index: String,
        /// Scanned keyspace.
        #[serde(flatten)]
        keyspace: KeyspaceRef,
        /// Pushed-down limit (offset already folded in).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<Expr>,
        /// Optimizer estimates.
        #[serde(flatten)]
        cost: Cost,
    },
    /// Secondary index scan driven by spans.
    IndexScan3 {
        /// Index name.
        index: String,
        /// Scanned keyspace.
        #[serde(flatten)]
        keyspace: KeyspaceRef,
        /// Composite key spans.
        spans: Spans2,
        /// Index key expressions surfaced without a fetch; non-empty means
        /// the scan is covering.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        covers: Vec<Expr>,
        /// Which keys the operator must surface.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index_projection: Option<IndexProjection>,
        /// Whether the scan preserves a requested order.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        ordered: bool,
        /// Pushed-down offset.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offset: Option<Expr>,
        /// Pushed-down limit.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<Expr>,
        /// Optimizer estimates.
        #[serde(flatten)]
        cost: Cost,
    },
    /// AND-combination of child scans by primary key.
    IntersectScan {
        /// Child scans over the same keyspace.
        scans: Vec<Operator>,
        /// Pushed-down limit.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<Expr>,
        /// Optimizer estimates.
        #[serde(flatten)]
        cost: Cost,
    },
    /// OR-combination of child scans by primary key.
    UnionScan {
        /// Child scans over the same keyspace.
        scans: Vec<Operator>,
        /// Pushed-down limit.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<Expr>,
        /// Optimizer estimates.
        #[serde(flatten)]
        cost: Cost,
    },
    /// Document fetch by primary key.
    Fetch {
        /// Fetched keyspace.
        #[serde(flatten)]
        keyspace: KeyspaceRef,
        /// Optimizer estimates.
        #[serde(flatten)]
        cost: Cost,
    },
    /// Row filter.
    Filter {
        /// Boolean condition.
        condition: Expr,
        /// Optimizer estimates.
        #[serde(flatten)]
        cost: Cost,
    },
    /// Projection.
    Project {
        /// Projection terms.
        terms: Vec<ProjectTerm>,
        /// RAW projection: emit the bare value of the single term.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        raw: bool,
    },
    /// Nested-loop join: the child subtree runs once per left item.
    NLJoin {
        /// Alias the right side binds under.
        alias: String,
        /// Join condition.
        on: Expr,
        /// Left-outer join when set.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        outer: bool,
        /// Right-side plan.
        #[serde(rename = "~child")]
        child: Box<Operator>,
    },
    /// Hash join: builds on the right, probes with the left.
    HashJoin {
        /// Alias the right side binds under.
        alias: String,
        /// Probe-side key over left items.
        probe: Expr,
        /// Build-side key over right items.
        build: Expr,
        /// Left-outer join when set.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        outer: bool,
        /// Right-side plan.
        #[serde(rename = "~child")]
        child: Box<Operator>,
    },
    /// Nested-loop nest: matching right rows aggregate into an array.
    NLNest {
        /// Alias the nested array binds under.
        alias: String,
        /// Nest condition.
        on: Expr,
        /// Keep unmatched left rows with an empty nest.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        outer: bool,
        /// Right-side plan.
        #[serde(rename = "~child")]
        child: Box<Operator>,
    },
    /// Rebinds each incoming item under a new alias.
    Alias {
        /// New binding alias.
        #[serde(rename = "as")]
        as_alias: String,
    },
    /// Array flattening.
    Unnest {
        /// Array-valued expression over the incoming item.
        expr: Expr,
        /// Alias each element binds under.
        alias: String,
        /// Keep rows whose array is empty or missing.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        outer: bool,
    },
    /// Total sort.
    Order {
        /// Sort terms, outermost first.
        terms: Vec<SortTerm>,
        /// Offset folded into the sort when pushed down.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offset: Option<Expr>,
        /// Limit folded into the sort when pushed down.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<Expr>,
        /// Optimizer estimates.
        #[serde(flatten)]
        cost: Cost,
    },
    /// Row skip.
    Offset {
        /// Skip count expression.
        expr: Expr,
    },
    /// Row cap.
    Limit {
        /// Cap expression.
        expr: Expr,
    },
    /// Duplicate elimination.
    Distinct {},
    /// Per-item aggregation seed.
    InitialGroup {
        /// Grouping keys.
        keys: Vec<Expr>,
        /// Aggregate expressions.
        aggregates: Vec<Expr>,
    },
    /// Partial-aggregate merge across parallel inputs.
    IntermediateGroup {
        /// Grouping keys.
        keys: Vec<Expr>,
        /// Aggregate expressions.
        aggregates: Vec<Expr>,
    },
    /// Final aggregate computation and group emission.
    FinalGroup {
        /// Grouping keys.
        keys: Vec<Expr>,
        /// Aggregate expressions.
        aggregates: Vec<Expr>,
    },
    /// Concatenation of child outputs (UNION ALL).
    UnionAll {
        /// Combined subplans.
        #[serde(rename = "~children")]
        children: Vec<Operator>,
    },
    /// Rows present in both children (INTERSECT ALL).
    IntersectAll {
        /// First subplan.
        #[serde(rename = "~first")]
        first: Box<Operator>,
        /// Second subplan.
        #[serde(rename = "~second")]
        second: Box<Operator>,
    },
    /// Rows of the first child absent from the second (EXCEPT ALL).
    ExceptAll {
        /// First subplan.
        #[serde(rename = "~first")]
        first: Box<Operator>,
        /// Second subplan.
        #[serde(rename = "~second")]
        second: Box<Operator>,
    },
    /// Result delivery to the client stream.
    Stream {},
    /// Result collection into a buffer (subqueries, EXECUTE).
    Collect {},
    /// Runs children one after another, piping output to input.
    Sequence {
        /// Stages in execution order.
        #[serde(rename = "~children")]
        children: Vec<Operator>,
    },
    /// Runs copies of the child over a shared input.
    Parallel {
        /// Replicated subtree.
        #[serde(rename = "~child")]
        child: Box<Operator>,
        /// Copy cap; zero means the host CPU count.
        #[serde(
            rename = "maxParallelism",
            default,
            skip_serializing_if = "usize_is_zero"
        )]
        max_parallelism: usize,
    },
    /// Insert of literal key/value pairs.
    SendInsert {
        /// Target keyspace.
        #[serde(flatten)]
        keyspace: KeyspaceRef,
        /// Pairs to insert.
        pairs: Vec<InsertPair>,
    },
    /// Upsert of literal key/value pairs.
    SendUpsert {
        /// Target keyspace.
        #[serde(flatten)]
        keyspace: KeyspaceRef,
        /// Pairs to upsert.
        pairs: Vec<InsertPair>,
    },
    /// Deletes incoming items by their `meta.id`.
    SendDelete {
        /// Target keyspace.
        #[serde(flatten)]
        keyspace: KeyspaceRef,
        /// Mutation cap.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<Expr>,
    },
    /// Updates incoming items by their `meta.id`.
    SendUpdate {
        /// Target keyspace.
        #[serde(flatten)]
        keyspace: KeyspaceRef,
        /// SET assignments.
        set: Vec<UpdateSet>,
        /// UNSET paths.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        unset: Vec<Vec<String>>,
        /// Mutation cap.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<Expr>,
    },
    /// Routes source rows to matched/unmatched actions against a target
    /// keyspace.
    Merge {
        /// Target keyspace.
        #[serde(flatten)]
        keyspace: KeyspaceRef,
        /// Expression over source rows yielding the target key.
        key: Expr,
        /// SET assignments applied to matched documents.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        update: Option<Vec<UpdateSet>>,
        /// Delete matched documents when set.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        delete: bool,
        /// Document built for unmatched rows.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        insert: Option<Expr>,
    },
}

/// A keyspace or index reference recorded by a plan.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetadataRef {
    /// Namespace name.
    pub namespace: String,
    /// Keyspace name.
    pub keyspace: String,
    /// Index name; `None` for the keyspace itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
}

impl Operator {
    /// Discriminator string for messages and dispatch.
    pub fn name(&self) -> &'static str {
        match self {
            Operator::DummyScan {} => "DummyScan",
            Operator::PrimaryScan { .. } => "PrimaryScan",
            Operator::IndexScan3 { .. } => "IndexScan3",
            Operator::IntersectScan { .. } => "IntersectScan",
            Operator::UnionScan { .. } => "UnionScan",
            Operator::Fetch { .. } => "Fetch",
            Operator::Filter { .. } => "Filter",
            Operator::Project { .. } => "Project",
            Operator::NLJoin { .. } => "NLJoin",
            Operator::HashJoin { .. } => "HashJoin",
            Operator::NLNest { .. } => "NLNest",
            Operator::Alias { .. } => "Alias",
            Operator::Unnest { .. } => "Unnest",
            Operator::Order { .. } => "Order",
            Operator::Offset { .. } => "Offset",
            Operator::Limit { .. } => "Limit",
            Operator::Distinct {} => "Distinct",
            Operator::InitialGroup { .. } => "InitialGroup",
            Operator::IntermediateGroup { .. } => "IntermediateGroup",
            Operator::FinalGroup { .. } => "FinalGroup",
            Operator::UnionAll { .. } => "UnionAll",
            Operator::IntersectAll { .. } => "IntersectAll",
            Operator::ExceptAll { .. } => "ExceptAll",
            Operator::Stream {} => "Stream",
            Operator::Collect {} => "Collect",
            Operator::Sequence { .. } => "Sequence",
            Operator::Parallel { .. } => "Parallel",
            Operator::SendInsert { .. } => "SendInsert",
            Operator::SendUpsert { .. } => "SendUpsert",
            Operator::SendDelete { .. } => "SendDelete",
            Operator::SendUpdate { .. } => "SendUpdate",
            Operator::Merge { .. } => "Merge",
        }
    }

    /// Immediate child operators.
    pub fn children(&self) -> Vec<&Operator> {
        match self {
            Operator::IntersectScan { scans, .. } | Operator::UnionScan { scans, .. } => {
                scans.iter().collect()
            }
            Operator::Sequence { children } | Operator::UnionAll { children } => {
                children.iter().collect()
            }
            Operator::IntersectAll { first, second } | Operator::ExceptAll { first, second } => {
                vec![first, second]
            }
            Operator::Parallel { child, .. }
            | Operator::NLJoin { child, .. }
            | Operator::HashJoin { child, .. }
            | Operator::NLNest { child, .. } => vec![child],
            _ => Vec::new(),
        }
    }

    /// Whether executing the subtree cannot mutate documents.
    pub fn readonly(&self) -> bool {
        if matches!(
            self,
            Operator::SendInsert { .. }
                | Operator::SendUpsert { .. }
                | Operator::SendDelete { .. }
                | Operator::SendUpdate { .. }
                | Operator::Merge { .. }
        ) {
            return false;
        }
        self.children().iter().all(|c| c.readonly())
    }

    /// Effective fan-out of a `Parallel` operator.
    pub fn max_parallelism(&self) -> usize {
        match self {
            Operator::Parallel {
                max_parallelism, ..
            } if *max_parallelism > 0 => *max_parallelism,
            _ => config::max_parallelism(),
        }
    }

    /// Collects every keyspace and index reference in the subtree.
    pub fn collect_refs(&self, out: &mut Vec<MetadataRef>) {
        let mut push_keyspace = |ks: &KeyspaceRef, index: Option<&str>| {
            let r = MetadataRef {
                namespace: ks.namespace.clone(),
                keyspace: ks.keyspace.clone(),
                index: index.map(str::to_owned),
            };
            if !out.contains(&r) {
                out.push(r);
            }
        };
        match self {
            Operator::PrimaryScan {
                index, keyspace, ..
            }
            | Operator::IndexScan3 {
                index, keyspace, ..
            } => {
                push_keyspace(keyspace, None);
                push_keyspace(keyspace, Some(index));
            }
            Operator::Fetch { keyspace, .. }
            | Operator::SendInsert { keyspace, .. }
            | Operator::SendUpsert { keyspace, .. }
            | Operator::SendDelete { keyspace, .. }
            | Operator::SendUpdate { keyspace, .. }
            | Operator::Merge { keyspace, .. } => push_keyspace(keyspace, None),
            _ => {}
        }
        for child in self.children() {
            child.collect_refs(out);
        }
    }

    /// Re-resolves every referenced keyspace and index against the live
    /// datastore. Returns false iff any resolution fails.
    pub fn verify(&self, datastore: &dyn Datastore) -> bool {
        let mut refs = Vec::new();
        self.collect_refs(&mut refs);
        refs.iter().all(|r| resolve_version(datastore, r).is_ok())
    }
}

pub(crate) fn resolve_version(datastore: &dyn Datastore, r: &MetadataRef) -> Result<u64> {
    let keyspace = datastore.keyspace(&r.namespace, &r.keyspace)?;
    match &r.index {
        None => Ok(keyspace.metadata_version()),
        Some(name) => match keyspace.index_by_name(name)? {
            Some(ix) => Ok(ix.metadata_version()),
            None => Err(crate::errors::Error::Datastore {
                reason: format!("no such index: {name}"),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_scan() -> Operator {
        Operator::IndexScan3 {
            index: "ix_total".into(),
            keyspace: KeyspaceRef::new("default", "orders", Some("o".into())),
            spans: vec![Span2::point(Expr::literal(5.0))],
            covers: Vec::new(),
            index_projection: Some(IndexProjection::primary_only()),
            ordered: false,
            offset: None,
            limit: None,
            cost: Cost::default(),
        }
    }

    #[test]
    fn discriminator_appears_in_json() {
        let json = serde_json::to_value(sample_scan()).unwrap();
        assert_eq!(json["#operator"], "IndexScan3");
        assert_eq!(json["namespace"], "default");
        assert_eq!(json["as"], "o");
        // Zero-valued costs are omitted.
        assert!(json.get("cost").is_none());
    }

    #[test]
    fn children_serialize_under_tilde_names() {
        let plan = Operator::Sequence {
            children: vec![
                sample_scan(),
                Operator::Parallel {
                    child: Box::new(Operator::Stream {}),
                    max_parallelism: 0,
                },
            ],
        };
        let json = serde_json::to_value(&plan).unwrap();
        assert!(json["~children"].is_array());
        assert_eq!(json["~children"][1]["~child"]["#operator"], "Stream");
        assert!(json["~children"][1].get("maxParallelism").is_none());
    }

    #[test]
    fn round_trip_is_structural() {
        let plan = Operator::Sequence {
            children: vec![
                Operator::IntersectScan {
                    scans: vec![sample_scan(), sample_scan()],
                    limit: Some(Expr::literal(10.0)),
                    cost: Cost::default(),
                },
                Operator::Fetch {
                    keyspace: KeyspaceRef::new("default", "orders", None),
                    cost: Cost::default(),
                },
                Operator::Filter {
                    condition: Expr::literal(true),
                    cost: Cost {
                        cost: 1.5,
                        cardinality: 10.0,
                        size: 128,
                        fr_cost: 0.5,
                    },
                },
                Operator::Stream {},
            ],
        };
        let text = serde_json::to_string(&plan).unwrap();
        let back: Operator = serde_json::from_str(&text).unwrap();
        assert_eq!(plan, back);
    }

    #[test]
    fn readonly_spots_mutations() {
        assert!(sample_scan().readonly());
        let dml = Operator::Sequence {
            children: vec![Operator::SendDelete {
                keyspace: KeyspaceRef::new("default", "orders", None),
                limit: None,
            }],
        };
        assert!(!dml.readonly());
    }

    #[test]
    fn refs_are_deduplicated() {
        let plan = Operator::IntersectScan {
            scans: vec![sample_scan(), sample_scan()],
            limit: None,
            cost: Cost::default(),
        };
        let mut refs = Vec::new();
        plan.collect_refs(&mut refs);
        assert_eq!(refs.len(), 2); // keyspace + one index
    }
}

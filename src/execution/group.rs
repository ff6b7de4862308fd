//! Three-phase grouping: initial (per-item seed), intermediate (partial
//! merge across parallel inputs), final (finalisation and emission).
//!
//! Partial groups travel between phases as ordinary items shaped
//! `{"keys": [...], "aggs": {canonical: state}}`, so the phases compose
//! over channels like any other operators.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::errors::{Error, Result};
use crate::expression::{AggKind, Expr};
use crate::value::{AnnotatedValue, Value};

use super::base::{recv_item, send_item, set_path, ItemReceiver, ItemSender};
use super::context::ExecContext;

/// Accumulator for one aggregate within one group.
enum AggAcc {
    Plain(AggKind, PlainState),
    /// DISTINCT aggregates buffer the deduplicated argument values and
    /// aggregate at finalisation.
    Distinct(AggKind, Vec<Value>, HashSet<String>),
}

enum PlainState {
    Count(f64),
    Sum { sum: f64, count: u64 },
    Avg { sum: f64, count: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
    /// Welford accumulation for sample standard deviation.
    Stddev { count: f64, mean: f64, m2: f64 },
}

impl PlainState {
    fn new(kind: AggKind) -> Self {
        match kind {
            AggKind::Count => PlainState::Count(0.0),
            AggKind::Sum => PlainState::Sum { sum: 0.0, count: 0 },
            AggKind::Avg => PlainState::Avg { sum: 0.0, count: 0 },
            AggKind::Min => PlainState::Min(None),
            AggKind::Max => PlainState::Max(None),
            AggKind::StddevSamp => PlainState::Stddev {
                count: 0.0,
                mean: 0.0,
                m2: 0.0,
            },
        }
    }

    fn update(&mut self, arg: &Value) {
        match self {
            PlainState::Count(n) => {
                if !matches!(arg, Value::Missing | Value::Null) {
                    *n += 1.0;
                }
            }
            PlainState::Sum { sum, count } | PlainState::Avg { sum, count } => {
                if let Value::Number(v) = arg {
                    *sum += v;
                    *count += 1;
                }
            }
            PlainState::Min(cur) => {
                if !matches!(arg, Value::Missing | Value::Null) {
                    let replace = cur
                        .as_ref()
                        .map(|c| arg.collate(c) == std::cmp::Ordering::Less)
                        .unwrap_or(true);
                    if replace {
                        *cur = Some(arg.clone());
                    }
                }
            }
            PlainState::Max(cur) => {
                if !matches!(arg, Value::Missing | Value::Null) {
                    let replace = cur
                        .as_ref()
                        .map(|c| arg.collate(c) == std::cmp::Ordering::Greater)
                        .unwrap_or(true);
                    if replace {
                        *cur = Some(arg.clone());
                    }
                }
            }
            PlainState::Stddev { count, mean, m2 } => {
                if let Value::Number(v) = arg {
                    *count += 1.0;
                    let delta = v - *mean;
                    *mean += delta / *count;
                    *m2 += delta * (v - *mean);
                }
            }
        }
    }

    fn merge(&mut self, other: &PlainState) {
        match (self, other) {
            (PlainState::Count(a), PlainState::Count(b)) => *a += b,
            (
                PlainState::Sum { sum, count },
                PlainState::Sum {
                    sum: s2,
                    count: c2,
                },
            )
            | (
                PlainState::Avg { sum, count },
                PlainState::Avg {
                    sum: s2,
                    count: c2,
                },
            ) => {
                *sum += s2;
                *count += c2;
            }
            (PlainState::Min(a), PlainState::Min(Some(b))) => {
                let replace = a
                    .as_ref()
                    .map(|c| b.collate(c) == std::cmp::Ordering::Less)
                    .unwrap_or(true);
                if replace {
                    *a = Some(b.clone());
                }
            }
            (PlainState::Max(a), PlainState::Max(Some(b))) => {
                let replace = a
                    .as_ref()
                    .map(|c| b.collate(c) == std::cmp::Ordering::Greater)
                    .unwrap_or(true);
                if replace {
                    *a = Some(b.clone());
                }
            }
            (PlainState::Min(_), PlainState::Min(None))
            | (PlainState::Max(_), PlainState::Max(None)) => {}
            (
                PlainState::Stddev { count, mean, m2 },
                PlainState::Stddev {
                    count: c2,
                    mean: mean2,
                    m2: m22,
                },
            ) => {
                // Chan et al. parallel combination of Welford states.
                if *c2 > 0.0 {
                    let total = *count + c2;
                    let delta = mean2 - *mean;
                    *m2 += m22 + delta * delta * *count * c2 / total;
                    *mean += delta * c2 / total;
                    *count = total;
                }
            }
            _ => {}
        }
    }

    fn finalize(&self) -> Value {
        match self {
            PlainState::Count(n) => Value::Number(*n),
            PlainState::Sum { sum, count } => {
                if *count == 0 {
                    Value::Null
                } else {
                    Value::Number(*sum)
                }
            }
            PlainState::Avg { sum, count } => {
                if *count == 0 {
                    Value::Null
                } else {
                    Value::Number(sum / *count as f64)
                }
            }
            PlainState::Min(v) | PlainState::Max(v) => v.clone().unwrap_or(Value::Null),
            PlainState::Stddev { count, m2, .. } => {
                if *count < 2.0 {
                    Value::Null
                } else {
                    Value::Number((m2 / (count - 1.0)).sqrt())
                }
            }
        }
    }

    fn to_value(&self) -> Value {
        match self {
            PlainState::Count(n) => Value::object([("count", Value::Number(*n))]),
            PlainState::Sum { sum, count } | PlainState::Avg { sum, count } => Value::object([
                ("sum", Value::Number(*sum)),
                ("n", Value::Number(*count as f64)),
            ]),
            PlainState::Min(v) | PlainState::Max(v) => match v {
                Some(v) => Value::object([("v", v.clone())]),
                None => Value::object(Vec::<(String, crate::value::Value)>::new()),
            },
            PlainState::Stddev { count, mean, m2 } => Value::object([
                ("count", Value::Number(*count)),
                ("mean", Value::Number(*mean)),
                ("m2", Value::Number(*m2)),
            ]),
        }
    }

    fn from_value(kind: AggKind, v: &Value) -> Self {
        let num = |name: &str| v.field(name).as_number().unwrap_or(0.0);
        match kind {
            AggKind::Count => PlainState::Count(num("count")),
            AggKind::Sum => PlainState::Sum {
                sum: num("sum"),
                count: num("n") as u64,
            },
            AggKind::Avg => PlainState::Avg {
                sum: num("sum"),
                count: num("n") as u64,
            },
            AggKind::Min => PlainState::Min(match v.field("v") {
                Value::Missing => None,
                other => Some(other),
            }),
            AggKind::Max => PlainState::Max(match v.field("v") {
                Value::Missing => None,
                other => Some(other),
            }),
            AggKind::StddevSamp => PlainState::Stddev {
                count: num("count"),
                mean: num("mean"),
                m2: num("m2"),
            },
        }
    }
}

impl AggAcc {
    fn new(kind: AggKind, distinct: bool) -> Self {
        if distinct {
            AggAcc::Distinct(kind, Vec::new(), HashSet::new())
        } else {
            AggAcc::Plain(kind, PlainState::new(kind))
        }
    }

    fn update(&mut self, arg: &Value) {
        match self {
            AggAcc::Plain(_, state) => state.update(arg),
            AggAcc::Distinct(_, values, seen) => {
                if matches!(arg, Value::Missing | Value::Null) {
                    return;
                }
                let fp = serde_json::to_string(arg).unwrap_or_default();
                if seen.insert(fp) {
                    values.push(arg.clone());
                }
            }
        }
    }

    fn merge_value(&mut self, partial: &Value) {
        match self {
            AggAcc::Plain(kind, state) => {
                state.merge(&PlainState::from_value(*kind, partial));
            }
            AggAcc::Distinct(_, values, seen) => {
                if let Value::Array(incoming) = partial.field("distinct") {
                    for v in incoming {
                        let fp = serde_json::to_string(&v).unwrap_or_default();
                        if seen.insert(fp) {
                            values.push(v);
                        }
                    }
                }
            }
        }
    }

    fn to_value(&self) -> Value {
        match self {
            AggAcc::Plain(_, state) => state.to_value(),
            AggAcc::Distinct(_, values, _) => {
                Value::object([("distinct", Value::Array(values.clone()))])
            }
        }
    }

    fn finalize(&self) -> Value {
        match self {
            AggAcc::Plain(_, state) => state.finalize(),
            AggAcc::Distinct(kind, values, _) => {
                let mut state = PlainState::new(*kind);
                for v in values {
                    state.update(v);
                }
                state.finalize()
            }
        }
    }
}

struct GroupMap {
    groups: HashMap<String, (Vec<Value>, Vec<AggAcc>)>,
    specs: Vec<(AggKind, Option<Expr>, bool, String)>,
}

impl GroupMap {
    fn new(aggregates: &[Expr]) -> Result<Self> {
        let mut specs = Vec::with_capacity(aggregates.len());
        for agg in aggregates {
            let Expr::Aggregate {
                kind,
                expr,
                distinct,
            } = agg
            else {
                return Err(Error::internal("group operator given a non-aggregate"));
            };
            specs.push((
                *kind,
                expr.as_deref().cloned(),
                *distinct,
                agg.canonical(),
            ));
        }
        Ok(Self {
            groups: HashMap::new(),
            specs,
        })
    }
}

fn group_entry<'m>(
    groups: &'m mut HashMap<String, (Vec<Value>, Vec<AggAcc>)>,
    specs: &[(AggKind, Option<Expr>, bool, String)],
    keys: Vec<Value>,
) -> &'m mut (Vec<Value>, Vec<AggAcc>) {
    let fingerprint = serde_json::to_string(&Value::Array(keys.clone())).unwrap_or_default();
    groups.entry(fingerprint).or_insert_with(|| {
        let accs = specs
            .iter()
            .map(|(kind, _, distinct, _)| AggAcc::new(*kind, *distinct))
            .collect();
        (keys, accs)
    })
}

fn eval_keys(keys: &[Expr], scope: &Value, ctx: &ExecContext) -> Result<Vec<Value>> {
    keys.iter().map(|k| k.evaluate(scope, ctx)).collect()
}

/// Emits one partial item per group.
fn emit_partials(map: GroupMap, ctx: &ExecContext, output: &ItemSender) {
    for (_, (keys, accs)) in map.groups {
        let mut aggs: BTreeMap<String, Value> = BTreeMap::new();
        for ((_, _, _, canonical), acc) in map.specs.iter().zip(accs.iter()) {
            aggs.insert(canonical.clone(), acc.to_value());
        }
        let partial = Value::object([
            ("keys", Value::Array(keys)),
            ("aggs", Value::Object(aggs)),
        ]);
        if !send_item(output, AnnotatedValue::new(partial), ctx) {
            return;
        }
    }
}

pub(super) fn run_initial(
    keys: &[Expr],
    aggregates: &[Expr],
    ctx: &ExecContext,
    input: Option<ItemReceiver>,
    output: ItemSender,
) {
    let Some(input) = input else { return };
    let mut map = match GroupMap::new(aggregates) {
        Ok(map) => map,
        Err(err) => {
            ctx.fail(err);
            return;
        }
    };
    while let Some(item) = recv_item(&input, ctx) {
        let scope = item.value();
        let key_values = match eval_keys(keys, scope, ctx) {
            Ok(kv) => kv,
            Err(err) => {
                ctx.fail(err);
                return;
            }
        };
        let (_, accs) = group_entry(&mut map.groups, &map.specs, key_values);
        for (i, (_, arg_expr, _, _)) in map.specs.iter().enumerate() {
            let arg = match arg_expr {
                // COUNT(*) counts rows.
                None => Value::TRUE,
                Some(e) => match e.evaluate(scope, ctx) {
                    Ok(v) => v,
                    Err(err) => {
                        ctx.fail(err);
                        return;
                    }
                },
            };
            accs[i].update(&arg);
        }
    }
    if !ctx.stopped() {
        emit_partials(map, ctx, &output);
    }
}

fn run_merge_phase(
    aggregates: &[Expr],
    ctx: &ExecContext,
    input: ItemReceiver,
) -> Option<GroupMap> {
    let mut map = match GroupMap::new(aggregates) {
        Ok(map) => map,
        Err(err) => {
            ctx.fail(err);
            return None;
        }
    };
    while let Some(item) = recv_item(&input, ctx) {
        let keys = match item.value().field("keys") {
            Value::Array(keys) => keys,
            _ => {
                ctx.fail(Error::InvalidValue {
                    reason: "malformed partial group item".into(),
                });
                return None;
            }
        };
        let aggs = item.value().field("aggs");
        let (_, accs) = group_entry(&mut map.groups, &map.specs, keys);
        for (i, (_, _, _, canonical)) in map.specs.iter().enumerate() {
            let partial = aggs.field(canonical);
            accs[i].merge_value(&partial);
        }
    }
    Some(map)
}

pub(super) fn run_intermediate(
    _keys: &[Expr],
    aggregates: &[Expr],
    ctx: &ExecContext,
    input: Option<ItemReceiver>,
    output: ItemSender,
) {
    let Some(input) = input else { return };
    if let Some(map) = run_merge_phase(aggregates, ctx, input) {
        if !ctx.stopped() {
            emit_partials(map, ctx, &output);
        }
    }
}

pub(super) fn run_final(
    keys: &[Expr],
    aggregates: &[Expr],
    ctx: &ExecContext,
    input: Option<ItemReceiver>,
    output: ItemSender,
) {
    let Some(input) = input else { return };
    let Some(map) = run_merge_phase(aggregates, ctx, input) else {
        return;
    };
    if ctx.stopped() {
        return;
    }
    for (_, (key_values, accs)) in map.groups {
        let mut row = Value::object(Vec::<(String, crate::value::Value)>::new());
        for (key_expr, key_value) in keys.iter().zip(key_values.iter()) {
            match key_expr {
                Expr::Field(path) => set_path(&mut row, path, key_value.clone()),
                other => set_path(
                    &mut row,
                    std::slice::from_ref(&other.canonical()),
                    key_value.clone(),
                ),
            }
        }
        for ((_, _, _, canonical), acc) in map.specs.iter().zip(accs.iter()) {
            set_path(
                &mut row,
                std::slice::from_ref(canonical),
                acc.finalize(),
            );
        }
        if !send_item(&output, AnnotatedValue::new(row), ctx) {
            return;
        }
    }
}

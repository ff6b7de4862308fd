//! Statement evaluation: the seam tying the parser collaborator, semantic
//! checks, the planner, the prepared cache, and the executor together.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::algebra::{semantic_check, Parser, Statement};
use crate::config::FeatureControls;
use crate::datastore::Datastore;
use crate::errors::Result;
use crate::execution::{run, ExecContext, ExecutionResult};
use crate::expression::SimpleContext;
use crate::planner::build_prepared;
use crate::prepareds::{Prepareds, Remote, OPT_REMOTE, OPT_TRACK, OPT_VERIFY};
use crate::value::Value;

/// Per-request options.
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    /// Positional placeholder values.
    pub positional: Vec<Value>,
    /// Named placeholder values.
    pub named: HashMap<String, Value>,
    /// Request deadline.
    pub timeout: Option<Duration>,
}

/// The query engine core: one instance per process.
pub struct Engine {
    datastore: Arc<dyn Datastore>,
    parser: Arc<dyn Parser>,
    prepareds: Arc<Prepareds>,
    namespace: String,
    index_api_version: u32,
    feature_controls: FeatureControls,
    auto_prepare: bool,
}

impl Engine {
    /// Builds an engine over its collaborators.
    pub fn new(
        datastore: Arc<dyn Datastore>,
        parser: Arc<dyn Parser>,
        remote: Arc<dyn Remote>,
        namespace: impl Into<String>,
        prepareds_limit: usize,
        index_api_version: u32,
        feature_controls: FeatureControls,
    ) -> Self {
        let namespace = namespace.into();
        let prepareds = Arc::new(Prepareds::new(
            prepareds_limit,
            Arc::clone(&datastore),
            Arc::clone(&parser),
            remote,
            namespace.clone(),
            index_api_version,
            feature_controls,
        ));
        Self {
            datastore,
            parser,
            prepareds,
            namespace,
            index_api_version,
            feature_controls,
            auto_prepare: false,
        }
    }

    /// Enables auto-prepare: parameter-free statements are cached under
    /// deterministic names and reused across requests.
    pub fn with_auto_prepare(mut self, enabled: bool) -> Self {
        self.auto_prepare = enabled;
        self
    }

    /// The prepared-statement cache.
    pub fn prepareds(&self) -> &Arc<Prepareds> {
        &self.prepareds
    }

    /// Parses, checks, plans, and runs one statement.
    pub fn execute(&self, text: &str) -> Result<ExecutionResult> {
        self.execute_with(text, RequestOptions::default())
    }

    /// [`Engine::execute`] with request options.
    pub fn execute_with(&self, text: &str, options: RequestOptions) -> Result<ExecutionResult> {
        let request_started = Instant::now();
        let stmt = self.parser.parse(text)?;
        semantic_check(&stmt, self.feature_controls)?;

        match stmt {
            Statement::Prepare {
                name,
                force,
                statement,
                text: inner_text,
            } => {
                let mut inner = *statement;
                inner.formalize()?;
                let prepared =
                    self.prepareds
                        .prepare(name.as_deref(), force, &inner, &inner_text)?;
                let mut result = ExecutionResult::default();
                result.rows.push(Value::object([
                    ("name", Value::String(prepared.name.clone())),
                    ("encoded_plan", Value::String(prepared.encoded_plan.clone())),
                ]));
                Ok(result)
            }
            Statement::Execute { prepared } => {
                let reference = prepared.evaluate(&Value::Missing, &SimpleContext::default())?;
                let plan = self.prepareds.get_prepared(
                    &reference,
                    OPT_TRACK | OPT_VERIFY | OPT_REMOTE,
                )?;
                self.run_prepared(&plan, options, request_started)
            }
            Statement::Explain(inner) => {
                let mut inner = *inner;
                inner.formalize()?;
                let prepared = build_prepared(
                    &inner,
                    "",
                    text,
                    self.datastore.as_ref(),
                    &self.namespace,
                    self.index_api_version,
                    self.feature_controls,
                )?;
                let plan_json: Value = serde_json::to_value(&prepared.operator)
                    .map(Value::from)
                    .unwrap_or(Value::Null);
                let mut result = ExecutionResult::default();
                result.rows.push(Value::object([
                    ("plan", plan_json),
                    ("text", Value::String(text.to_owned())),
                ]));
                Ok(result)
            }
            Statement::Advise(inner) => {
                let mut inner = *inner;
                inner.formalize()?;
                let prepared = build_prepared(
                    &inner,
                    "",
                    text,
                    self.datastore.as_ref(),
                    &self.namespace,
                    self.index_api_version,
                    self.feature_controls,
                )?;
                let advice = advise_from_plan(&prepared.operator);
                let mut result = ExecutionResult::default();
                result.rows.push(Value::object([
                    ("advice", Value::String(advice)),
                    ("text", Value::String(text.to_owned())),
                ]));
                Ok(result)
            }
            mut other => {
                other.formalize()?;
                let prepared = self.plan_statement(&other, text)?;
                self.run_prepared(&prepared, options, request_started)
            }
        }
    }

    /// Plans an ad-hoc statement, going through the auto-prepare cache when
    /// enabled.
    fn plan_statement(&self, stmt: &Statement, text: &str) -> Result<Arc<crate::plan::Prepared>> {
        let cacheable = self.auto_prepare
            && stmt.params() == 0
            && !matches!(stmt.type_name(), "EXPLAIN" | "EXECUTE" | "PREPARE");
        if cacheable {
            let name = Prepareds::auto_prepare_name(
                text,
                self.index_api_version,
                self.feature_controls,
            );
            if let Some(plan) = self.prepareds.get_auto_prepare_plan(
                &name,
                text,
                self.index_api_version,
                self.feature_controls,
            ) {
                debug!(%name, "auto prepare hit");
                return Ok(plan);
            }
            let prepared = Arc::new(build_prepared(
                stmt,
                &name,
                text,
                self.datastore.as_ref(),
                &self.namespace,
                self.index_api_version,
                self.feature_controls,
            )?);
            self.prepareds
                .add_auto_prepare_plan(stmt, Arc::clone(&prepared));
            return Ok(prepared);
        }
        Ok(Arc::new(build_prepared(
            stmt,
            "",
            text,
            self.datastore.as_ref(),
            &self.namespace,
            self.index_api_version,
            self.feature_controls,
        )?))
    }

    fn run_prepared(
        &self,
        prepared: &crate::plan::Prepared,
        options: RequestOptions,
        request_started: Instant,
    ) -> Result<ExecutionResult> {
        let ctx = ExecContext::with_options(
            Arc::clone(&self.datastore),
            options.timeout,
            crate::config::pipeline_cap(),
        )
        .with_params(options.positional, options.named);
        let service_started = Instant::now();
        let result = run(&prepared.operator, &ctx);
        self.prepareds.record_prepared_metrics(
            prepared,
            request_started.elapsed(),
            service_started.elapsed(),
        );
        result
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        crate::execution::drain_pools();
    }
}

fn advise_from_plan(op: &crate::plan::Operator) -> String {
    use crate::plan::Operator;
    let mut advice = Vec::new();
    fn walk(op: &Operator, advice: &mut Vec<String>) {
        if let Operator::PrimaryScan { keyspace, .. } = op {
            advice.push(format!(
                "predicate on {} is not servable by any index; consider CREATE INDEX on the filtered fields",
                keyspace.keyspace
            ));
        }
        match op {
            Operator::Sequence { children } | Operator::UnionAll { children } => {
                for c in children {
                    walk(c, advice);
                }
            }
            Operator::IntersectScan { scans, .. } | Operator::UnionScan { scans, .. } => {
                for c in scans {
                    walk(c, advice);
                }
            }
            Operator::Parallel { child, .. }
            | Operator::NLJoin { child, .. }
            | Operator::HashJoin { child, .. }
            | Operator::NLNest { child, .. } => walk(child, advice),
            _ => {}
        }
    }
    walk(op, &mut advice);
    if advice.is_empty() {
        "current indexes serve this statement".to_owned()
    } else {
        advice.join("; ")
    }
}

//! Collector and query execution.
//!
//! [`CollectorRunner`] resolves a target through the registry, runs its SQL on
//! a caller-supplied connection and passes every cell through the sanitizer.
//! A failing layer never fails the collector: the layer is returned with no
//! rows and its error message, and the remaining layers still run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::{Connection, QueryOutput, SqlParam};
use crate::error::{DbError, EngineError};
use crate::pack::QueryDef;
use crate::registry::{
    CollectorInfo, CollectorRegistry, CollectorTarget, QueryInfo, ResolvedCollector,
    resolve_collector, resolve_query,
};
use crate::result::{CollectorResult, LayerResult, LayerResults, QueryOutcome, QueryResult, Row};
use crate::sanitize::Sanitizer;

/// Per-run settings shared by all statements of one run.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    cancel: CancellationToken,
    interval_sec: Option<f64>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run that stops between statements once `token` is cancelled.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Sampling interval recorded in the result.
    pub fn with_interval(mut self, interval_sec: f64) -> Self {
        self.interval_sec = Some(interval_sec);
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn check(&self) -> Result<(), EngineError> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Query to run alongside a collector's layers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryInvocation {
    pub query_id: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// Ad-hoc named query invocation.
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    /// Collector the query belongs to; when absent the id must be unique
    /// across all matching collectors.
    pub collector: Option<CollectorTarget>,
    pub query_id: String,
    pub params: Map<String, Value>,
    pub positional: Vec<Value>,
}

impl QueryRequest {
    pub fn new(query_id: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            ..Self::default()
        }
    }

    pub fn in_collector(mut self, target: CollectorTarget) -> Self {
        self.collector = Some(target);
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn positional(mut self, args: Vec<Value>) -> Self {
        self.positional = args;
        self
    }
}

/// Runs collectors and named queries.
#[derive(Debug, Clone)]
pub struct CollectorRunner {
    registry: Arc<CollectorRegistry>,
    sanitizer: Sanitizer,
}

impl CollectorRunner {
    pub fn new(registry: Arc<CollectorRegistry>, sanitizer: Sanitizer) -> Self {
        Self {
            registry,
            sanitizer,
        }
    }

    pub fn registry(&self) -> &Arc<CollectorRegistry> {
        &self.registry
    }

    pub fn sanitizer(&self) -> &Sanitizer {
        &self.sanitizer
    }

    pub fn list_collectors(&self, conn: &mut dyn Connection, db_type: &str) -> Vec<CollectorInfo> {
        self.registry.list_collectors(conn, db_type)
    }

    pub fn list_queries(
        &self,
        conn: &mut dyn Connection,
        db_type: &str,
        collector: Option<&str>,
    ) -> Vec<QueryInfo> {
        self.registry.list_queries(conn, db_type, collector)
    }

    /// Runs every layer of the resolved collector.
    pub fn run_collector(
        &self,
        conn: &mut dyn Connection,
        db_type: &str,
        target: &CollectorTarget,
        ctx: &RunContext,
    ) -> Result<CollectorResult, EngineError> {
        self.run_collector_with(conn, db_type, target, &[], ctx)
    }

    /// Runs every layer of the resolved collector, then the listed queries
    /// of the same collector.
    pub fn run_collector_with(
        &self,
        conn: &mut dyn Connection,
        db_type: &str,
        target: &CollectorTarget,
        queries: &[QueryInvocation],
        ctx: &RunContext,
    ) -> Result<CollectorResult, EngineError> {
        ctx.check()?;
        let started = Instant::now();
        let matched = self.registry.matching_packs(conn, db_type);
        let resolved = resolve_collector(&matched.packs, target)?;
        let collector_ref = resolved.collector_ref();

        let mut layers = Vec::with_capacity(resolved.collector.layers.len());
        for (name, layer) in &resolved.collector.layers {
            ctx.check()?;
            let layer_started = Instant::now();
            let outcome = self.fetch(conn, &layer.sql, &[], layer.single_row);
            let (rows, error) = match outcome {
                Ok(rows) => {
                    debug!(
                        collector = %collector_ref,
                        layer = %name,
                        rows = rows.len(),
                        duration_ms = layer_started.elapsed().as_millis() as u64,
                        "layer collected"
                    );
                    (rows, None)
                }
                Err(e) => {
                    ctx.check()?;
                    warn!(collector = %collector_ref, layer = %name, error = %e, "layer failed");
                    (Vec::new(), Some(e.to_string()))
                }
            };
            layers.push(LayerResult {
                name: name.clone(),
                order: layer.order,
                render_hint: layer.render_hint.clone(),
                rows,
                error,
            });
        }

        let mut outcomes = BTreeMap::new();
        for invocation in queries {
            ctx.check()?;
            let outcome = self.run_invocation(conn, &resolved, invocation, ctx)?;
            outcomes.insert(invocation.query_id.clone(), outcome);
        }

        Ok(CollectorResult {
            db_type: db_type.to_string(),
            interval_sec: ctx.interval_sec,
            collector_id: resolved.collector_id.clone(),
            collector_ref,
            source_identifier: resolved.pack.source_identifier.clone(),
            server_version: matched.server_version,
            collected_at: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
            layers: LayerResults::from_unordered(layers),
            queries: outcomes,
        })
    }

    /// Runs one named query with bound parameters.
    ///
    /// Every declared parameter must be supplied by name or by position;
    /// otherwise nothing is executed.
    pub fn run_query(
        &self,
        conn: &mut dyn Connection,
        db_type: &str,
        request: &QueryRequest,
        ctx: &RunContext,
    ) -> Result<QueryResult, EngineError> {
        ctx.check()?;
        let matched = self.registry.matching_packs(conn, db_type);
        let resolved = resolve_query(&matched.packs, request.collector.as_ref(), &request.query_id)?;
        let params = bind_params(
            &request.query_id,
            &resolved.query,
            &request.params,
            &request.positional,
        )?;

        let rows = match self.fetch(conn, &resolved.query.sql, &params, resolved.query.single_row) {
            Ok(rows) => rows,
            Err(_) if ctx.is_cancelled() => return Err(EngineError::Cancelled),
            Err(e) => return Err(e.into()),
        };

        Ok(QueryResult {
            db_type: db_type.to_string(),
            collector_id: resolved.owner.collector_id.clone(),
            collector_ref: resolved.owner.collector_ref(),
            source_identifier: resolved.owner.pack.source_identifier.clone(),
            query_id: resolved.query_id,
            rows,
        })
    }

    fn run_invocation(
        &self,
        conn: &mut dyn Connection,
        owner: &ResolvedCollector,
        invocation: &QueryInvocation,
        ctx: &RunContext,
    ) -> Result<QueryOutcome, EngineError> {
        let Some(query) = owner.collector.queries.get(&invocation.query_id) else {
            return Ok(QueryOutcome::Error(
                EngineError::QueryNotFound(invocation.query_id.clone()).to_string(),
            ));
        };
        let params = match bind_params(&invocation.query_id, query, &invocation.params, &[]) {
            Ok(params) => params,
            Err(e) => return Ok(QueryOutcome::Error(e.to_string())),
        };
        match self.fetch(conn, &query.sql, &params, query.single_row) {
            Ok(rows) => Ok(QueryOutcome::Rows(rows)),
            Err(e) => {
                ctx.check()?;
                warn!(
                    collector = %owner.collector_ref(),
                    query = %invocation.query_id,
                    error = %e,
                    "query failed"
                );
                Ok(QueryOutcome::Error(e.to_string()))
            }
        }
    }

    fn fetch(
        &self,
        conn: &mut dyn Connection,
        sql: &str,
        params: &[SqlParam],
        single_row: bool,
    ) -> Result<Vec<Row>, DbError> {
        let max_rows = single_row.then_some(1);
        let QueryOutput { columns, rows } = conn.query(sql, params, max_rows)?;
        Ok(rows
            .iter()
            .take(max_rows.unwrap_or(usize::MAX))
            .map(|values| self.sanitizer.sanitize_row(&columns, values))
            .collect())
    }
}

/// Orders parameters by declaration, taking each from the named map or,
/// failing that, from the positional argument at the same index.
fn bind_params(
    query_id: &str,
    query: &QueryDef,
    named: &Map<String, Value>,
    positional: &[Value],
) -> Result<Vec<SqlParam>, EngineError> {
    if query.parameters.is_empty() {
        return Ok(positional.iter().map(SqlParam::from).collect());
    }

    for name in named.keys() {
        if !query.parameters.contains(name) {
            debug!(query = query_id, param = %name, "ignoring undeclared parameter");
        }
    }

    query
        .parameters
        .iter()
        .enumerate()
        .map(|(idx, name)| {
            named
                .get(name)
                .or_else(|| positional.get(idx))
                .map(SqlParam::from)
                .ok_or_else(|| {
                    EngineError::InvalidArgument(format!(
                        "query '{query_id}' requires parameter '{name}'"
                    ))
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDatabase, MockResponse};
    use crate::pack::{CollectorDef, LayerDef, QueryPack, VersionRange};
    use crate::value::DbValue;
    use serde_json::json;

    fn layer(order: i32, sql: &str, single_row: bool) -> LayerDef {
        LayerDef {
            order,
            sql: sql.to_string(),
            single_row,
            ..LayerDef::default()
        }
    }

    fn top_pack() -> QueryPack {
        let mut top = CollectorDef::default();
        top.layers.insert("waits".into(), layer(2, "select waits", false));
        top.layers.insert("cpu".into(), layer(1, "select cpu", false));
        top.layers.insert("activity".into(), layer(3, "select activity", true));
        top.queries.insert(
            "plan".into(),
            QueryDef {
                sql: "select plan($1, $2)".into(),
                parameters: vec!["sql_id".into(), "child".into()],
                ..QueryDef::default()
            },
        );
        top.queries.insert(
            "raw".into(),
            QueryDef {
                sql: "select raw".into(),
                ..QueryDef::default()
            },
        );
        QueryPack {
            db_type: "postgres".into(),
            source_identifier: "pg-core".into(),
            versions: VersionRange::any(),
            description: String::new(),
            collectors: [("top".to_string(), top)].into_iter().collect(),
        }
    }

    fn runner() -> CollectorRunner {
        let registry = CollectorRegistry::new(vec![top_pack()]).unwrap();
        CollectorRunner::new(Arc::new(registry), Sanitizer::default())
    }

    fn scripted() -> MockDatabase {
        let db = MockDatabase::new("16.1");
        db.on(
            "select cpu",
            MockResponse::table(&["pid", "cpu"], vec![vec![DbValue::Int(1), DbValue::Float(0.5)]]),
        );
        db.on(
            "select waits",
            MockResponse::table(&["event"], vec![vec!["Lock".into()], vec!["IO".into()]]),
        );
        db.on(
            "select activity",
            MockResponse::table(&["n"], vec![vec![DbValue::Int(1)], vec![DbValue::Int(2)]]),
        );
        db.on(
            "select plan($1, $2)",
            MockResponse::table(&["line"], vec![vec!["Seq Scan".into()]]),
        );
        db.on("select raw", MockResponse::table(&["x"], vec![vec![DbValue::Int(7)]]));
        db
    }

    #[test]
    fn test_layers_follow_declared_order() {
        let db = scripted();
        let mut conn = db.connect();
        let result = runner()
            .run_collector(&mut conn, "postgres", &CollectorTarget::id("top"), &RunContext::new())
            .unwrap();

        assert_eq!(
            result.layers.names().collect::<Vec<_>>(),
            vec!["cpu", "waits", "activity"]
        );
        assert_eq!(result.collector_ref, "pg-core:top");
        assert_eq!(result.layers.get("cpu").unwrap().rows[0]["cpu"], json!(0.5));
        assert_eq!(result.layers.get("waits").unwrap().rows.len(), 2);
        assert!(result.interval_sec.is_none());
    }

    #[test]
    fn test_single_row_layer_keeps_first_row() {
        let db = scripted();
        let mut conn = db.connect();
        let result = runner()
            .run_collector(&mut conn, "postgres", &CollectorTarget::id("top"), &RunContext::new())
            .unwrap();
        let activity = result.layers.get("activity").unwrap();
        assert_eq!(activity.rows.len(), 1);
        assert_eq!(activity.rows[0]["n"], json!(1));
    }

    #[test]
    fn test_failed_layer_does_not_fail_collector() {
        let db = scripted();
        db.on("select waits", MockResponse::error("relation pg_wait does not exist"));
        let mut conn = db.connect();
        let result = runner()
            .run_collector(&mut conn, "postgres", &CollectorTarget::id("top"), &RunContext::new())
            .unwrap();

        let waits = result.layers.get("waits").unwrap();
        assert!(waits.rows.is_empty());
        assert!(waits.error.as_deref().unwrap().contains("pg_wait"));
        assert_eq!(result.layers.get("cpu").unwrap().rows.len(), 1);
        assert_eq!(result.failed_layers(), 1);
        assert_eq!(db.execution_count(), 3);
    }

    #[test]
    fn test_cancelled_context_runs_nothing() {
        let db = scripted();
        let mut conn = db.connect();
        let token = CancellationToken::new();
        token.cancel();
        let ctx = RunContext::new().with_token(token);
        let err = runner()
            .run_collector(&mut conn, "postgres", &CollectorTarget::id("top"), &ctx)
            .unwrap_err();
        assert_eq!(err, EngineError::Cancelled);
        assert_eq!(db.execution_count(), 0);
    }

    #[test]
    fn test_unknown_collector() {
        let db = scripted();
        let mut conn = db.connect();
        let err = runner()
            .run_collector(&mut conn, "postgres", &CollectorTarget::id("io"), &RunContext::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::CollectorNotFound(_)));
    }

    #[test]
    fn test_missing_parameter_fails_before_any_sql() {
        let db = scripted();
        let mut conn = db.connect();
        let request = QueryRequest::new("plan").param("child", 0);
        let err = runner()
            .run_query(&mut conn, "postgres", &request, &RunContext::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(ref m) if m.contains("sql_id")));
        assert_eq!(db.execution_count(), 0);
    }

    #[test]
    fn test_named_params_bound_in_declaration_order() {
        let db = scripted();
        let mut conn = db.connect();
        let request = QueryRequest::new("plan")
            .param("child", 2)
            .param("sql_id", "abc")
            .param("unused", true);
        let result = runner()
            .run_query(&mut conn, "postgres", &request, &RunContext::new())
            .unwrap();

        assert_eq!(result.collector_ref, "pg-core:top");
        assert_eq!(result.rows[0]["line"], json!("Seq Scan"));
        assert_eq!(
            db.executed_params(),
            vec![vec![SqlParam::Text("abc".into()), SqlParam::Int(2)]]
        );
    }

    #[test]
    fn test_positional_fallback_and_passthrough() {
        let db = scripted();
        let mut conn = db.connect();
        let runner = runner();

        let request = QueryRequest::new("plan")
            .in_collector(CollectorTarget::reference("pg-core:top"))
            .param("child", 1)
            .positional(vec![json!("xyz")]);
        runner
            .run_query(&mut conn, "postgres", &request, &RunContext::new())
            .unwrap();

        let raw = QueryRequest::new("raw").positional(vec![json!(3), json!(null)]);
        runner
            .run_query(&mut conn, "postgres", &raw, &RunContext::new())
            .unwrap();

        assert_eq!(
            db.executed_params(),
            vec![
                vec![SqlParam::Text("xyz".into()), SqlParam::Int(1)],
                vec![SqlParam::Int(3), SqlParam::Null],
            ]
        );
    }

    #[test]
    fn test_query_failure_propagates() {
        let db = scripted();
        db.on("select raw", MockResponse::error("permission denied"));
        let mut conn = db.connect();
        let err = runner()
            .run_query(&mut conn, "postgres", &QueryRequest::new("raw"), &RunContext::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::Db(DbError::Query(_))));
    }

    #[test]
    fn test_invocations_fill_queries_map() {
        let db = scripted();
        let mut conn = db.connect();
        let mut params = Map::new();
        params.insert("sql_id".into(), json!("abc"));
        params.insert("child".into(), json!(0));
        let invocations = vec![
            QueryInvocation {
                query_id: "plan".into(),
                params,
            },
            QueryInvocation {
                query_id: "plan_missing_params".into(),
                params: Map::new(),
            },
            QueryInvocation {
                query_id: "raw".into(),
                params: Map::new(),
            },
        ];
        let ctx = RunContext::new().with_interval(5.0);
        let result = runner()
            .run_collector_with(
                &mut conn,
                "postgres",
                &CollectorTarget::id("top"),
                &invocations,
                &ctx,
            )
            .unwrap();

        assert_eq!(result.interval_sec, Some(5.0));
        assert!(matches!(result.queries["plan"], QueryOutcome::Rows(ref r) if r.len() == 1));
        assert!(matches!(result.queries["raw"], QueryOutcome::Rows(_)));
        assert!(matches!(
            result.queries["plan_missing_params"],
            QueryOutcome::Error(ref m) if m.contains("not found")
        ));
    }

    #[test]
    fn test_invocation_missing_parameter_is_entry_error() {
        let db = scripted();
        let mut conn = db.connect();
        let invocations = vec![QueryInvocation {
            query_id: "plan".into(),
            params: Map::new(),
        }];
        let result = runner()
            .run_collector_with(
                &mut conn,
                "postgres",
                &CollectorTarget::id("top"),
                &invocations,
                &RunContext::new(),
            )
            .unwrap();
        assert!(matches!(
            result.queries["plan"],
            QueryOutcome::Error(ref m) if m.contains("sql_id")
        ));
        assert_eq!(result.layers.len(), 3);
    }
}

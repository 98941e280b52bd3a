use std::time::Duration;

use sqlgate_contracts::{
    QueryError, QueryExecutionResult, ResultSet, SqlCandidate, TenantContext,
};
use sqlgate_policy::{
    ParsedStatement, SchemaRegistry, ValidationVerdict, ValidatorPolicy, enforce_tenant_scope,
    parse, validate,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{GatewayConfig, StartupError};
use crate::executor::{ConnectionPool, ExecutionGateway, ExecutionRequest, RetryPolicy};
use crate::formatter::format_result;
use crate::metrics;
use crate::postgres::{PgConnectionPool, introspect_schema_registry};

/// The pure stages plus the settings they run under.
#[derive(Debug, Clone)]
pub struct PolicyStages {
    registry: SchemaRegistry,
    validator: ValidatorPolicy,
    query_timeout: Duration,
    client_timeout: Duration,
}

impl PolicyStages {
    pub fn new(
        registry: SchemaRegistry,
        validator: ValidatorPolicy,
        query_timeout: Duration,
        client_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            validator,
            query_timeout,
            client_timeout,
        }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn validator(&self) -> &ValidatorPolicy {
        &self.validator
    }

    /// Parse, validate and scope, recording one verdict per stage reached.
    pub fn check(&self, sql: &str, tenant: &TenantContext) -> Result<ParsedStatement, QueryError> {
        let parsed = match parse(sql) {
            Ok(parsed) => {
                metrics::observe_verdict("parse", "approved");
                parsed
            }
            Err(err) => {
                metrics::observe_verdict("parse", "rejected");
                tracing::info!(
                    reason = err.error_kind().as_str(),
                    error = %err,
                    "statement rejected"
                );
                return Err(err.into());
            }
        };

        let approved = match validate(parsed, &self.validator) {
            ValidationVerdict::Approved(statement) => {
                metrics::observe_verdict("validate", "approved");
                statement
            }
            ValidationVerdict::Rejected(rejection) => {
                metrics::observe_verdict("validate", "rejected");
                tracing::info!(
                    reason = rejection.code.as_str(),
                    message = %rejection.message,
                    "statement rejected"
                );
                return Err(rejection.into());
            }
        };

        match enforce_tenant_scope(&approved, tenant, &self.registry) {
            Ok(scoped) => {
                metrics::observe_verdict("scope", "approved");
                Ok(scoped)
            }
            Err(rejection) => {
                metrics::observe_verdict("scope", "rejected");
                tracing::warn!(
                    reason = rejection.code.as_str(),
                    message = %rejection.message,
                    "statement rejected"
                );
                Err(rejection.into())
            }
        }
    }

    /// Runs the pure stages and builds the request the execution gateway
    /// would receive. Performs no I/O.
    pub fn prepare(&self, sql: &str, tenant: &TenantContext) -> Result<ExecutionRequest, QueryError> {
        let scoped = self.check(sql, tenant)?;
        let request =
            ExecutionRequest::from_scoped(&scoped, tenant, self.query_timeout, self.client_timeout)?;
        tracing::debug!(
            fingerprint = request.fingerprint(),
            sql = request.display_sql(),
            "statement approved"
        );
        Ok(request)
    }
}

/// Parser, validator, scope enforcer, execution gateway and formatter, run
/// strictly in that order.
pub struct QueryGateway<P> {
    stages: PolicyStages,
    executor: ExecutionGateway<P>,
}

impl QueryGateway<PgConnectionPool> {
    /// Connects the pool and, when configured, introspects the schema
    /// registry before applying the explicit table lists on top.
    pub async fn connect(config: &GatewayConfig) -> Result<Self, StartupError> {
        let pool = PgConnectionPool::connect(config).await?;

        let registry = if config.schema_introspect {
            let introspected =
                introspect_schema_registry(pool.pg_pool(), &config.policy.tenant_column).await?;
            config.policy.apply_overrides(introspected)?
        } else {
            config.policy.schema_registry()?
        };

        Ok(Self::new(stages_from_config(config, registry)?, pool, retry_policy(config)))
    }
}

pub fn stages_from_config(
    config: &GatewayConfig,
    registry: SchemaRegistry,
) -> Result<PolicyStages, StartupError> {
    Ok(PolicyStages::new(
        registry,
        config.policy.validator_policy()?,
        config.query_timeout(),
        config.client_timeout(),
    ))
}

pub fn retry_policy(config: &GatewayConfig) -> RetryPolicy {
    RetryPolicy {
        max_attempts: config.pool.acquire_max_attempts,
        base_backoff: Duration::from_millis(config.pool.acquire_base_backoff_ms),
    }
}

impl<P: ConnectionPool> QueryGateway<P> {
    pub fn new(stages: PolicyStages, pool: P, retry: RetryPolicy) -> Self {
        Self {
            stages,
            executor: ExecutionGateway::new(pool, retry),
        }
    }

    pub fn stages(&self) -> &PolicyStages {
        &self.stages
    }

    pub fn pool(&self) -> &P {
        self.executor.pool()
    }

    pub fn prepare(&self, sql: &str, tenant: &TenantContext) -> Result<ExecutionRequest, QueryError> {
        self.stages.prepare(sql, tenant)
    }

    /// Runs one candidate end to end. The tenant comes from the caller, never
    /// from the candidate text.
    pub async fn run(
        &self,
        candidate: &SqlCandidate,
        tenant: &TenantContext,
        cancel: &CancellationToken,
    ) -> QueryExecutionResult {
        let request_id = ulid::Ulid::new().to_string();
        let span = tracing::info_span!(
            "query",
            request_id = %request_id,
            tenant_id = tenant.tenant_id(),
            fingerprint = tracing::field::Empty,
        );
        self.run_inner(candidate, tenant, cancel)
            .instrument(span)
            .await
            .into()
    }

    async fn run_inner(
        &self,
        candidate: &SqlCandidate,
        tenant: &TenantContext,
        cancel: &CancellationToken,
    ) -> Result<ResultSet, QueryError> {
        if let Some(explanation) = candidate.explanation.as_deref() {
            tracing::debug!(explanation, "candidate received");
        }

        let request = self.prepare(&candidate.sql, tenant)?;
        tracing::Span::current().record("fingerprint", request.fingerprint());

        let raw = self.executor.execute(&request, cancel).await.inspect_err(|err| {
            tracing::warn!(kind = err.kind.as_str(), message = %err.message, "execution failed");
        })?;
        let set = format_result(raw, request.row_limit())?;

        tracing::info!(
            row_count = set.row_count,
            truncated = set.truncated,
            "query completed"
        );
        Ok(set)
    }

    pub async fn ping(&self) -> Result<(), QueryError> {
        self.executor.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use sqlgate_contracts::{CellValue, ColumnType, ErrorKind};

    use crate::executor::{AcquireError, DbError, QueryConnection, RawColumn, RawRows, RawValue};

    #[derive(Clone, Default)]
    struct CountingPool {
        acquired: Arc<AtomicUsize>,
        seen_sql: Arc<std::sync::Mutex<Vec<String>>>,
    }

    struct CountingConnection {
        seen_sql: Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl ConnectionPool for CountingPool {
        type Connection = CountingConnection;

        async fn acquire(&self) -> Result<CountingConnection, AcquireError> {
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(CountingConnection {
                seen_sql: self.seen_sql.clone(),
            })
        }
    }

    impl QueryConnection for CountingConnection {
        async fn run(&mut self, request: &ExecutionRequest) -> Result<RawRows, DbError> {
            self.seen_sql
                .lock()
                .expect("seen_sql lock")
                .push(request.sql().to_string());
            Ok(RawRows {
                columns: vec![RawColumn {
                    name: "count".to_string(),
                    declared_type: "INT8".to_string(),
                }],
                rows: vec![vec![RawValue::Int(1250)]],
            })
        }

        async fn ping(&mut self) -> Result<(), DbError> {
            Ok(())
        }

        fn discard(self) {}
    }

    fn gateway(pool: CountingPool) -> QueryGateway<CountingPool> {
        let registry = SchemaRegistry::new("tenant_id")
            .and_then(|r| r.with_tenant_tables(["users", "orders"]))
            .expect("registry should build");
        let stages = PolicyStages::new(
            registry,
            ValidatorPolicy::default(),
            Duration::from_secs(5),
            Duration::from_millis(5250),
        );
        QueryGateway::new(stages, pool, RetryPolicy::default())
    }

    fn tenant() -> TenantContext {
        TenantContext::new("tenant_123").expect("tenant should be valid")
    }

    #[tokio::test]
    async fn count_query_runs_end_to_end() {
        let pool = CountingPool::default();
        let seen_sql = pool.seen_sql.clone();
        let gateway = gateway(pool);

        let result = gateway
            .run(
                &SqlCandidate::new("SELECT COUNT(*) FROM users"),
                &tenant(),
                &CancellationToken::new(),
            )
            .await;
        let set = result.into_result().expect("query should succeed");

        assert_eq!(set.columns[0].name, "count");
        assert_eq!(set.columns[0].column_type, ColumnType::Int);
        assert_eq!(set.rows, vec![vec![CellValue::Int(1250)]]);
        assert_eq!(set.row_count, 1);
        assert!(!set.truncated);
        assert_eq!(
            seen_sql.lock().expect("seen_sql lock").as_slice(),
            &["SELECT COUNT(*) FROM users WHERE users.tenant_id = $1 LIMIT 100".to_string()]
        );
    }

    #[tokio::test]
    async fn rejected_statements_never_reach_the_pool() {
        let pool = CountingPool::default();
        let acquired = pool.acquired.clone();
        let gateway = gateway(pool);

        for (sql, kind) in [
            ("UPDATE users SET name = 'x'", ErrorKind::NonReadOnly),
            ("EXEC purge_tenant", ErrorKind::NonReadOnly),
            ("SELECT * FROM users; DROP TABLE users;", ErrorKind::MultiStatement),
            (
                "SELECT ts_stat('SELECT to_tsvector(name) FROM users')",
                ErrorKind::DisallowedFunction,
            ),
            (
                "SELECT * FROM users WHERE tenant_id = 'tenant_999'",
                ErrorKind::TenantScopeViolation,
            ),
            ("SELECT * FROM secrets", ErrorKind::TenantScopeViolation),
        ] {
            let result = gateway
                .run(&SqlCandidate::new(sql), &tenant(), &CancellationToken::new())
                .await;
            assert_eq!(result.error_kind(), Some(kind), "{}", sql);
        }
        assert_eq!(acquired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn prepare_exposes_both_sql_forms() {
        let gateway = gateway(CountingPool::default());
        let request = gateway
            .prepare(
                "SELECT u.name, o.total FROM users u JOIN orders o ON o.user_id = u.id",
                &tenant(),
            )
            .expect("join should be approved");

        let display = request.display_sql();
        assert!(display.contains("u.tenant_id = :tenant_id"));
        assert!(display.contains("o.tenant_id = :tenant_id"));
        assert!(display.ends_with("LIMIT 100"));

        let sql = request.sql();
        assert!(sql.contains("u.tenant_id = $1"));
        assert!(sql.contains("o.tenant_id = $1"));
        assert!(!sql.contains(":tenant_id"));
        assert_eq!(request.params(), &["tenant_123".to_string()]);
    }

    #[tokio::test]
    async fn ping_uses_the_pool() {
        let pool = CountingPool::default();
        let acquired = pool.acquired.clone();
        let gateway = gateway(pool);

        gateway.ping().await.expect("ping should succeed");
        assert_eq!(acquired.load(Ordering::SeqCst), 1);
    }
}

use std::future::Future;
use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use sqlgate_contracts::canonical::sql_fingerprint;
use sqlgate_contracts::{ErrorKind, QueryError, TenantContext};
use sqlgate_policy::{ParsedStatement, TENANT_PLACEHOLDER};
use sqlparser::ast::{Expr, Statement, Value, visit_expressions_mut};
use tokio_util::sync::CancellationToken;

use crate::metrics;

/// Everything needed to run one approved, tenant-scoped statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    sql: String,
    display_sql: String,
    params: Vec<String>,
    tenant_id: String,
    timeout: Duration,
    client_timeout: Duration,
    row_limit: usize,
    fingerprint: String,
}

impl ExecutionRequest {
    /// Rewrites `:tenant_id` to a positional parameter bound to the caller's
    /// tenant. Other literals stay in the statement text as rendered from
    /// the syntax tree.
    pub(crate) fn from_scoped(
        statement: &ParsedStatement,
        tenant: &TenantContext,
        timeout: Duration,
        client_timeout: Duration,
    ) -> Result<Self, QueryError> {
        let row_limit = statement
            .limit()
            .and_then(|limit| limit.parse::<usize>().ok())
            .ok_or_else(|| {
                QueryError::new(
                    ErrorKind::ExecutionError,
                    "statement carries no literal row limit",
                )
            })?;

        let display_sql = statement.sql();
        let mut ast: Statement = statement.ast().clone();
        let mut params = Vec::new();
        let _ = visit_expressions_mut(&mut ast, |expr| {
            if let Expr::Value(Value::Placeholder(name)) = expr
                && name == TENANT_PLACEHOLDER
            {
                if params.is_empty() {
                    params.push(tenant.tenant_id().to_string());
                }
                *name = "$1".to_string();
            }
            ControlFlow::<()>::Continue(())
        });

        Ok(Self {
            sql: ast.to_string(),
            fingerprint: sql_fingerprint(&display_sql),
            display_sql,
            params,
            tenant_id: tenant.tenant_id().to_string(),
            timeout,
            client_timeout,
            row_limit,
        })
    }

    /// Statement text with `$n` placeholders, as sent to the database.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Statement text with `:tenant_id`, for logs and offline checks.
    pub fn display_sql(&self) -> &str {
        &self.display_sql
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn client_timeout(&self) -> Duration {
        self.client_timeout
    }

    pub fn row_limit(&self) -> usize {
        self.row_limit
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawColumn {
    pub name: String,
    pub declared_type: String,
}

/// A decoded driver value, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(String),
    Text(String),
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawRows {
    pub columns: Vec<RawColumn>,
    pub rows: Vec<Vec<RawValue>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireError {
    /// Every pooled connection is busy. The only retried failure.
    Exhausted,
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    /// The server's `statement_timeout` fired; the connection is still sound.
    StatementTimeout,
    /// Server-reported failure, already stripped of connection details.
    Failed(String),
}

pub trait ConnectionPool: Send + Sync {
    type Connection: QueryConnection;

    fn acquire(&self) -> impl Future<Output = Result<Self::Connection, AcquireError>> + Send;
}

/// A connection checked out of the pool. Dropping it returns it.
pub trait QueryConnection: Send {
    /// Runs the statement in a read-only transaction, reading at most
    /// `request.row_limit()` rows.
    fn run(
        &mut self,
        request: &ExecutionRequest,
    ) -> impl Future<Output = Result<RawRows, DbError>> + Send;

    fn ping(&mut self) -> impl Future<Output = Result<(), DbError>> + Send;

    /// Called when the connection's state is unknown: cancel any server-side
    /// work and keep the connection out of the pool.
    fn discard(self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Idle,
    Acquiring,
    Bound,
    Running,
    Completed,
    TimedOut,
    Failed,
    Cancelled,
}

impl ExecutionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionState::Idle => "idle",
            ExecutionState::Acquiring => "acquiring",
            ExecutionState::Bound => "bound",
            ExecutionState::Running => "running",
            ExecutionState::Completed => "completed",
            ExecutionState::TimedOut => "timed_out",
            ExecutionState::Failed => "failed",
            ExecutionState::Cancelled => "cancelled",
        }
    }
}

struct Tracker {
    state: ExecutionState,
    started: Instant,
}

impl Tracker {
    fn new() -> Self {
        Self {
            state: ExecutionState::Idle,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, next: ExecutionState) {
        tracing::debug!(from = self.state.as_str(), to = next.as_str(), "execution state");
        self.state = next;
    }

    fn finish<T>(&mut self, next: ExecutionState, result: Result<T, QueryError>) -> Result<T, QueryError> {
        self.advance(next);
        metrics::observe_execution(next.as_str(), self.started.elapsed());
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based): base, 2x base, 4x base.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_backoff: Duration::from_millis(50),
        }
    }
}

pub struct ExecutionGateway<P> {
    pool: P,
    retry: RetryPolicy,
}

impl<P: ConnectionPool> ExecutionGateway<P> {
    pub fn new(pool: P, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }

    async fn acquire(&self) -> Result<P::Connection, QueryError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.pool.acquire().await {
                Ok(conn) => return Ok(conn),
                Err(AcquireError::Exhausted) if attempt < max_attempts => {
                    let backoff = self.retry.backoff(attempt);
                    tracing::warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "connection pool exhausted; retrying"
                    );
                    metrics::inc_pool_acquire_retry();
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(AcquireError::Exhausted) => {
                    return Err(QueryError::new(
                        ErrorKind::ConnectionAcquisitionError,
                        format!(
                            "connection pool exhausted after {} attempt(s)",
                            attempt
                        ),
                    ));
                }
                Err(AcquireError::Unavailable(message)) => {
                    return Err(QueryError::new(
                        ErrorKind::ConnectionAcquisitionError,
                        message,
                    ));
                }
            }
        }
    }

    /// Runs one request to completion. Every exit path either returns the
    /// connection to the pool or discards it.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<RawRows, QueryError> {
        let mut tracker = Tracker::new();
        tracker.advance(ExecutionState::Acquiring);

        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            acquired = self.acquire() => Some(acquired),
        };
        let mut conn = match acquired {
            None => {
                return tracker.finish(ExecutionState::Cancelled, Err(cancelled()));
            }
            Some(Err(err)) => return tracker.finish(ExecutionState::Failed, Err(err)),
            Some(Ok(conn)) => conn,
        };

        tracker.advance(ExecutionState::Bound);
        tracker.advance(ExecutionState::Running);

        enum Outcome {
            Done(Result<RawRows, DbError>),
            ClientTimeout,
            Cancelled,
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Outcome::Cancelled,
            result = tokio::time::timeout(request.client_timeout(), conn.run(request)) => match result {
                Ok(done) => Outcome::Done(done),
                Err(_) => Outcome::ClientTimeout,
            },
        };

        match outcome {
            Outcome::Done(Ok(mut raw)) => {
                raw.rows.truncate(request.row_limit());
                drop(conn);
                tracker.finish(ExecutionState::Completed, Ok(raw))
            }
            Outcome::Done(Err(DbError::StatementTimeout)) => {
                drop(conn);
                tracker.finish(ExecutionState::TimedOut, Err(timed_out(request)))
            }
            Outcome::Done(Err(DbError::Failed(message))) => {
                drop(conn);
                tracker.finish(
                    ExecutionState::Failed,
                    Err(QueryError::new(ErrorKind::ExecutionError, message)),
                )
            }
            Outcome::ClientTimeout => {
                tracing::warn!(
                    fingerprint = request.fingerprint(),
                    "client deadline passed; discarding connection"
                );
                conn.discard();
                tracker.finish(ExecutionState::TimedOut, Err(timed_out(request)))
            }
            Outcome::Cancelled => {
                conn.discard();
                tracker.finish(ExecutionState::Cancelled, Err(cancelled()))
            }
        }
    }

    /// Readiness check under the same acquisition policy as queries.
    pub async fn ping(&self) -> Result<(), QueryError> {
        let mut conn = self.acquire().await?;
        conn.ping().await.map_err(|err| match err {
            DbError::StatementTimeout => {
                QueryError::new(ErrorKind::TimedOut, "ping timed out")
            }
            DbError::Failed(message) => QueryError::new(ErrorKind::ExecutionError, message),
        })
    }
}

fn cancelled() -> QueryError {
    QueryError::new(ErrorKind::Cancelled, "query cancelled by caller")
}

fn timed_out(request: &ExecutionRequest) -> QueryError {
    QueryError::new(
        ErrorKind::TimedOut,
        format!(
            "query exceeded the {} ms execution timeout",
            request.timeout().as_millis()
        ),
    )
}

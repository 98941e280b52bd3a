use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures_util::TryStreamExt;
use sqlgate_policy::{SchemaRegistry, TableScope};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::{BigDecimal, JsonValue, Uuid};
use sqlx::{Column, Connection, Executor, PgPool, Postgres, Row, Statement, TypeInfo};

use crate::config::{GatewayConfig, StartupError};
use crate::executor::{
    AcquireError, ConnectionPool, DbError, ExecutionRequest, QueryConnection, RawColumn, RawRows,
    RawValue,
};

/// Postgres `query_canceled`; raised both by `statement_timeout` and by
/// `pg_cancel_backend`.
const QUERY_CANCELED: &str = "57014";

/// Transaction-local setting carrying the caller's tenant, for row-level
/// security policies that want a second line of defence.
pub const TENANT_SETTING: &str = "sqlgate.tenant_id";

#[derive(Clone)]
pub struct PgConnectionPool {
    pool: PgPool,
}

impl PgConnectionPool {
    pub async fn connect(config: &GatewayConfig) -> Result<Self, StartupError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool.max_connections)
            .min_connections(config.pool.min_connections)
            .acquire_timeout(Duration::from_millis(config.pool.acquire_timeout_ms))
            .connect(&config.db_url)
            .await
            .map_err(|_| StartupError {
                code: "ERR_DB_UNAVAILABLE",
                message: "failed to connect to database".to_string(),
            })?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pg_pool(&self) -> &PgPool {
        &self.pool
    }
}

impl ConnectionPool for PgConnectionPool {
    type Connection = PgSession;

    async fn acquire(&self) -> Result<PgSession, AcquireError> {
        match self.pool.acquire().await {
            Ok(conn) => Ok(PgSession {
                conn,
                pool: self.pool.clone(),
                backend_pid: None,
            }),
            Err(err) => Err(acquire_error(
                err,
                self.pool.size(),
                self.pool.options().get_max_connections(),
            )),
        }
    }
}

/// `PoolTimedOut` also covers a connect attempt that stalled. Only a timeout
/// while every slot is open counts as exhaustion.
fn acquire_error(err: sqlx::Error, open: u32, max_connections: u32) -> AcquireError {
    match err {
        sqlx::Error::PoolTimedOut if open >= max_connections => AcquireError::Exhausted,
        sqlx::Error::PoolTimedOut => AcquireError::Unavailable(
            "database did not accept a connection in time".to_string(),
        ),
        sqlx::Error::PoolClosed => {
            AcquireError::Unavailable("connection pool is closed".to_string())
        }
        _ => AcquireError::Unavailable("database unavailable".to_string()),
    }
}

pub struct PgSession {
    conn: PoolConnection<Postgres>,
    pool: PgPool,
    backend_pid: Option<i32>,
}

impl QueryConnection for PgSession {
    async fn run(&mut self, request: &ExecutionRequest) -> Result<RawRows, DbError> {
        if self.backend_pid.is_none() {
            let pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
                .fetch_one(&mut *self.conn)
                .await
                .map_err(db_error)?;
            self.backend_pid = Some(pid);
        }

        let timeout_str = format!("{}ms", request.timeout().as_millis());
        let mut tx = Connection::begin(&mut *self.conn).await.map_err(db_error)?;

        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        sqlx::query("SELECT set_config('statement_timeout', $1, true)")
            .bind(&timeout_str)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        sqlx::query("SELECT set_config($1, $2, true)")
            .bind(TENANT_SETTING)
            .bind(request.tenant_id())
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        let statement = (&mut *tx).prepare(request.sql()).await.map_err(db_error)?;
        let columns: Vec<RawColumn> = statement
            .columns()
            .iter()
            .map(|column| RawColumn {
                name: column.name().to_string(),
                declared_type: column.type_info().name().to_string(),
            })
            .collect();

        let mut query = statement.query();
        for param in request.params() {
            query = query.bind(param.as_str());
        }

        let mut rows = Vec::new();
        {
            let mut stream = query.fetch(&mut *tx);
            while rows.len() < request.row_limit() {
                let Some(row) = stream.try_next().await.map_err(db_error)? else {
                    break;
                };
                rows.push(decode_row(&row, &columns)?);
            }
        }

        tx.commit().await.map_err(db_error)?;
        Ok(RawRows { columns, rows })
    }

    async fn ping(&mut self) -> Result<(), DbError> {
        sqlx::query("SELECT 1")
            .execute(&mut *self.conn)
            .await
            .map(|_| ())
            .map_err(db_error)
    }

    fn discard(self) {
        let PgSession {
            conn,
            pool,
            backend_pid,
        } = self;
        let conn = conn.detach();
        tokio::spawn(async move {
            if let Some(pid) = backend_pid
                && let Err(err) = sqlx::query("SELECT pg_cancel_backend($1)")
                    .bind(pid)
                    .execute(&pool)
                    .await
            {
                tracing::warn!(pid, error = %sanitize(&err), "failed to cancel backend query");
            }
            drop(conn);
        });
    }
}

fn decode_row(row: &PgRow, columns: &[RawColumn]) -> Result<Vec<RawValue>, DbError> {
    columns
        .iter()
        .enumerate()
        .map(|(index, column)| {
            decode_cell(row, index, &column.declared_type).map_err(|err| match err {
                sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => DbError::Failed(
                    format!(
                        "column `{}` has type {} which cannot be returned; cast it to text",
                        column.name, column.declared_type
                    ),
                ),
                other => db_error(other),
            })
        })
        .collect()
}

fn decode_cell(row: &PgRow, index: usize, declared_type: &str) -> Result<RawValue, sqlx::Error> {
    fn or_null<T>(value: Option<T>, wrap: impl FnOnce(T) -> RawValue) -> RawValue {
        value.map_or(RawValue::Null, wrap)
    }

    Ok(match declared_type {
        "BOOL" => or_null(row.try_get::<Option<bool>, _>(index)?, RawValue::Bool),
        "INT2" => or_null(row.try_get::<Option<i16>, _>(index)?, |v| {
            RawValue::Int(i64::from(v))
        }),
        "INT4" => or_null(row.try_get::<Option<i32>, _>(index)?, |v| {
            RawValue::Int(i64::from(v))
        }),
        "INT8" => or_null(row.try_get::<Option<i64>, _>(index)?, RawValue::Int),
        "FLOAT4" => or_null(row.try_get::<Option<f32>, _>(index)?, |v| {
            RawValue::Float(f64::from(v))
        }),
        "FLOAT8" => or_null(row.try_get::<Option<f64>, _>(index)?, RawValue::Float),
        "NUMERIC" => or_null(row.try_get::<Option<BigDecimal>, _>(index)?, |v| {
            RawValue::Decimal(v.to_string())
        }),
        "DATE" => or_null(row.try_get::<Option<NaiveDate>, _>(index)?, |v| {
            RawValue::Text(v.to_string())
        }),
        "TIME" => or_null(row.try_get::<Option<NaiveTime>, _>(index)?, |v| {
            RawValue::Text(v.to_string())
        }),
        "TIMESTAMP" => or_null(row.try_get::<Option<NaiveDateTime>, _>(index)?, |v| {
            RawValue::Text(v.to_string())
        }),
        "TIMESTAMPTZ" => or_null(row.try_get::<Option<DateTime<Utc>>, _>(index)?, |v| {
            RawValue::Text(v.to_rfc3339())
        }),
        "UUID" => or_null(row.try_get::<Option<Uuid>, _>(index)?, |v| {
            RawValue::Text(v.to_string())
        }),
        "JSON" | "JSONB" => or_null(row.try_get::<Option<JsonValue>, _>(index)?, RawValue::Json),
        "BYTEA" => or_null(row.try_get::<Option<Vec<u8>>, _>(index)?, RawValue::Bytes),
        _ => or_null(row.try_get::<Option<String>, _>(index)?, RawValue::Text),
    })
}

fn db_error(err: sqlx::Error) -> DbError {
    if let sqlx::Error::Database(db_err) = &err
        && db_err.code().as_deref() == Some(QUERY_CANCELED)
    {
        return DbError::StatementTimeout;
    }
    DbError::Failed(sanitize(&err))
}

/// Server messages describe the statement; driver and I/O errors may name
/// the host, so they are replaced wholesale.
fn sanitize(err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db_err) => db_err.message().to_string(),
        sqlx::Error::ColumnDecode { index, .. } => format!("failed to decode column {}", index),
        sqlx::Error::RowNotFound => "no rows returned".to_string(),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            "database unavailable".to_string()
        }
        _ => "database request failed".to_string(),
    }
}

/// Tables of the current schema that carry the tenant column are
/// tenant-scoped; every other table is shared.
pub async fn introspect_schema_registry(
    pool: &PgPool,
    tenant_column: &str,
) -> Result<SchemaRegistry, StartupError> {
    let rows = sqlx::query(
        "SELECT table_name::text AS table_name, bool_or(column_name = $1) AS scoped \
         FROM information_schema.columns \
         WHERE table_schema = current_schema() \
         GROUP BY table_name \
         ORDER BY table_name",
    )
    .bind(tenant_column)
    .fetch_all(pool)
    .await
    .map_err(|_| StartupError {
        code: "ERR_DB_UNAVAILABLE",
        message: "failed to introspect schema registry".to_string(),
    })?;

    let mut registry = SchemaRegistry::new(tenant_column).map_err(|err| StartupError {
        code: "ERR_INVALID_CONFIG",
        message: err.to_string(),
    })?;

    for row in rows {
        let schema_error = |_| StartupError {
            code: "ERR_INTERNAL",
            message: "information_schema row shape mismatch".to_string(),
        };
        let table: String = row.try_get("table_name").map_err(schema_error)?;
        let scoped: Option<bool> = row.try_get("scoped").map_err(schema_error)?;
        let scope = if scoped.unwrap_or(false) {
            TableScope::TenantScoped
        } else {
            TableScope::Shared
        };
        if let Err(err) = registry.insert(&table, scope) {
            tracing::warn!(table = %table, error = %err, "skipping table during introspection");
        }
    }

    tracing::info!(tables = registry.len(), "schema registry introspected");
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_with_every_slot_open_is_exhaustion() {
        assert_eq!(
            acquire_error(sqlx::Error::PoolTimedOut, 10, 10),
            AcquireError::Exhausted
        );
    }

    #[test]
    fn timeout_with_free_slots_is_unavailability() {
        let err = acquire_error(sqlx::Error::PoolTimedOut, 0, 10);
        assert!(matches!(
            err,
            AcquireError::Unavailable(ref message) if message.contains("in time")
        ));
        assert!(matches!(
            acquire_error(sqlx::Error::PoolClosed, 10, 10),
            AcquireError::Unavailable(_)
        ));
    }

    #[test]
    fn driver_errors_never_carry_connection_details() {
        assert!(matches!(
            db_error(sqlx::Error::PoolTimedOut),
            DbError::Failed(ref message) if message == "database unavailable"
        ));
        assert!(matches!(
            db_error(sqlx::Error::RowNotFound),
            DbError::Failed(ref message) if message == "no rows returned"
        ));
    }
}

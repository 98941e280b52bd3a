use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

pub mod canonical;

/// Caller identity for one request. Always supplied out-of-band by the caller,
/// never derived from query text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    tenant_id: String,
    #[serde(default)]
    allowed_tables: BTreeSet<String>,
}

impl TenantContext {
    pub const MAX_TENANT_ID_LEN: usize = 256;

    pub fn new(tenant_id: impl Into<String>) -> Result<Self, &'static str> {
        let tenant_id = tenant_id.into();
        if tenant_id.trim().is_empty() {
            return Err("tenant_id must be non-empty");
        }
        if tenant_id.len() > Self::MAX_TENANT_ID_LEN {
            return Err("tenant_id too long");
        }
        if tenant_id.chars().any(char::is_control) {
            return Err("tenant_id must not contain control characters");
        }

        Ok(Self {
            tenant_id,
            allowed_tables: BTreeSet::new(),
        })
    }

    /// Restricts the request to the given tables. Names are matched
    /// case-insensitively.
    pub fn with_allowed_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.allowed_tables = tables
            .into_iter()
            .map(|t| t.as_ref().trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        self
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn allowed_tables(&self) -> &BTreeSet<String> {
        &self.allowed_tables
    }

    /// An empty allow-list admits every registered table.
    pub fn allows_table(&self, table: &str) -> bool {
        self.allowed_tables.is_empty()
            || self
                .allowed_tables
                .contains(table.to_ascii_lowercase().as_str())
    }
}

/// Output of the NL-to-SQL collaborator. `sql` is untrusted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlCandidate {
    pub sql: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

impl SqlCandidate {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            explanation: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ParseError,
    NonReadOnly,
    MultiStatement,
    DisallowedFunction,
    LimitExceeded,
    TenantScopeViolation,
    ConnectionAcquisitionError,
    ExecutionError,
    TimedOut,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ParseError => "PARSE_ERROR",
            ErrorKind::NonReadOnly => "NON_READ_ONLY",
            ErrorKind::MultiStatement => "MULTI_STATEMENT",
            ErrorKind::DisallowedFunction => "DISALLOWED_FUNCTION",
            ErrorKind::LimitExceeded => "LIMIT_EXCEEDED",
            ErrorKind::TenantScopeViolation => "TENANT_SCOPE_VIOLATION",
            ErrorKind::ConnectionAcquisitionError => "CONNECTION_ACQUISITION_ERROR",
            ErrorKind::ExecutionError => "EXECUTION_ERROR",
            ErrorKind::TimedOut => "TIMED_OUT",
            ErrorKind::Cancelled => "CANCELLED",
        }
    }

    /// True for kinds produced before any database work happens.
    pub fn is_rejection(self) -> bool {
        matches!(
            self,
            ErrorKind::ParseError
                | ErrorKind::NonReadOnly
                | ErrorKind::MultiStatement
                | ErrorKind::DisallowedFunction
                | ErrorKind::LimitExceeded
                | ErrorKind::TenantScopeViolation
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryError {
    pub kind: ErrorKind,
    pub message: String,
}

impl QueryError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for QueryError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Int,
    Float,
    Decimal,
    Bool,
    Text,
    Date,
    Time,
    Timestamp,
    Uuid,
    Json,
    Bytes,
    Other,
}

impl ColumnType {
    /// Maps a driver-declared type name (Postgres spelling) to its normalized
    /// column type.
    pub fn from_declared(declared: &str) -> Self {
        match declared.trim().to_ascii_uppercase().as_str() {
            "INT2" | "INT4" | "INT8" | "SMALLINT" | "INTEGER" | "INT" | "BIGINT" | "OID" => {
                ColumnType::Int
            }
            "FLOAT4" | "FLOAT8" | "REAL" | "DOUBLE PRECISION" => ColumnType::Float,
            "NUMERIC" | "DECIMAL" | "MONEY" => ColumnType::Decimal,
            "BOOL" | "BOOLEAN" => ColumnType::Bool,
            "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" | "CITEXT" => ColumnType::Text,
            "DATE" => ColumnType::Date,
            "TIME" | "TIMETZ" => ColumnType::Time,
            "TIMESTAMP" | "TIMESTAMPTZ" => ColumnType::Timestamp,
            "UUID" => ColumnType::Uuid,
            "JSON" | "JSONB" => ColumnType::Json,
            "BYTEA" => ColumnType::Bytes,
            _ => ColumnType::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ColumnType::Int => "int",
            ColumnType::Float => "float",
            ColumnType::Decimal => "decimal",
            ColumnType::Bool => "bool",
            ColumnType::Text => "text",
            ColumnType::Date => "date",
            ColumnType::Time => "time",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Uuid => "uuid",
            ColumnType::Json => "json",
            ColumnType::Bytes => "bytes",
            ColumnType::Other => "other",
        }
    }
}

/// One cell of a result row. Decimals travel as their exact decimal string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(String),
    Text(String),
    Json(serde_json::Value),
    /// Lowercase hex.
    Bytes(String),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultColumn {
    pub name: String,
    pub column_type: ColumnType,
    pub declared_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<ResultColumn>,
    pub rows: Vec<Vec<CellValue>>,
    pub row_count: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueryExecutionResult {
    Ok(ResultSet),
    Error(QueryError),
}

impl QueryExecutionResult {
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            QueryExecutionResult::Ok(_) => None,
            QueryExecutionResult::Error(err) => Some(err.kind),
        }
    }

    pub fn into_result(self) -> Result<ResultSet, QueryError> {
        match self {
            QueryExecutionResult::Ok(set) => Ok(set),
            QueryExecutionResult::Error(err) => Err(err),
        }
    }
}

impl From<Result<ResultSet, QueryError>> for QueryExecutionResult {
    fn from(value: Result<ResultSet, QueryError>) -> Self {
        match value {
            Ok(set) => QueryExecutionResult::Ok(set),
            Err(err) => QueryExecutionResult::Error(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_context_rejects_blank_and_control_ids() {
        assert_eq!(
            TenantContext::new("  ").expect_err("blank id must fail"),
            "tenant_id must be non-empty"
        );
        assert_eq!(
            TenantContext::new("t\u{0000}1").expect_err("control char must fail"),
            "tenant_id must not contain control characters"
        );
        assert!(TenantContext::new("x".repeat(TenantContext::MAX_TENANT_ID_LEN + 1)).is_err());
    }

    #[test]
    fn empty_allow_list_admits_every_table() {
        let ctx = TenantContext::new("tenant_123").expect("valid tenant");
        assert!(ctx.allows_table("users"));

        let ctx = ctx.with_allowed_tables(["Users", " orders "]);
        assert!(ctx.allows_table("USERS"));
        assert!(ctx.allows_table("orders"));
        assert!(!ctx.allows_table("invoices"));
    }

    #[test]
    fn error_kind_codes_serialize_screaming_snake_case() {
        let err = QueryError::new(ErrorKind::TenantScopeViolation, "nope");
        let value = serde_json::to_value(&err).expect("error serializes");
        assert_eq!(value["kind"], "TENANT_SCOPE_VIOLATION");
        assert_eq!(err.to_string(), "TENANT_SCOPE_VIOLATION: nope");
        assert!(ErrorKind::MultiStatement.is_rejection());
        assert!(!ErrorKind::TimedOut.is_rejection());
    }

    #[test]
    fn declared_types_normalize() {
        assert_eq!(ColumnType::from_declared("INT8"), ColumnType::Int);
        assert_eq!(ColumnType::from_declared("numeric"), ColumnType::Decimal);
        assert_eq!(ColumnType::from_declared("TIMESTAMPTZ"), ColumnType::Timestamp);
        assert_eq!(ColumnType::from_declared("tsvector"), ColumnType::Other);
    }

    #[test]
    fn execution_result_is_tagged_by_status() {
        let ok = QueryExecutionResult::Ok(ResultSet {
            columns: vec![ResultColumn {
                name: "count".to_string(),
                column_type: ColumnType::Int,
                declared_type: "INT8".to_string(),
            }],
            rows: vec![vec![CellValue::Int(1250)]],
            row_count: 1,
            truncated: false,
        });
        let value = serde_json::to_value(&ok).expect("result serializes");
        assert_eq!(value["status"], "ok");
        assert_eq!(value["rows"][0][0], serde_json::json!({"type": "int", "value": 1250}));

        let err = QueryExecutionResult::Error(QueryError::new(ErrorKind::TimedOut, "slow"));
        let value = serde_json::to_value(&err).expect("error serializes");
        assert_eq!(value["status"], "error");
        assert_eq!(value["kind"], "TIMED_OUT");
        assert_eq!(err.error_kind(), Some(ErrorKind::TimedOut));
    }
}

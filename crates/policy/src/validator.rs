use std::collections::BTreeSet;
use std::ops::ControlFlow;

use sqlparser::ast::{Expr, ObjectName, Query, SetExpr, Statement, Value, Visit, Visitor};

use crate::parser::{ParsedStatement, StatementKind};
use crate::{ReasonCode, Rejection, ValidationVerdict};

/// Functions that touch files, sessions, other backends or sequences, that
/// can stall a connection, or that run SQL handed to them as text. Entries
/// ending in `*` match by prefix.
pub const DEFAULT_DENIED_FUNCTIONS: &[&str] = &[
    "pg_read_file",
    "pg_read_binary_file",
    "pg_ls_*",
    "pg_stat_file",
    "pg_sleep*",
    "pg_terminate_backend",
    "pg_cancel_backend",
    "pg_reload_conf",
    "pg_rotate_logfile",
    "pg_switch_wal",
    "pg_create_restore_point",
    "pg_promote",
    "pg_notify",
    "pg_logical_emit_message",
    "pg_advisory_*",
    "pg_try_advisory_*",
    "lo_*",
    "dblink*",
    "set_config",
    "nextval",
    "setval",
    "txid_current",
    "query_to_xml*",
    "cursor_to_xml*",
    "table_to_xml*",
    "schema_to_xml*",
    "database_to_xml*",
    "ts_stat",
    "ts_rewrite",
];

const CATALOG_SCHEMAS: &[&str] = &["pg_catalog", "information_schema", "pg_toast"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorPolicy {
    default_limit: u64,
    max_limit: u64,
    denied_functions: BTreeSet<String>,
}

impl Default for ValidatorPolicy {
    fn default() -> Self {
        Self {
            default_limit: 100,
            max_limit: 1000,
            denied_functions: DEFAULT_DENIED_FUNCTIONS
                .iter()
                .map(|f| f.to_string())
                .collect(),
        }
    }
}

impl ValidatorPolicy {
    pub fn new(default_limit: u64, max_limit: u64) -> Result<Self, String> {
        if max_limit == 0 {
            return Err("max row limit must be >= 1".to_string());
        }
        if default_limit == 0 || default_limit > max_limit {
            return Err(format!(
                "default row limit must be between 1 and {}",
                max_limit
            ));
        }

        Ok(Self {
            default_limit,
            max_limit,
            ..Self::default()
        })
    }

    /// Extends the built-in denylist.
    pub fn with_denied_functions<I, S>(mut self, functions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.denied_functions.extend(
            functions
                .into_iter()
                .map(|f| f.as_ref().trim().to_ascii_lowercase())
                .filter(|f| !f.is_empty()),
        );
        self
    }

    pub fn default_limit(&self) -> u64 {
        self.default_limit
    }

    pub fn max_limit(&self) -> u64 {
        self.max_limit
    }

    pub fn is_denied_function(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        self.denied_functions.iter().any(|entry| match entry.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => *entry == name,
        })
    }
}

/// Decides whether a parsed statement may run. The only change an approved
/// statement can carry is an injected LIMIT when the query had none.
pub fn validate(statement: ParsedStatement, policy: &ValidatorPolicy) -> ValidationVerdict {
    match check(&statement, policy) {
        Ok(None) => ValidationVerdict::Approved(statement),
        Ok(Some(rewritten)) => ValidationVerdict::Approved(statement.with_ast(rewritten)),
        Err(rejection) => {
            tracing::debug!(
                reason = rejection.code.as_str(),
                message = %rejection.message,
                "statement rejected by validator"
            );
            ValidationVerdict::Rejected(rejection)
        }
    }
}

fn check(statement: &ParsedStatement, policy: &ValidatorPolicy) -> Result<Option<Statement>, Rejection> {
    if statement.kind() != StatementKind::Select {
        return Err(Rejection::new(
            ReasonCode::NonReadOnly,
            format!(
                "only SELECT statements are allowed, found {}",
                statement.keyword()
            ),
        ));
    }
    let Statement::Query(query) = statement.ast() else {
        return Err(Rejection::new(
            ReasonCode::NonReadOnly,
            "only SELECT statements are allowed",
        ));
    };

    if let ControlFlow::Break(rejection) = statement.ast().visit(&mut ReadOnlyCheck) {
        return Err(rejection);
    }

    if statement.statement_count() != 1 {
        return Err(Rejection::new(
            ReasonCode::MultiStatement,
            format!(
                "exactly one statement is allowed, found {}",
                statement.statement_count()
            ),
        ));
    }

    if let ControlFlow::Break(rejection) = statement.ast().visit(&mut DenylistCheck { policy }) {
        return Err(rejection);
    }

    check_row_cap(query, policy)
}

fn check_row_cap(query: &Query, policy: &ValidatorPolicy) -> Result<Option<Statement>, Rejection> {
    let mut capped = false;
    if let Some(limit) = &query.limit {
        enforce_cap(limit, policy, "LIMIT")?;
        capped = true;
    }
    if let Some(fetch) = &query.fetch {
        if fetch.percent {
            return Err(Rejection::new(
                ReasonCode::LimitExceeded,
                "FETCH ... PERCENT is not allowed",
            ));
        }
        if let Some(quantity) = &fetch.quantity {
            enforce_cap(quantity, policy, "FETCH")?;
        }
        capped = true;
    }
    if capped {
        return Ok(None);
    }

    let mut query = query.clone();
    query.limit = Some(Expr::Value(Value::Number(
        policy.default_limit.to_string(),
        false,
    )));
    Ok(Some(Statement::Query(Box::new(query))))
}

fn enforce_cap(expr: &Expr, policy: &ValidatorPolicy, clause: &str) -> Result<(), Rejection> {
    let rows = match expr {
        Expr::Value(Value::Number(raw, false)) => raw.parse::<u64>().ok(),
        _ => None,
    };
    match rows {
        Some(rows) if rows <= policy.max_limit => Ok(()),
        Some(rows) => Err(Rejection::new(
            ReasonCode::LimitExceeded,
            format!(
                "{} {} exceeds the maximum of {} rows",
                clause, rows, policy.max_limit
            ),
        )),
        None => Err(Rejection::new(
            ReasonCode::LimitExceeded,
            format!("{} must be a non-negative integer literal, found {}", clause, expr),
        )),
    }
}

struct ReadOnlyCheck;

impl ReadOnlyCheck {
    fn check_body(body: &SetExpr) -> ControlFlow<Rejection> {
        match body {
            SetExpr::Select(select) => {
                if select.into.is_some() {
                    return ControlFlow::Break(Rejection::new(
                        ReasonCode::NonReadOnly,
                        "SELECT ... INTO creates a table",
                    ));
                }
                ControlFlow::Continue(())
            }
            SetExpr::SetOperation { left, right, .. } => {
                Self::check_body(left)?;
                Self::check_body(right)
            }
            SetExpr::Query(_) | SetExpr::Values(_) | SetExpr::Table(_) => {
                ControlFlow::Continue(())
            }
            other => ControlFlow::Break(Rejection::new(
                ReasonCode::NonReadOnly,
                format!("data-modifying query body: {}", other),
            )),
        }
    }
}

impl Visitor for ReadOnlyCheck {
    type Break = Rejection;

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if !query.locks.is_empty() {
            return ControlFlow::Break(Rejection::new(
                ReasonCode::NonReadOnly,
                "row-locking clauses are not allowed",
            ));
        }
        Self::check_body(&query.body)
    }
}

struct DenylistCheck<'a> {
    policy: &'a ValidatorPolicy,
}

impl Visitor for DenylistCheck<'_> {
    type Break = Rejection;

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        let parts: Vec<String> = relation
            .0
            .iter()
            .map(|ident| ident.value.to_ascii_lowercase())
            .collect();
        let Some(last) = parts.last() else {
            return ControlFlow::Continue(());
        };

        let in_catalog = parts[..parts.len() - 1]
            .iter()
            .any(|schema| CATALOG_SCHEMAS.contains(&schema.as_str()));
        if in_catalog || last.starts_with("pg_") {
            return ControlFlow::Break(Rejection::new(
                ReasonCode::DisallowedFunction,
                format!("system relation {} is not accessible", relation),
            ));
        }
        if self.policy.is_denied_function(last) {
            return ControlFlow::Break(Rejection::new(
                ReasonCode::DisallowedFunction,
                format!("function {} is not allowed", relation),
            ));
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if let Expr::Function(function) = expr
            && let Some(last) = function.name.0.last()
            && self.policy.is_denied_function(&last.value)
        {
            return ControlFlow::Break(Rejection::new(
                ReasonCode::DisallowedFunction,
                format!("function {} is not allowed", function.name),
            ));
        }
        ControlFlow::Continue(())
    }
}

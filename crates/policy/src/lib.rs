//! Pure decision logic for untrusted SQL: parsing, read-only validation and
//! tenant scoping. Nothing here performs I/O.

use sqlgate_contracts::{ErrorKind, QueryError, TenantContext};

pub mod parser;
pub mod registry;
pub mod scope;
pub mod validator;

pub use parser::{
    ParseError, ParsedStatement, Projection, StatementKind, TENANT_PLACEHOLDER, TableRef, parse,
};
pub use registry::{RegistryError, SchemaRegistry, TableScope};
pub use scope::enforce_tenant_scope;
pub use validator::{DEFAULT_DENIED_FUNCTIONS, ValidatorPolicy, validate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReasonCode {
    NonReadOnly,
    MultiStatement,
    DisallowedFunction,
    LimitExceeded,
    TenantScopeViolation,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        self.error_kind().as_str()
    }

    pub fn error_kind(self) -> ErrorKind {
        match self {
            ReasonCode::NonReadOnly => ErrorKind::NonReadOnly,
            ReasonCode::MultiStatement => ErrorKind::MultiStatement,
            ReasonCode::DisallowedFunction => ErrorKind::DisallowedFunction,
            ReasonCode::LimitExceeded => ErrorKind::LimitExceeded,
            ReasonCode::TenantScopeViolation => ErrorKind::TenantScopeViolation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub code: ReasonCode,
    pub message: String,
}

impl Rejection {
    pub fn new(code: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for Rejection {}

impl From<Rejection> for QueryError {
    fn from(rejection: Rejection) -> Self {
        QueryError::new(rejection.code.error_kind(), rejection.message)
    }
}

impl From<ParseError> for QueryError {
    fn from(err: ParseError) -> Self {
        let message = match &err.write_keyword {
            Some(keyword) => format!("{} statements are not allowed: {}", keyword, err),
            None => err.to_string(),
        };
        QueryError::new(err.error_kind(), message)
    }
}

/// Outcome of validation. Never partial: an approved statement is complete
/// and may be handed to the scope enforcer as is.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationVerdict {
    Approved(ParsedStatement),
    Rejected(Rejection),
}

impl ValidationVerdict {
    pub fn into_result(self) -> Result<ParsedStatement, Rejection> {
        match self {
            ValidationVerdict::Approved(statement) => Ok(statement),
            ValidationVerdict::Rejected(rejection) => Err(rejection),
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, ValidationVerdict::Approved(_))
    }
}

/// Runs parse, validate and scope in order, stopping at the first failure.
pub fn check_statement(
    sql: &str,
    tenant: &TenantContext,
    registry: &SchemaRegistry,
    policy: &ValidatorPolicy,
) -> Result<ParsedStatement, QueryError> {
    let parsed = parse(sql)?;
    let approved = validate(parsed, policy).into_result()?;
    Ok(enforce_tenant_scope(&approved, tenant, registry)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new("tenant_id")
            .expect("tenant column should be valid")
            .with_tenant_tables(["users", "orders"])
            .expect("tenant tables should register")
            .with_shared_tables(["countries"])
            .expect("shared tables should register")
    }

    fn tenant() -> TenantContext {
        TenantContext::new("tenant_123").expect("tenant should be valid")
    }

    #[test]
    fn check_statement_scopes_and_caps_rows() {
        let statement = check_statement(
            "SELECT COUNT(*) FROM users",
            &tenant(),
            &registry(),
            &ValidatorPolicy::default(),
        )
        .expect("count query should be approved");
        assert_eq!(
            statement.sql(),
            "SELECT COUNT(*) FROM users WHERE users.tenant_id = :tenant_id LIMIT 100"
        );
    }

    #[test]
    fn check_statement_reports_each_stage_kind() {
        let policy = ValidatorPolicy::default();
        let cases = [
            ("SELEC * FROM users", ErrorKind::ParseError),
            ("DELETE FROM users", ErrorKind::NonReadOnly),
            ("EXEC purge_tenant", ErrorKind::NonReadOnly),
            ("SELECT * FROM users; DROP TABLE users;", ErrorKind::MultiStatement),
            ("SELECT pg_sleep(10)", ErrorKind::DisallowedFunction),
            ("SELECT * FROM users LIMIT 5000", ErrorKind::LimitExceeded),
            (
                "SELECT * FROM users WHERE tenant_id = 'tenant_999'",
                ErrorKind::TenantScopeViolation,
            ),
        ];
        for (sql, kind) in cases {
            let err = check_statement(sql, &tenant(), &registry(), &policy).unwrap_err();
            assert_eq!(err.kind, kind, "{}", sql);
        }
    }
}

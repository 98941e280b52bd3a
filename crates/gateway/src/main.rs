use clap::Parser;
use sqlgate_contracts::canonical::sql_fingerprint;
use sqlgate_contracts::{QueryExecutionResult, SqlCandidate, TenantContext};
use sqlgate_gateway::{QueryGateway, config, metrics};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "sqlgate")]
#[command(about = "Run model-generated SQL under read-only and tenant-isolation checks", long_about = None)]
struct Cli {
    /// Tenant the statement runs for. Never taken from the SQL text.
    #[arg(long, env = "SQLGATE_TENANT_ID")]
    tenant: String,

    /// Restrict this request to the given tables (repeatable).
    #[arg(long = "allow-table")]
    allow_tables: Vec<String>,

    /// Parse, validate and scope offline, then print the rewritten statement.
    #[arg(long)]
    check: bool,

    /// Free-text explanation that came with the candidate; logged only.
    #[arg(long)]
    explanation: Option<String>,

    /// Print Prometheus metrics to stderr before exiting.
    #[arg(long)]
    metrics: bool,

    /// Candidate SQL.
    sql: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let tenant = match TenantContext::new(cli.tenant.as_str()) {
        Ok(tenant) => tenant.with_allowed_tables(cli.allow_tables.iter().map(String::as_str)),
        Err(message) => {
            eprintln!("STARTUP_ERROR ERR_INVALID_TENANT: {}", message);
            std::process::exit(2);
        }
    };

    let code = if cli.check {
        check(&cli, &tenant)
    } else {
        run(&cli, &tenant).await
    };

    if cli.metrics {
        match metrics::render() {
            Ok((body, _)) => eprintln!("{}", String::from_utf8_lossy(&body)),
            Err(err) => eprintln!("failed to render metrics: {}", err),
        }
    }

    std::process::exit(code);
}

fn check(cli: &Cli, tenant: &TenantContext) -> i32 {
    let policy = match config::PolicyConfig::load() {
        Ok(policy) => policy,
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            return 1;
        }
    };
    let (registry, validator) = match policy
        .schema_registry()
        .and_then(|registry| Ok((registry, policy.validator_policy()?)))
    {
        Ok(pair) => pair,
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            return 1;
        }
    };

    match sqlgate_policy::check_statement(&cli.sql, tenant, &registry, &validator) {
        Ok(statement) => {
            let sql = statement.sql();
            println!(
                "{}",
                serde_json::json!({
                    "status": "approved",
                    "sql": sql,
                    "fingerprint": sql_fingerprint(&sql),
                })
            );
            0
        }
        Err(err) => {
            let result = QueryExecutionResult::Error(err);
            print_result(&result);
            exit_code(&result)
        }
    }
}

async fn run(cli: &Cli, tenant: &TenantContext) -> i32 {
    let config = match config::GatewayConfig::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            return 1;
        }
    };

    let gateway = match QueryGateway::connect(&config).await {
        Ok(gateway) => gateway,
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            return 1;
        }
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; cancelling query");
            on_interrupt.cancel();
        }
    });

    let candidate = SqlCandidate {
        sql: cli.sql.clone(),
        explanation: cli.explanation.clone(),
    };
    let result = gateway.run(&candidate, tenant, &cancel).await;
    print_result(&result);
    exit_code(&result)
}

/// 0 on success, 3 when a policy stage rejected the statement, 4 when the
/// database side failed.
fn exit_code(result: &QueryExecutionResult) -> i32 {
    match result.error_kind() {
        None => 0,
        Some(kind) if kind.is_rejection() => 3,
        Some(_) => 4,
    }
}

fn print_result(result: &QueryExecutionResult) {
    match serde_json::to_string_pretty(result) {
        Ok(json) => println!("{}", json),
        Err(err) => eprintln!("failed to serialize result: {}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlgate_contracts::{ErrorKind, QueryError, ResultSet};

    #[test]
    fn exit_code_separates_rejections_from_database_failures() {
        let ok = QueryExecutionResult::Ok(ResultSet {
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
            truncated: false,
        });
        assert_eq!(exit_code(&ok), 0);

        for kind in [
            ErrorKind::ParseError,
            ErrorKind::NonReadOnly,
            ErrorKind::TenantScopeViolation,
        ] {
            let rejected = QueryExecutionResult::Error(QueryError::new(kind, "rejected"));
            assert_eq!(exit_code(&rejected), 3, "{}", kind.as_str());
        }
        for kind in [ErrorKind::ExecutionError, ErrorKind::TimedOut, ErrorKind::Cancelled] {
            let failed = QueryExecutionResult::Error(QueryError::new(kind, "failed"));
            assert_eq!(exit_code(&failed), 4, "{}", kind.as_str());
        }
    }
}

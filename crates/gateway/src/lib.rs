//! Runs untrusted, model-generated SQL against Postgres only after it has
//! been parsed, proven read-only and scoped to the caller's tenant.

pub mod config;
pub mod executor;
pub mod formatter;
pub mod metrics;
pub mod pipeline;
pub mod postgres;

pub use executor::{
    AcquireError, ConnectionPool, DbError, ExecutionGateway, ExecutionRequest, ExecutionState,
    QueryConnection, RawColumn, RawRows, RawValue, RetryPolicy,
};
pub use pipeline::{PolicyStages, QueryGateway};

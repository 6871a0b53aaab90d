//! Infrastructure layer: tenant-scoped record access over Postgres.
//!
//! - [`store::TenantScopedStore`]: every read and write constrained to the
//!   tenant in context
//! - [`claim::ClaimEngine`]: concurrent-safe batch claiming with backoff
//! - [`idempotency::IdempotentWriter`]: insert-or-return keyed writes
//! - [`schema::ColumnResolver`]: logical field to physical column mapping
//!
//! Backends live under [`backend`]; the in-memory one backs the tests.

pub mod backend;
pub mod claim;
pub mod config;
pub mod db;
pub mod error;
pub mod filter;
pub mod idempotency;
pub mod schema;
pub mod store;
pub mod value;

#[cfg(test)]
mod testing;


pub use backend::{InMemoryBackend, PostgresBackend, RecordBackend, Row, ScopedSql};
pub use claim::{
    BackoffColumns, BackoffPolicy, BatchReport, ClaimConfig, ClaimEngine, ClaimHandler, ClaimWorker, ClaimedBatch,
    ScheduledRetry, WorkerHandle, WorkerStats,
};
pub use config::{ConfigError, DatabaseConfig, WorkerConfig};
pub use error::{StoreError, StoreResult};
pub use filter::{Direction, Filter, Op, Patch};
pub use idempotency::{IdempotencyOutcome, IdempotentWriter};
pub use schema::{ColumnResolver, NamingConvention, Record, TableDescriptor};
pub use store::{ScopedQuery, TenantScopedStore};
pub use value::Value;

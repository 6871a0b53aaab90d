//! Physical table access behind the tenant-scoped store.
//!
//! A backend executes already-scoped statements. It never decides the
//! tenant: every read/update/delete/claim receives the tenant explicitly and
//! must constrain on `table.tenant_column`, and rows handed to `insert` /
//! `upsert` already carry it.
//!
//! Rows cross this seam as JSON objects keyed by **physical** column names.
//! Unique-constraint violations must surface as [`StoreError::Conflict`];
//! each backend owns the predicate that recognises them.
//!
//! [`StoreError::Conflict`]: crate::error::StoreError::Conflict

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use tenantgate_core::TenantId;

use crate::error::StoreResult;
use crate::filter::{Assignment, ColumnCondition, Direction};
use crate::schema::PhysicalTable;
use crate::value::Value;

pub use in_memory::InMemoryBackend;
pub use postgres::{PostgresBackend, ScopedSql};

/// One stored row, keyed by column name.
pub type Row = serde_json::Map<String, JsonValue>;

/// A tenant-scoped read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Select {
    pub conditions: Vec<ColumnCondition>,
    pub order: Vec<(String, Direction)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// The claim-batch statement, resolved to columns.
///
/// Backends must select at most `limit` rows of the tenant whose status is
/// `pending`, whose next-attempt (and schedule, if any) time is null or not
/// after `now`, oldest `created_at_column` first, skipping rows locked by a
/// concurrent claim, and flip them to `in_progress` in the same atomic step.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimStatement {
    pub status_column: String,
    pub pending: Value,
    pub in_progress: Value,
    pub created_at_column: String,
    pub next_attempt_at_column: String,
    pub schedule_column: Option<String>,
    /// Stamped with `now` on every claimed row when set.
    pub claimed_at_column: Option<String>,
    pub limit: u64,
    pub now: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait RecordBackend: Send + Sync {
    async fn select(
        &self,
        table: &PhysicalTable,
        tenant_id: TenantId,
        query: &Select,
    ) -> StoreResult<Vec<Row>>;

    async fn count(
        &self,
        table: &PhysicalTable,
        tenant_id: TenantId,
        conditions: &[ColumnCondition],
    ) -> StoreResult<u64>;

    /// Plain multi-row insert; any unique violation fails the whole batch.
    async fn insert(&self, table: &PhysicalTable, rows: Vec<Row>) -> StoreResult<Vec<Row>>;

    /// Multi-row insert-or-update keyed on the id column.
    ///
    /// An id collision only updates a row owned by the same tenant; a row of
    /// another tenant is left untouched and reported as a conflict.
    async fn upsert(&self, table: &PhysicalTable, rows: Vec<Row>) -> StoreResult<Vec<Row>>;

    /// Returns the updated rows.
    async fn update(
        &self,
        table: &PhysicalTable,
        tenant_id: TenantId,
        conditions: &[ColumnCondition],
        assignments: &[Assignment],
    ) -> StoreResult<Vec<Row>>;

    /// Returns the number of deleted rows.
    async fn delete(
        &self,
        table: &PhysicalTable,
        tenant_id: TenantId,
        conditions: &[ColumnCondition],
    ) -> StoreResult<u64>;

    /// Atomically claim a batch; rows come back oldest first.
    async fn claim(
        &self,
        table: &PhysicalTable,
        tenant_id: TenantId,
        claim: &ClaimStatement,
    ) -> StoreResult<Vec<Row>>;
}

#[async_trait::async_trait]
impl<B> RecordBackend for Arc<B>
where
    B: RecordBackend + ?Sized,
{
    async fn select(
        &self,
        table: &PhysicalTable,
        tenant_id: TenantId,
        query: &Select,
    ) -> StoreResult<Vec<Row>> {
        (**self).select(table, tenant_id, query).await
    }

    async fn count(
        &self,
        table: &PhysicalTable,
        tenant_id: TenantId,
        conditions: &[ColumnCondition],
    ) -> StoreResult<u64> {
        (**self).count(table, tenant_id, conditions).await
    }

    async fn insert(&self, table: &PhysicalTable, rows: Vec<Row>) -> StoreResult<Vec<Row>> {
        (**self).insert(table, rows).await
    }

    async fn upsert(&self, table: &PhysicalTable, rows: Vec<Row>) -> StoreResult<Vec<Row>> {
        (**self).upsert(table, rows).await
    }

    async fn update(
        &self,
        table: &PhysicalTable,
        tenant_id: TenantId,
        conditions: &[ColumnCondition],
        assignments: &[Assignment],
    ) -> StoreResult<Vec<Row>> {
        (**self).update(table, tenant_id, conditions, assignments).await
    }

    async fn delete(
        &self,
        table: &PhysicalTable,
        tenant_id: TenantId,
        conditions: &[ColumnCondition],
    ) -> StoreResult<u64> {
        (**self).delete(table, tenant_id, conditions).await
    }

    async fn claim(
        &self,
        table: &PhysicalTable,
        tenant_id: TenantId,
        claim: &ClaimStatement,
    ) -> StoreResult<Vec<Row>> {
        (**self).claim(table, tenant_id, claim).await
    }
}

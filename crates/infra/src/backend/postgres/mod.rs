//! Postgres-backed record backend.
//!
//! Statements are built by [`statements`] and executed on a shared
//! [`PgPool`]. Rows are read back through `to_jsonb(..)`, so any table
//! shape decodes without per-type row mappings.
//!
//! ## Error Mapping
//!
//! | SQLx error | SQLSTATE | StoreError |
//! |------------|----------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (undefined table / column) | `42P01`, `42703` | `Configuration` |
//! | Database (serialization failure, deadlock, query canceled) | `40001`, `40P01`, `57014` | `Transient` |
//! | Database (connection exception) | class `08` | `Transient` |
//! | Database (other) | any other | `Database` |
//! | PoolTimedOut / PoolClosed / Io | N/A | `Transient` |
//! | Other | N/A | `Database` |
//!
//! The tenant column must be a `uuid` column; tenant ids are bound natively.

mod scoped_sql;
pub(crate) mod statements;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row as _};
use tracing::{debug, instrument};

use tenantgate_core::TenantId;

use crate::error::{StoreError, StoreResult};
use crate::filter::{Assignment, ColumnCondition};
use crate::schema::PhysicalTable;
use crate::value::compare_cells;

use super::{ClaimStatement, RecordBackend, Row, Select};

pub use scoped_sql::ScopedSql;

/// Postgres record backend.
///
/// Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct PostgresBackend {
    pool: Arc<PgPool>,
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert (or upsert) rows, one statement per distinct column set, in one
    /// transaction. Results come back in input order.
    async fn write(
        &self,
        operation: &'static str,
        table: &PhysicalTable,
        rows: Vec<Row>,
        upsert: bool,
    ) -> StoreResult<Vec<Row>> {
        if rows.is_empty() {
            return Ok(vec![]);
        }
        let total = rows.len();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut written: Vec<Option<Row>> = vec![None; total];
        for (columns, group) in group_by_columns(rows) {
            let (positions, rows): (Vec<usize>, Vec<Row>) = group.into_iter().unzip();
            let mut qb = statements::insert(table, &columns, rows, upsert);
            let returned = qb
                .build()
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error(operation, e))?;

            if returned.len() != positions.len() {
                // Dropping `tx` rolls the whole batch back.
                return Err(StoreError::conflict(format!(
                    "{} of {} rows on {} collide with an id owned by another tenant",
                    positions.len() - returned.len(),
                    positions.len(),
                    table.name
                )));
            }
            for (pos, row) in positions.into_iter().zip(decode(returned)?) {
                written[pos] = Some(row);
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        Ok(written.into_iter().flatten().collect())
    }
}

/// Group rows by their exact key set so absent columns fall back to the
/// column default instead of NULL. Groups keep first-seen order.
fn group_by_columns(rows: Vec<Row>) -> Vec<(Vec<String>, Vec<(usize, Row)>)> {
    let mut groups: Vec<(Vec<String>, Vec<(usize, Row)>)> = Vec::new();
    let mut index: HashMap<Vec<String>, usize> = HashMap::new();

    for (pos, row) in rows.into_iter().enumerate() {
        let columns: Vec<String> = row.keys().cloned().collect();
        match index.get(&columns) {
            Some(&g) => groups[g].1.push((pos, row)),
            None => {
                index.insert(columns.clone(), groups.len());
                groups.push((columns, vec![(pos, row)]));
            }
        }
    }
    groups
}

/// Restore the claim order: creation time, then id.
fn sort_claimed(rows: &mut [Row], created_at_column: &str, id_column: &str) {
    let null = JsonValue::Null;
    rows.sort_by(|a, b| {
        [created_at_column, id_column]
            .into_iter()
            .map(|c| compare_cells(a.get(c).unwrap_or(&null), b.get(c).unwrap_or(&null)))
            .find(|o| o.is_ne())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

fn decode(rows: Vec<PgRow>) -> StoreResult<Vec<Row>> {
    rows.into_iter()
        .map(|row| {
            let doc: JsonValue = row
                .try_get(statements::DOC)
                .map_err(|e| map_sqlx_error("decode_row", e))?;
            match doc {
                JsonValue::Object(map) => Ok(map),
                other => Err(StoreError::serialization(format!(
                    "expected a JSON object row, got {other}"
                ))),
            }
        })
        .collect()
}

#[async_trait::async_trait]
impl RecordBackend for PostgresBackend {
    async fn select(
        &self,
        table: &PhysicalTable,
        tenant_id: TenantId,
        query: &Select,
    ) -> StoreResult<Vec<Row>> {
        let mut qb = statements::select(table, tenant_id, query);
        let rows = qb
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("select", e))?;
        decode(rows)
    }

    async fn count(
        &self,
        table: &PhysicalTable,
        tenant_id: TenantId,
        conditions: &[ColumnCondition],
    ) -> StoreResult<u64> {
        let mut qb = statements::count(table, tenant_id, conditions);
        let count: i64 = qb
            .build_query_scalar()
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count", e))?;
        Ok(count.max(0) as u64)
    }

    async fn insert(&self, table: &PhysicalTable, rows: Vec<Row>) -> StoreResult<Vec<Row>> {
        self.write("insert", table, rows, false).await
    }

    async fn upsert(&self, table: &PhysicalTable, rows: Vec<Row>) -> StoreResult<Vec<Row>> {
        self.write("upsert", table, rows, true).await
    }

    async fn update(
        &self,
        table: &PhysicalTable,
        tenant_id: TenantId,
        conditions: &[ColumnCondition],
        assignments: &[Assignment],
    ) -> StoreResult<Vec<Row>> {
        let mut qb = statements::update(table, tenant_id, conditions, assignments);
        let rows = qb
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update", e))?;
        decode(rows)
    }

    async fn delete(
        &self,
        table: &PhysicalTable,
        tenant_id: TenantId,
        conditions: &[ColumnCondition],
    ) -> StoreResult<u64> {
        let mut qb = statements::delete(table, tenant_id, conditions);
        let result = qb
            .build()
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(
        level = "debug",
        skip(self, table, claim),
        fields(table = %table.name, tenant_id = %tenant_id, limit = claim.limit),
        err
    )]
    async fn claim(
        &self,
        table: &PhysicalTable,
        tenant_id: TenantId,
        claim: &ClaimStatement,
    ) -> StoreResult<Vec<Row>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut qb = statements::claim(table, tenant_id, claim);
        let rows = qb
            .build()
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        // UPDATE .. RETURNING does not preserve the CTE order.
        let mut rows = decode(rows)?;
        sort_claimed(&mut rows, &claim.created_at_column, &table.id_column);
        debug!(claimed = rows.len(), "claim committed");
        Ok(rows)
    }
}

/// Map SQLx errors to store errors.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    if is_unique_violation(&err) {
        return StoreError::Conflict(format!("{operation}: {err}"));
    }
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("42P01" | "42703") => StoreError::Configuration(msg),
                Some("40001" | "40P01" | "57014") => StoreError::Transient(msg),
                Some(code) if code.starts_with("08") => StoreError::Transient(msg),
                _ => StoreError::Database(msg),
            }
        }
        e @ (sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)) => {
            StoreError::Transient(format!("{operation}: {e}"))
        }
        other => StoreError::Database(format!("sqlx error in {operation}: {other}")),
    }
}

/// Check if an error is a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

//! In-memory backend for tests/dev.
//!
//! Each statement runs under one write lock over the whole table map, which
//! makes every claim trivially atomic and exclusive. Declared unique keys
//! are checked here the way the database would check its constraints.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};

use serde_json::Value as JsonValue;

use tenantgate_core::TenantId;

use crate::error::{StoreError, StoreResult};
use crate::filter::{Assignment, ColumnCondition, Op};
use crate::schema::PhysicalTable;
use crate::value::{Value, compare_cells};

use super::{ClaimStatement, RecordBackend, Row, Select};

/// In-memory tables keyed by physical table name.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug)]
pub struct InMemoryBackend {
    tables: RwLock<HashMap<String, Vec<Row>>>,
    next_id: AtomicI64,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Every row of `table`, across all tenants, in insertion order.
    ///
    /// Inspection hook for tests; the store never calls it.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .read()
            .ok()
            .and_then(|t| t.get(table).cloned())
            .unwrap_or_default()
    }

    fn assign_id(&self, table: &PhysicalTable, row: &mut Row) {
        let missing = row.get(&table.id_column).is_none_or(JsonValue::is_null);
        if missing {
            let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed);
            row.insert(table.id_column.clone(), JsonValue::from(id));
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> StoreError {
    StoreError::Database("in-memory table lock poisoned".to_string())
}

fn cell<'a>(row: &'a Row, column: &str) -> &'a JsonValue {
    row.get(column).unwrap_or(&JsonValue::Null)
}

fn same_cell(a: &JsonValue, b: &JsonValue) -> bool {
    !a.is_null() && !b.is_null() && compare_cells(a, b) == Ordering::Equal
}

fn eval(op: &Op, cell: &JsonValue) -> bool {
    match op {
        Op::Eq(v) => v.compare_json(cell) == Some(Ordering::Equal),
        Op::Ne(v) => !cell.is_null() && v.compare_json(cell) != Some(Ordering::Equal),
        Op::Lt(v) => v.compare_json(cell) == Some(Ordering::Less),
        Op::Lte(v) => matches!(v.compare_json(cell), Some(Ordering::Less | Ordering::Equal)),
        Op::Gt(v) => v.compare_json(cell) == Some(Ordering::Greater),
        Op::Gte(v) => matches!(v.compare_json(cell), Some(Ordering::Greater | Ordering::Equal)),
        Op::In(vs) => vs.iter().any(|v| v.compare_json(cell) == Some(Ordering::Equal)),
        Op::IsNull => cell.is_null(),
        Op::IsNotNull => !cell.is_null(),
    }
}

fn owned_by(table: &PhysicalTable, row: &Row, tenant_id: TenantId) -> bool {
    Value::from(tenant_id).compare_json(cell(row, &table.tenant_column)) == Some(Ordering::Equal)
}

fn matches(table: &PhysicalTable, row: &Row, tenant_id: TenantId, conditions: &[ColumnCondition]) -> bool {
    owned_by(table, row, tenant_id)
        && conditions
            .iter()
            .all(|c| eval(&c.op, cell(row, &c.column)))
}

/// Reject `candidate` if it collides with any row other than `skip`.
fn check_unique(
    table: &PhysicalTable,
    rows: &[Row],
    candidate: &Row,
    skip: Option<usize>,
) -> StoreResult<()> {
    let others = rows
        .iter()
        .enumerate()
        .filter(|(i, _)| Some(*i) != skip)
        .map(|(_, r)| r);

    for other in others {
        if same_cell(cell(candidate, &table.id_column), cell(other, &table.id_column)) {
            return Err(StoreError::conflict(format!(
                "duplicate key on {}({})",
                table.name, table.id_column
            )));
        }
        for key in &table.unique_keys {
            if key
                .iter()
                .all(|c| same_cell(cell(candidate, c), cell(other, c)))
            {
                return Err(StoreError::conflict(format!(
                    "duplicate key on {}({})",
                    table.name,
                    key.join(", ")
                )));
            }
        }
    }
    Ok(())
}

fn require_tenant(table: &PhysicalTable, row: &Row) -> StoreResult<()> {
    if cell(row, &table.tenant_column).is_null() {
        return Err(StoreError::configuration(format!(
            "row for {} is missing {}",
            table.name, table.tenant_column
        )));
    }
    Ok(())
}

#[async_trait::async_trait]
impl RecordBackend for InMemoryBackend {
    async fn select(
        &self,
        table: &PhysicalTable,
        tenant_id: TenantId,
        query: &Select,
    ) -> StoreResult<Vec<Row>> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        let Some(rows) = tables.get(&table.name) else {
            return Ok(vec![]);
        };

        let mut out: Vec<Row> = rows
            .iter()
            .filter(|r| matches(table, r, tenant_id, &query.conditions))
            .cloned()
            .collect();

        if !query.order.is_empty() {
            out.sort_by(|a, b| {
                query
                    .order
                    .iter()
                    .map(|(column, dir)| {
                        let o = compare_cells(cell(a, column), cell(b, column));
                        match dir {
                            crate::filter::Direction::Asc => o,
                            crate::filter::Direction::Desc => o.reverse(),
                        }
                    })
                    .find(|o| *o != Ordering::Equal)
                    .unwrap_or(Ordering::Equal)
            });
        }

        let offset = query.offset.unwrap_or(0) as usize;
        let limit = query.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        Ok(out.into_iter().skip(offset).take(limit).collect())
    }

    async fn count(
        &self,
        table: &PhysicalTable,
        tenant_id: TenantId,
        conditions: &[ColumnCondition],
    ) -> StoreResult<u64> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        Ok(tables
            .get(&table.name)
            .map(|rows| {
                rows.iter()
                    .filter(|r| matches(table, r, tenant_id, conditions))
                    .count() as u64
            })
            .unwrap_or(0))
    }

    async fn insert(&self, table: &PhysicalTable, rows: Vec<Row>) -> StoreResult<Vec<Row>> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        let mut staged = tables.get(&table.name).cloned().unwrap_or_default();

        let mut inserted = Vec::with_capacity(rows.len());
        for mut row in rows {
            require_tenant(table, &row)?;
            self.assign_id(table, &mut row);
            check_unique(table, &staged, &row, None)?;
            staged.push(row.clone());
            inserted.push(row);
        }

        tables.insert(table.name.clone(), staged);
        Ok(inserted)
    }

    async fn upsert(&self, table: &PhysicalTable, rows: Vec<Row>) -> StoreResult<Vec<Row>> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        let mut staged = tables.get(&table.name).cloned().unwrap_or_default();

        let mut saved = Vec::with_capacity(rows.len());
        for mut row in rows {
            require_tenant(table, &row)?;
            let id = cell(&row, &table.id_column).clone();
            let existing = staged
                .iter()
                .position(|r| same_cell(cell(r, &table.id_column), &id));

            match existing {
                Some(idx) => {
                    if !same_cell(
                        cell(&staged[idx], &table.tenant_column),
                        cell(&row, &table.tenant_column),
                    ) {
                        return Err(StoreError::conflict(format!(
                            "id {id} on {} belongs to another tenant",
                            table.name
                        )));
                    }
                    let mut merged = staged[idx].clone();
                    merged.extend(row);
                    check_unique(table, &staged, &merged, Some(idx))?;
                    staged[idx] = merged.clone();
                    saved.push(merged);
                }
                None => {
                    self.assign_id(table, &mut row);
                    check_unique(table, &staged, &row, None)?;
                    staged.push(row.clone());
                    saved.push(row);
                }
            }
        }

        tables.insert(table.name.clone(), staged);
        Ok(saved)
    }

    async fn update(
        &self,
        table: &PhysicalTable,
        tenant_id: TenantId,
        conditions: &[ColumnCondition],
        assignments: &[Assignment],
    ) -> StoreResult<Vec<Row>> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        let Some(current) = tables.get(&table.name) else {
            return Ok(vec![]);
        };
        let mut staged = current.clone();

        let targets: Vec<usize> = staged
            .iter()
            .enumerate()
            .filter(|(_, r)| matches(table, r, tenant_id, conditions))
            .map(|(i, _)| i)
            .collect();

        let mut updated = Vec::with_capacity(targets.len());
        for idx in targets {
            let mut row = staged[idx].clone();
            for a in assignments {
                row.insert(a.column.clone(), a.value.to_json());
            }
            check_unique(table, &staged, &row, Some(idx))?;
            staged[idx] = row.clone();
            updated.push(row);
        }

        tables.insert(table.name.clone(), staged);
        Ok(updated)
    }

    async fn delete(
        &self,
        table: &PhysicalTable,
        tenant_id: TenantId,
        conditions: &[ColumnCondition],
    ) -> StoreResult<u64> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        let Some(rows) = tables.get_mut(&table.name) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|r| !matches(table, r, tenant_id, conditions));
        Ok((before - rows.len()) as u64)
    }

    async fn claim(
        &self,
        table: &PhysicalTable,
        tenant_id: TenantId,
        claim: &ClaimStatement,
    ) -> StoreResult<Vec<Row>> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        let Some(rows) = tables.get_mut(&table.name) else {
            return Ok(vec![]);
        };

        let now = Value::Timestamp(claim.now);
        let due = |row: &Row, column: &str| {
            let c = cell(row, column);
            c.is_null() || matches!(now.compare_json(c), Some(Ordering::Less | Ordering::Equal))
        };

        let mut candidates: Vec<usize> = rows
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                owned_by(table, r, tenant_id)
                    && claim.pending.compare_json(cell(r, &claim.status_column)) == Some(Ordering::Equal)
                    && due(r, &claim.next_attempt_at_column)
                    && claim.schedule_column.as_deref().is_none_or(|s| due(r, s))
                    && table
                        .soft_delete_column
                        .as_deref()
                        .is_none_or(|d| cell(r, d).is_null())
            })
            .map(|(i, _)| i)
            .collect();

        candidates.sort_by(|a, b| {
            compare_cells(
                cell(&rows[*a], &claim.created_at_column),
                cell(&rows[*b], &claim.created_at_column),
            )
            .then_with(|| compare_cells(cell(&rows[*a], &table.id_column), cell(&rows[*b], &table.id_column)))
        });
        candidates.truncate(claim.limit as usize);

        let mut claimed = Vec::with_capacity(candidates.len());
        for idx in candidates {
            let row = &mut rows[idx];
            row.insert(claim.status_column.clone(), claim.in_progress.to_json());
            if let Some(column) = &claim.claimed_at_column {
                row.insert(column.clone(), now.to_json());
            }
            claimed.push(row.clone());
        }
        Ok(claimed)
    }
}

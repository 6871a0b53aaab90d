//! Tenant-scoped record store.
//!
//! `TenantScopedStore` is the only way records reach a backend. It asks the
//! tenant context for the active tenant at the start of every operation,
//! fails with [`StoreError::MissingTenant`] before touching the backend when
//! there is none, and forces the tenant into every filter and every written
//! row.
//!
//! A filter condition or patch assignment naming the tenant field is
//! dropped and replaced by the active tenant (a `debug` event records it).
//! Callers never get to choose the tenant through a filter.

mod query;

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value as JsonValue};
use tracing::{Span, debug, field, instrument};

use tenantgate_core::{TenantContext, TenantId};

use crate::backend::{PostgresBackend, RecordBackend, Row, ScopedSql, Select};
use crate::error::{StoreError, StoreResult};
use crate::filter::{Assignment, ColumnCondition, Direction, Filter, Op, Patch};
use crate::schema::{ColumnResolver, PhysicalTable, Record, TableDescriptor};
use crate::value::Value;

pub use query::ScopedQuery;

/// CRUD access to one record type, bound to whatever tenant the context
/// reports at call time.
pub struct TenantScopedStore<R, B> {
    backend: B,
    tenants: Arc<dyn TenantContext>,
    descriptor: Arc<TableDescriptor>,
    resolver: Arc<ColumnResolver>,
    table: Arc<PhysicalTable>,
    _record: PhantomData<fn() -> R>,
}

impl<R, B: Clone> Clone for TenantScopedStore<R, B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            tenants: Arc::clone(&self.tenants),
            descriptor: Arc::clone(&self.descriptor),
            resolver: Arc::clone(&self.resolver),
            table: Arc::clone(&self.table),
            _record: PhantomData,
        }
    }
}

impl<R, B> std::fmt::Debug for TenantScopedStore<R, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantScopedStore")
            .field("table", &self.table.name)
            .finish_non_exhaustive()
    }
}

impl<R, B> TenantScopedStore<R, B>
where
    R: Record,
    B: RecordBackend,
{
    /// Build a store for `R` using its own descriptor.
    pub fn new<C>(backend: B, tenants: C) -> StoreResult<Self>
    where
        C: TenantContext + 'static,
    {
        Self::with_descriptor(backend, tenants, R::descriptor())
    }

    /// Build a store with an explicit descriptor (e.g. a different table
    /// holding the same record shape).
    pub fn with_descriptor<C>(backend: B, tenants: C, descriptor: TableDescriptor) -> StoreResult<Self>
    where
        C: TenantContext + 'static,
    {
        let (resolver, table) = descriptor.resolve()?;
        Ok(Self {
            backend,
            tenants: Arc::new(tenants),
            descriptor: Arc::new(descriptor),
            resolver: Arc::new(resolver),
            table: Arc::new(table),
            _record: PhantomData,
        })
    }

    /// The active tenant, or `MissingTenant` when the context has none.
    pub fn tenant_id(&self) -> StoreResult<TenantId> {
        self.require_tenant("tenant_id")
    }

    pub fn descriptor(&self) -> &TableDescriptor {
        &self.descriptor
    }

    pub fn resolver(&self) -> &ColumnResolver {
        &self.resolver
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub(crate) fn physical(&self) -> &PhysicalTable {
        &self.table
    }

    /// Resolve the tenant and record it on the current span.
    pub(crate) fn require_tenant(&self, operation: &'static str) -> StoreResult<TenantId> {
        let tenant_id = self
            .tenants
            .current_tenant_id()
            .ok_or(StoreError::missing_tenant(operation))?;
        Span::current().record("tenant_id", field::display(tenant_id));
        Ok(tenant_id)
    }

    fn is_tenant_field(&self, field: &str) -> bool {
        field == self.descriptor.tenant_field()
    }

    /// Resolve a filter to columns, dropping conditions on the tenant field.
    pub(crate) fn scope_conditions(&self, filter: Filter) -> StoreResult<Vec<ColumnCondition>> {
        let mut conditions = Vec::with_capacity(filter.conditions().len() + 1);
        for condition in filter.into_conditions() {
            if self.is_tenant_field(&condition.field) {
                debug!(
                    table = %self.table.name,
                    op = ?condition.op,
                    "tenant condition overridden by active tenant"
                );
                continue;
            }
            conditions.push(ColumnCondition {
                column: self.resolver.column(&condition.field)?.to_string(),
                op: condition.op,
            });
        }
        Ok(conditions)
    }

    /// Conditions plus the soft-delete guard, for reads.
    pub(crate) fn visible_conditions(&self, filter: Filter) -> StoreResult<Vec<ColumnCondition>> {
        let mut conditions = self.scope_conditions(filter)?;
        if let Some(column) = &self.table.soft_delete_column {
            conditions.push(ColumnCondition {
                column: column.clone(),
                op: Op::IsNull,
            });
        }
        Ok(conditions)
    }

    pub(crate) fn resolve_patch(&self, patch: Patch) -> StoreResult<Vec<Assignment>> {
        let mut assignments = Vec::with_capacity(patch.assignments().len());
        for (field, value) in patch.into_assignments() {
            if self.is_tenant_field(&field) {
                debug!(table = %self.table.name, "tenant assignment dropped from patch");
                continue;
            }
            assignments.push(Assignment {
                column: self.resolver.column(&field)?.to_string(),
                value,
            });
        }
        Ok(assignments)
    }

    pub(crate) fn resolve_order(&self, order: &[(String, Direction)]) -> StoreResult<Vec<(String, Direction)>> {
        order
            .iter()
            .map(|(field, d)| Ok((self.resolver.column(field)?.to_string(), *d)))
            .collect()
    }

    fn logical_map(record: &R) -> StoreResult<Map<String, JsonValue>> {
        match serde_json::to_value(record)? {
            JsonValue::Object(map) => Ok(map),
            other => Err(StoreError::serialization(format!(
                "records must serialize to a JSON object, got {other}"
            ))),
        }
    }

    /// Serialize a record for writing: tenant forced, null id dropped so the
    /// column default applies.
    fn encode(&self, record: &R, tenant_id: TenantId) -> StoreResult<Row> {
        let mut map = Self::logical_map(record)?;
        map.insert(
            self.descriptor.tenant_field().to_string(),
            serde_json::to_value(tenant_id)?,
        );
        if map.get(self.descriptor.id_field()).is_some_and(JsonValue::is_null) {
            map.remove(self.descriptor.id_field());
        }
        self.resolver.to_physical(map)
    }

    pub(crate) fn decode(&self, row: Row) -> StoreResult<R> {
        let logical = self.resolver.to_logical(row);
        Ok(serde_json::from_value(JsonValue::Object(logical))?)
    }

    fn decode_all(&self, rows: Vec<Row>) -> StoreResult<Vec<R>> {
        rows.into_iter().map(|row| self.decode(row)).collect()
    }

    fn id_filter(&self, id: Value) -> Filter {
        Filter::by(self.descriptor.id_field(), id)
    }

    pub(crate) async fn select_visible(
        &self,
        tenant_id: TenantId,
        conditions: Vec<ColumnCondition>,
        order: Vec<(String, Direction)>,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> StoreResult<Vec<R>> {
        let query = Select {
            conditions,
            order,
            limit,
            offset,
        };
        let rows = self.backend.select(&self.table, tenant_id, &query).await?;
        self.decode_all(rows)
    }

    #[instrument(skip_all, fields(table = %self.table.name, tenant_id = field::Empty), err)]
    pub async fn find(&self, filter: Filter) -> StoreResult<Vec<R>> {
        let tenant_id = self.require_tenant("find")?;
        let conditions = self.visible_conditions(filter)?;
        self.select_visible(tenant_id, conditions, vec![], None, None)
            .await
    }

    #[instrument(skip_all, fields(table = %self.table.name, tenant_id = field::Empty), err)]
    pub async fn find_one(&self, filter: Filter) -> StoreResult<Option<R>> {
        let tenant_id = self.require_tenant("find_one")?;
        let conditions = self.visible_conditions(filter)?;
        let mut found = self
            .select_visible(tenant_id, conditions, vec![], Some(1), None)
            .await?;
        Ok(found.pop())
    }

    pub async fn find_one_or_fail(&self, filter: Filter) -> StoreResult<R> {
        let description = format!("{:?}", filter.conditions());
        self.find_one(filter).await?.ok_or_else(|| {
            StoreError::not_found(format!("{} matching {description}", self.table.name))
        })
    }

    pub async fn find_by_id(&self, id: impl Into<Value>) -> StoreResult<Option<R>> {
        self.find_one(self.id_filter(id.into())).await
    }

    pub async fn find_by_id_or_fail(&self, id: impl Into<Value>) -> StoreResult<R> {
        let id = id.into();
        self.find_one(self.id_filter(id.clone()))
            .await?
            .ok_or_else(|| StoreError::not_found(format!("{} with id {id}", self.table.name)))
    }

    #[instrument(skip_all, fields(table = %self.table.name, tenant_id = field::Empty), err)]
    pub async fn count(&self, filter: Filter) -> StoreResult<u64> {
        let tenant_id = self.require_tenant("count")?;
        let conditions = self.visible_conditions(filter)?;
        self.backend.count(&self.table, tenant_id, &conditions).await
    }

    pub async fn exists(&self, filter: Filter) -> StoreResult<bool> {
        Ok(self.find_one(filter).await?.is_some())
    }

    /// Build an unsaved record from a partial JSON object, with the tenant
    /// field forced to the active tenant.
    pub fn create(&self, partial: JsonValue) -> StoreResult<R> {
        let tenant_id = self.require_tenant("create")?;
        let mut map = match partial {
            JsonValue::Object(map) => map,
            JsonValue::Null => Map::new(),
            other => {
                return Err(StoreError::serialization(format!(
                    "create expects a JSON object, got {other}"
                )));
            }
        };
        map.insert(
            self.descriptor.tenant_field().to_string(),
            serde_json::to_value(tenant_id)?,
        );
        Ok(serde_json::from_value(JsonValue::Object(map))?)
    }

    /// Insert-or-update one record keyed on its id.
    pub async fn save(&self, record: &R) -> StoreResult<R> {
        let mut saved = self.save_all(std::slice::from_ref(record)).await?;
        saved
            .pop()
            .ok_or_else(|| StoreError::Database(format!("save on {} returned no row", self.table.name)))
    }

    /// Insert-or-update many records in one statement.
    ///
    /// An id that already belongs to another tenant fails the whole batch
    /// with `Conflict` and leaves that row untouched.
    #[instrument(skip_all, fields(table = %self.table.name, tenant_id = field::Empty, count = records.len()), err)]
    pub async fn save_all(&self, records: &[R]) -> StoreResult<Vec<R>> {
        let tenant_id = self.require_tenant("save")?;
        if records.is_empty() {
            return Ok(vec![]);
        }
        let rows = records
            .iter()
            .map(|r| self.encode(r, tenant_id))
            .collect::<StoreResult<Vec<_>>>()?;
        let saved = self.backend.upsert(&self.table, rows).await?;
        self.decode_all(saved)
    }

    /// Plain insert; unique violations surface as `Conflict`.
    pub async fn insert(&self, record: &R) -> StoreResult<R> {
        let mut inserted = self.insert_all(std::slice::from_ref(record)).await?;
        inserted
            .pop()
            .ok_or_else(|| StoreError::Database(format!("insert on {} returned no row", self.table.name)))
    }

    #[instrument(skip_all, fields(table = %self.table.name, tenant_id = field::Empty, count = records.len()), err)]
    pub async fn insert_all(&self, records: &[R]) -> StoreResult<Vec<R>> {
        let tenant_id = self.require_tenant("insert")?;
        if records.is_empty() {
            return Ok(vec![]);
        }
        let rows = records
            .iter()
            .map(|r| self.encode(r, tenant_id))
            .collect::<StoreResult<Vec<_>>>()?;
        let inserted = self.backend.insert(&self.table, rows).await?;
        self.decode_all(inserted)
    }

    /// Apply `patch` to every matching row of the tenant; returns the count.
    #[instrument(skip_all, fields(table = %self.table.name, tenant_id = field::Empty), err)]
    pub async fn update(&self, filter: Filter, patch: Patch) -> StoreResult<u64> {
        let tenant_id = self.require_tenant("update")?;
        let conditions = self.scope_conditions(filter)?;
        let assignments = self.resolve_patch(patch)?;
        if assignments.is_empty() {
            return Ok(0);
        }
        let updated = self
            .backend
            .update(&self.table, tenant_id, &conditions, &assignments)
            .await?;
        Ok(updated.len() as u64)
    }

    pub async fn update_by_id(&self, id: impl Into<Value>, patch: Patch) -> StoreResult<bool> {
        Ok(self.update(self.id_filter(id.into()), patch).await? > 0)
    }

    /// Hard delete.
    #[instrument(skip_all, fields(table = %self.table.name, tenant_id = field::Empty), err)]
    pub async fn delete(&self, filter: Filter) -> StoreResult<u64> {
        let tenant_id = self.require_tenant("delete")?;
        let conditions = self.scope_conditions(filter)?;
        self.backend.delete(&self.table, tenant_id, &conditions).await
    }

    fn soft_delete_field(&self) -> StoreResult<&str> {
        self.descriptor.soft_delete_field().ok_or_else(|| {
            StoreError::configuration(format!("{} has no soft-delete field", self.table.name))
        })
    }

    /// Stamp the soft-delete field on matching live rows.
    #[instrument(skip_all, fields(table = %self.table.name, tenant_id = field::Empty), err)]
    pub async fn soft_delete(&self, filter: Filter) -> StoreResult<u64> {
        self.require_tenant("soft_delete")?;
        let field = self.soft_delete_field()?;
        let filter = filter.is_null(field);
        self.update(filter, Patch::new().set(field, Utc::now())).await
    }

    /// Clear the soft-delete field on matching deleted rows.
    #[instrument(skip_all, fields(table = %self.table.name, tenant_id = field::Empty), err)]
    pub async fn restore(&self, filter: Filter) -> StoreResult<u64> {
        self.require_tenant("restore")?;
        let field = self.soft_delete_field()?;
        let filter = filter.is_not_null(field);
        self.update(filter, Patch::new().set(field, Value::Null)).await
    }

    /// Composable query pinned to the tenant active right now.
    pub fn scoped_query(&self) -> StoreResult<ScopedQuery<'_, R, B>> {
        let tenant_id = self.require_tenant("scoped_query")?;
        Ok(ScopedQuery::new(self, tenant_id))
    }

    /// Serialized value of one declared field of `record`.
    pub fn field_value(&self, record: &R, field: &str) -> StoreResult<Option<JsonValue>> {
        self.resolver.column(field)?;
        let mut map = Self::logical_map(record)?;
        Ok(map.remove(field).filter(|v| !v.is_null()))
    }

    /// The id of `record` as a bindable value (`Null` when unsaved).
    pub fn record_id(&self, record: &R) -> StoreResult<Value> {
        Ok(self
            .field_value(record, self.descriptor.id_field())?
            .map(Value::from_json)
            .unwrap_or(Value::Null))
    }
}

impl<R: Record> TenantScopedStore<R, PostgresBackend> {
    /// Raw SQL over this table, pre-filtered to the active tenant.
    ///
    /// Run it with [`ScopedSql::fetch_all`] on `self.backend().pool()` or on
    /// a caller-owned transaction.
    pub fn scoped_sql(&self, alias: &str) -> StoreResult<ScopedSql> {
        let tenant_id = self.require_tenant("scoped_sql")?;
        ScopedSql::new(&self.table, alias, tenant_id)
    }
}

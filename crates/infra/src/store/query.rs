//! Backend-agnostic query composition over a tenant-scoped store.

use tracing::{field, instrument};

use tenantgate_core::TenantId;

use crate::backend::RecordBackend;
use crate::error::StoreResult;
use crate::filter::{Direction, Filter, Op};
use crate::schema::Record;

use super::TenantScopedStore;

/// A query pre-filtered to the tenant that was active when it was created.
///
/// Conditions on the tenant field are dropped like everywhere else in the
/// store; soft-deleted rows stay hidden unless [`with_deleted`] is called.
///
/// [`with_deleted`]: ScopedQuery::with_deleted
#[derive(Debug)]
pub struct ScopedQuery<'a, R, B> {
    store: &'a TenantScopedStore<R, B>,
    tenant_id: TenantId,
    filter: Filter,
    order: Vec<(String, Direction)>,
    limit: Option<u64>,
    offset: Option<u64>,
    with_deleted: bool,
}

impl<'a, R, B> ScopedQuery<'a, R, B>
where
    R: Record,
    B: RecordBackend,
{
    pub(super) fn new(store: &'a TenantScopedStore<R, B>, tenant_id: TenantId) -> Self {
        Self {
            store,
            tenant_id,
            filter: Filter::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
            with_deleted: false,
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    /// AND every condition of `filter`.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = self.filter.and(filter);
        self
    }

    pub fn and_where(mut self, field: impl Into<String>, op: Op) -> Self {
        self.filter = self.filter.with(field, op);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order.push((field.into(), direction));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_deleted(mut self) -> Self {
        self.with_deleted = true;
        self
    }

    fn conditions(&self) -> StoreResult<Vec<crate::filter::ColumnCondition>> {
        if self.with_deleted {
            self.store.scope_conditions(self.filter.clone())
        } else {
            self.store.visible_conditions(self.filter.clone())
        }
    }

    #[instrument(
        skip_all,
        fields(table = %self.store.physical().name, tenant_id = %self.tenant_id, rows = field::Empty),
        err
    )]
    pub async fn fetch_all(&self) -> StoreResult<Vec<R>> {
        let conditions = self.conditions()?;
        let order = self.store.resolve_order(&self.order)?;
        let rows = self
            .store
            .select_visible(self.tenant_id, conditions, order, self.limit, self.offset)
            .await?;
        tracing::Span::current().record("rows", rows.len());
        Ok(rows)
    }

    pub async fn fetch_one(&self) -> StoreResult<Option<R>> {
        let conditions = self.conditions()?;
        let order = self.store.resolve_order(&self.order)?;
        let mut rows = self
            .store
            .select_visible(self.tenant_id, conditions, order, Some(1), self.offset)
            .await?;
        Ok(rows.pop())
    }

    /// Count matching rows; ordering, limit and offset are ignored.
    pub async fn count(&self) -> StoreResult<u64> {
        let conditions = self.conditions()?;
        self.store
            .backend()
            .count(self.store.physical(), self.tenant_id, &conditions)
            .await
    }
}

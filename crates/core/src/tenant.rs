//! Tenant context boundary.
//!
//! The data-access engine never decides which tenant it is acting for; it
//! asks a [`TenantContext`] once per operation. Absence is an explicit
//! `None`, never an empty or nil identifier.

use std::future::Future;
use std::sync::Arc;

use crate::id::TenantId;

tokio::task_local! {
    static CURRENT_TENANT: TenantId;
}

/// Supplies the tenant of the active logical unit of work.
///
/// Implementations must be cheap and synchronous: they are consulted at the
/// start of every store operation.
pub trait TenantContext: Send + Sync {
    fn current_tenant_id(&self) -> Option<TenantId>;
}

impl<T> TenantContext for Arc<T>
where
    T: TenantContext + ?Sized,
{
    fn current_tenant_id(&self) -> Option<TenantId> {
        (**self).current_tenant_id()
    }
}

impl<T> TenantContext for &T
where
    T: TenantContext + ?Sized,
{
    fn current_tenant_id(&self) -> Option<TenantId> {
        (**self).current_tenant_id()
    }
}

/// A context pinned to one tenant (a request, or a worker bound to a tenant).
///
/// This is immutable for its whole lifetime.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StaticTenant {
    tenant_id: TenantId,
}

impl StaticTenant {
    pub fn new(tenant_id: TenantId) -> Self {
        Self { tenant_id }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

impl TenantContext for StaticTenant {
    fn current_tenant_id(&self) -> Option<TenantId> {
        Some(self.tenant_id)
    }
}

/// Context backed by a tokio task-local slot.
///
/// The tenant is installed for the duration of a future with
/// [`TaskTenant::scope`]; code running outside any scope sees no tenant.
#[derive(Debug, Copy, Clone, Default)]
pub struct TaskTenant;

impl TaskTenant {
    /// Run `fut` with `tenant_id` as the current tenant.
    pub async fn scope<F>(tenant_id: TenantId, fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT_TENANT.scope(tenant_id, fut).await
    }

    /// The tenant installed for the current task, if any.
    pub fn current() -> Option<TenantId> {
        CURRENT_TENANT.try_with(|t| *t).ok()
    }
}

impl TenantContext for TaskTenant {
    fn current_tenant_id(&self) -> Option<TenantId> {
        Self::current()
    }
}

//! Record fixtures shared by unit and integration tests.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tenantgate_core::{StaticTenant, TaskTenant, TenantId};

use crate::backend::InMemoryBackend;
use crate::schema::{NamingConvention, Record, TableDescriptor};
use crate::store::TenantScopedStore;

/// Plain record with identity column naming and a soft-delete field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Note {
    pub id: Option<i64>,
    pub tenant_id: TenantId,
    pub title: String,
    pub slug: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Note {
    pub fn new(title: &str) -> Self {
        Self {
            id: None,
            tenant_id: TenantId::new(),
            title: title.to_string(),
            slug: None,
            deleted_at: None,
        }
    }

    pub fn with_slug(mut self, slug: &str) -> Self {
        self.slug = Some(slug.to_string());
        self
    }
}

impl Record for Note {
    fn descriptor() -> TableDescriptor {
        TableDescriptor::new("notes", ["id", "tenant_id", "title", "slug", "deleted_at"])
            .with_soft_delete("deleted_at")
            .with_unique(["tenant_id", "slug"])
    }
}

/// Queue row with camelCase fields stored in snake_case columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Job {
    pub id: Option<i64>,
    pub tenant_id: TenantId,
    pub kind: String,
    pub status: String,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub not_before: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
}

impl Job {
    pub fn pending(kind: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            tenant_id: TenantId::new(),
            kind: kind.to_string(),
            status: "PENDING".to_string(),
            attempts: 0,
            created_at,
            next_attempt_at: None,
            not_before: None,
            claimed_at: None,
            idempotency_key: None,
        }
    }

    pub fn keyed(mut self, key: &str) -> Self {
        self.idempotency_key = Some(key.to_string());
        self
    }
}

impl Record for Job {
    fn descriptor() -> TableDescriptor {
        TableDescriptor::new(
            "jobs",
            [
                "id",
                "tenantId",
                "kind",
                "status",
                "attempts",
                "createdAt",
                "nextAttemptAt",
                "notBefore",
                "claimedAt",
                "idempotencyKey",
            ],
        )
        .with_convention(NamingConvention::SnakeCase)
        .with_tenant_field("tenantId")
        .with_unique(["tenantId", "idempotencyKey"])
    }
}

pub(crate) type MemStore<R> = TenantScopedStore<R, Arc<InMemoryBackend>>;

pub(crate) fn notes_store(backend: Arc<InMemoryBackend>, tenant: TenantId) -> MemStore<Note> {
    TenantScopedStore::new(backend, StaticTenant::new(tenant)).unwrap()
}

/// A notes store reading the task-local tenant; outside
/// `TaskTenant::scope` it has none.
pub(crate) fn task_notes_store(backend: Arc<InMemoryBackend>) -> MemStore<Note> {
    TenantScopedStore::new(backend, TaskTenant).unwrap()
}

pub(crate) fn jobs_store(backend: Arc<InMemoryBackend>, tenant: TenantId) -> MemStore<Job> {
    TenantScopedStore::new(backend, StaticTenant::new(tenant)).unwrap()
}

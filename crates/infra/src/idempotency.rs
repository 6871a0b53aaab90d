//! Idempotent inserts keyed on a caller-supplied idempotency key.
//!
//! The table must carry a unique key over (tenant, key field). The writer
//! just attempts the insert and treats the backend's conflict signal as
//! "already done", so concurrent submissions of the same key collapse into
//! one row without any locking of its own.

use tracing::{debug, field, instrument};

use crate::backend::RecordBackend;
use crate::error::{StoreError, StoreResult};
use crate::filter::Filter;
use crate::schema::Record;
use crate::store::TenantScopedStore;
use crate::value::Value;

/// Whether a call created the row or found it already there.
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyOutcome<R> {
    Inserted(R),
    Existing(R),
}

impl<R> IdempotencyOutcome<R> {
    pub fn record(&self) -> &R {
        match self {
            IdempotencyOutcome::Inserted(r) | IdempotencyOutcome::Existing(r) => r,
        }
    }

    pub fn into_record(self) -> R {
        match self {
            IdempotencyOutcome::Inserted(r) | IdempotencyOutcome::Existing(r) => r,
        }
    }

    pub fn was_inserted(&self) -> bool {
        matches!(self, IdempotencyOutcome::Inserted(_))
    }
}

pub struct IdempotentWriter<R, B> {
    store: TenantScopedStore<R, B>,
    key_field: String,
}

impl<R, B> std::fmt::Debug for IdempotentWriter<R, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotentWriter")
            .field("store", &self.store)
            .field("key_field", &self.key_field)
            .finish()
    }
}

impl<R, B> IdempotentWriter<R, B>
where
    R: Record,
    B: RecordBackend,
{
    pub fn new(store: TenantScopedStore<R, B>, key_field: impl Into<String>) -> StoreResult<Self> {
        let key_field = key_field.into();
        store.resolver().column(&key_field)?;
        if key_field == store.descriptor().tenant_field() {
            return Err(StoreError::configuration(
                "the tenant field cannot be an idempotency key",
            ));
        }
        Ok(Self { store, key_field })
    }

    pub fn store(&self) -> &TenantScopedStore<R, B> {
        &self.store
    }

    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    /// Insert `record`, or return the tenant's row already holding its key.
    ///
    /// Without a key this is a plain `save`. A conflict whose row cannot be
    /// found again (deleted in between) retries the insert once; any error
    /// of that retry, conflict included, is returned as is.
    #[instrument(
        skip_all,
        fields(table = %self.store.physical().name, tenant_id = field::Empty, key_field = %self.key_field),
        err
    )]
    pub async fn save_with_idempotency(&self, record: &R) -> StoreResult<IdempotencyOutcome<R>> {
        self.store.require_tenant("save_with_idempotency")?;

        let Some(key) = self.store.field_value(record, &self.key_field)? else {
            return Ok(IdempotencyOutcome::Inserted(self.store.save(record).await?));
        };

        match self.store.insert(record).await {
            Ok(inserted) => Ok(IdempotencyOutcome::Inserted(inserted)),
            Err(StoreError::Conflict(reason)) => {
                debug!(%key, %reason, "idempotency key already used");
                if let Some(existing) = self.find_by_key(Value::from_json(key)).await? {
                    return Ok(IdempotencyOutcome::Existing(existing));
                }
                debug!("conflicting row vanished, retrying insert once");
                Ok(IdempotencyOutcome::Inserted(self.store.insert(record).await?))
            }
            Err(e) => Err(e),
        }
    }

    async fn find_by_key(&self, key: Value) -> StoreResult<Option<R>> {
        self.store
            .scoped_query()?
            .with_deleted()
            .filter(Filter::by(self.key_field.as_str(), key))
            .fetch_one()
            .await
    }
}

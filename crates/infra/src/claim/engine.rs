//! The claim / finalize protocol over a tenant-scoped store.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, field, instrument, warn};

use crate::backend::{ClaimStatement, RecordBackend};
use crate::error::{StoreError, StoreResult};
use crate::filter::{Filter, Patch};
use crate::schema::Record;
use crate::store::TenantScopedStore;
use crate::value::Value;

use super::backoff::{BackoffPolicy, ScheduledRetry};
use super::config::{BackoffColumns, ClaimConfig};

/// Rows moved from pending to in-progress by one claim, oldest first.
///
/// Owned by the caller until each row is finalized.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedBatch<R> {
    records: Vec<R>,
    claimed_at: DateTime<Utc>,
}

impl<R> ClaimedBatch<R> {
    pub fn records(&self) -> &[R] {
        &self.records
    }

    pub fn into_records(self) -> Vec<R> {
        self.records
    }

    /// Statement time used for due checks and `claimed_at` stamps.
    pub fn claimed_at(&self) -> DateTime<Utc> {
        self.claimed_at
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, R> {
        self.records.iter()
    }
}

impl<R> IntoIterator for ClaimedBatch<R> {
    type Item = R;
    type IntoIter = std::vec::IntoIter<R>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

/// Drains a status-driven queue table for the store's tenant.
///
/// Claims rely on the backend's skip-locked selection: concurrent engines
/// on the same table each get disjoint rows and never wait on each other.
/// Finalization is the caller's job; a claimed row that is never finalized
/// stays in progress until [`release_stale_claims`] resets it.
///
/// The engine never enforces an attempt cap.
///
/// [`release_stale_claims`]: ClaimEngine::release_stale_claims
pub struct ClaimEngine<R, B> {
    store: TenantScopedStore<R, B>,
    config: ClaimConfig,
    template: ClaimStatement,
    backoff: BackoffPolicy,
}

impl<R, B> std::fmt::Debug for ClaimEngine<R, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimEngine")
            .field("config", &self.config)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl<R, B> ClaimEngine<R, B>
where
    R: Record,
    B: RecordBackend,
{
    /// Validate `config` against the store's table.
    pub fn new(store: TenantScopedStore<R, B>, config: ClaimConfig) -> StoreResult<Self> {
        let template = config.resolve(store.descriptor(), store.resolver())?;
        Ok(Self {
            store,
            config,
            template,
            backoff: BackoffPolicy::default(),
        })
    }

    /// Policy used by [`mark_failure`](Self::mark_failure).
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn store(&self) -> &TenantScopedStore<R, B> {
        &self.store
    }

    pub fn config(&self) -> &ClaimConfig {
        &self.config
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// Atomically claim up to `limit` due pending rows, oldest first.
    #[instrument(
        skip(self),
        fields(table = %self.store.physical().name, tenant_id = field::Empty, claimed = field::Empty),
        err
    )]
    pub async fn claim_batch(&self, limit: u64) -> StoreResult<ClaimedBatch<R>> {
        let tenant_id = self.store.require_tenant("claim_batch")?;
        let now = Utc::now();
        if limit == 0 {
            return Ok(ClaimedBatch {
                records: vec![],
                claimed_at: now,
            });
        }

        let statement = ClaimStatement {
            limit,
            now,
            ..self.template.clone()
        };
        let rows = self
            .store
            .backend()
            .claim(self.store.physical(), tenant_id, &statement)
            .await?;
        let records = rows
            .into_iter()
            .map(|row| self.store.decode(row))
            .collect::<StoreResult<Vec<_>>>()?;

        tracing::Span::current().record("claimed", records.len());
        debug!(claimed = records.len(), "claimed batch");
        Ok(ClaimedBatch {
            records,
            claimed_at: now,
        })
    }

    /// Unconditional tenant-scoped status transition.
    pub async fn update_status_by_id(
        &self,
        id: impl Into<Value>,
        status: impl Into<Value>,
    ) -> StoreResult<bool> {
        self.store
            .update_by_id(id, Patch::new().set(self.config.status_field(), status))
            .await
    }

    /// Move a processed row to its terminal success status.
    pub async fn mark_success(&self, id: impl Into<Value>, status: impl Into<Value>) -> StoreResult<bool> {
        self.update_status_by_id(id, status).await
    }

    /// Record a failure and put the row back in the queue after a delay.
    ///
    /// Sets `attempts = attempts_so_far + 1`, `next_attempt_at = now +
    /// policy.delay_for(attempts_so_far)` and the status back to pending.
    /// Returns `None` when no row of the tenant has this id.
    #[instrument(
        skip(self, id, columns, policy),
        fields(table = %self.store.physical().name, tenant_id = field::Empty),
        err
    )]
    pub async fn mark_failure_with_backoff(
        &self,
        id: impl Into<Value>,
        columns: &BackoffColumns,
        attempts_so_far: u32,
        policy: &BackoffPolicy,
    ) -> StoreResult<Option<ScheduledRetry>> {
        self.store.require_tenant("mark_failure_with_backoff")?;
        let delay = policy.delay_for(attempts_so_far);
        let next_attempt_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| Utc::now().checked_add_signed(delay))
            .ok_or_else(|| StoreError::configuration(format!("backoff delay {delay:?} out of range")))?;
        let attempts = attempts_so_far.saturating_add(1);

        let mut patch = Patch::new()
            .set(columns.attempts.as_str(), attempts)
            .set(columns.next_attempt_at.as_str(), next_attempt_at)
            .set(columns.status.as_str(), columns.pending.clone());
        if let Some(claimed_at) = self.config.claimed_at_field() {
            patch = patch.set(claimed_at, Value::Null);
        }

        if !self.store.update_by_id(id, patch).await? {
            return Ok(None);
        }
        debug!(attempts, delay_secs = delay.as_secs(), "row rescheduled");
        Ok(Some(ScheduledRetry {
            attempts,
            delay,
            next_attempt_at,
        }))
    }

    /// [`mark_failure_with_backoff`](Self::mark_failure_with_backoff) with
    /// this engine's columns and policy.
    pub async fn mark_failure(
        &self,
        id: impl Into<Value>,
        attempts_so_far: u32,
    ) -> StoreResult<Option<ScheduledRetry>> {
        let columns = self.config.backoff_columns();
        self.mark_failure_with_backoff(id, &columns, attempts_so_far, &self.backoff)
            .await
    }

    /// Terminal failure: record the final attempt and a status no claim picks up.
    pub async fn mark_exhausted(
        &self,
        id: impl Into<Value>,
        status: impl Into<Value>,
        attempts_so_far: u32,
    ) -> StoreResult<bool> {
        let mut patch = Patch::new()
            .set(self.config.status_field(), status)
            .set(self.config.attempts_field(), attempts_so_far.saturating_add(1));
        if let Some(claimed_at) = self.config.claimed_at_field() {
            patch = patch.set(claimed_at, Value::Null);
        }
        self.store.update_by_id(id, patch).await
    }

    /// Reset in-progress rows claimed more than `older_than` ago to pending.
    ///
    /// Needs a claimed-at field; rows of crashed workers are otherwise stuck.
    #[instrument(
        skip(self),
        fields(table = %self.store.physical().name, tenant_id = field::Empty),
        err
    )]
    pub async fn release_stale_claims(&self, older_than: Duration) -> StoreResult<u64> {
        self.store.require_tenant("release_stale_claims")?;
        let claimed_at = self.config.claimed_at_field().ok_or_else(|| {
            StoreError::configuration(format!(
                "{} has no claimed-at field; stale claims cannot be detected",
                self.store.physical().name
            ))
        })?;
        let older_than = chrono::Duration::from_std(older_than)
            .map_err(|_| StoreError::configuration("stale-claim age out of range"))?;
        let cutoff = Utc::now() - older_than;

        let filter = Filter::new()
            .eq(self.config.status_field(), self.config.in_progress().clone())
            .lt(claimed_at, cutoff);
        let patch = Patch::new()
            .set(self.config.status_field(), self.config.pending().clone())
            .set(claimed_at, Value::Null);

        let released = self.store.update(filter, patch).await?;
        if released > 0 {
            warn!(released, %cutoff, "released stale claims");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::TimeZone;
    use tenantgate_core::TenantId;

    use crate::backend::InMemoryBackend;
    use crate::testing::{Job, MemStore, jobs_store};

    fn config() -> ClaimConfig {
        ClaimConfig::new("status", "PENDING", "IN_PROGRESS", "createdAt", "nextAttemptAt")
            .with_schedule("notBefore")
            .with_claimed_at("claimedAt")
    }

    fn engine(store: MemStore<Job>) -> ClaimEngine<Job, Arc<InMemoryBackend>> {
        ClaimEngine::new(store, config()).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn claims_oldest_first_and_flips_status() {
        let store = jobs_store(Arc::new(InMemoryBackend::new()), TenantId::new());
        store
            .save_all(&[Job::pending("c", at(2)), Job::pending("a", at(0)), Job::pending("b", at(1))])
            .await
            .unwrap();
        let engine = engine(store);

        let batch = engine.claim_batch(2).await.unwrap();
        assert_eq!(batch.iter().map(|j| j.kind.as_str()).collect::<Vec<_>>(), ["a", "b"]);
        assert!(batch.iter().all(|j| j.status == "IN_PROGRESS"));
        assert!(batch.iter().all(|j| j.claimed_at == Some(batch.claimed_at())));

        let second = engine.claim_batch(2).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second.records()[0].kind, "c");
        assert!(engine.claim_batch(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn future_rows_are_not_due() {
        let store = jobs_store(Arc::new(InMemoryBackend::new()), TenantId::new());
        let later = Utc::now() + chrono::Duration::hours(1);
        let mut retry_later = Job::pending("retry", at(0));
        retry_later.next_attempt_at = Some(later);
        let mut scheduled = Job::pending("scheduled", at(1));
        scheduled.not_before = Some(later);
        let mut due = Job::pending("due", at(2));
        due.next_attempt_at = Some(at(0));
        store.save_all(&[retry_later, scheduled, due]).await.unwrap();

        let batch = engine(store).claim_batch(10).await.unwrap();
        assert_eq!(batch.into_records().into_iter().map(|j| j.kind).collect::<Vec<_>>(), ["due"]);
    }

    #[tokio::test]
    async fn claims_stay_within_the_tenant() {
        let backend = Arc::new(InMemoryBackend::new());
        let mine = jobs_store(backend.clone(), TenantId::new());
        let theirs = jobs_store(backend, TenantId::new());
        theirs.save(&Job::pending("other", at(0))).await.unwrap();
        mine.save(&Job::pending("own", at(1))).await.unwrap();

        let batch = engine(mine).claim_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.records()[0].kind, "own");
        assert_eq!(theirs.find_one(Filter::new()).await.unwrap().unwrap().status, "PENDING");
    }

    #[tokio::test]
    async fn zero_limit_still_requires_a_tenant() {
        let engine = engine(jobs_store(Arc::new(InMemoryBackend::new()), TenantId::new()));
        assert!(engine.claim_batch(0).await.unwrap().is_empty());

        let unscoped: MemStore<Job> =
            TenantScopedStore::new(Arc::new(InMemoryBackend::new()), tenantgate_core::TaskTenant).unwrap();
        let err = ClaimEngine::new(unscoped, config()).unwrap().claim_batch(0).await.unwrap_err();
        assert_eq!(err, StoreError::missing_tenant("claim_batch"));
    }

    #[tokio::test]
    async fn failure_reschedules_with_backoff() {
        let store = jobs_store(Arc::new(InMemoryBackend::new()), TenantId::new());
        let saved = store.save(&Job::pending("flaky", at(0))).await.unwrap();
        let engine = engine(store);
        let id = saved.id.unwrap();
        engine.claim_batch(1).await.unwrap();

        let before = Utc::now();
        let retry = engine
            .mark_failure_with_backoff(id, &engine.config().backoff_columns(), 0, &BackoffPolicy::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retry.attempts, 1);
        assert_eq!(retry.delay, Duration::from_secs(5));
        assert!(retry.next_attempt_at >= before + chrono::Duration::seconds(5));

        let row = engine.store().find_by_id_or_fail(id).await.unwrap();
        assert_eq!(row.status, "PENDING");
        assert_eq!(row.attempts, 1);
        assert_eq!(row.next_attempt_at, Some(retry.next_attempt_at));
        assert_eq!(row.claimed_at, None);

        let capped = engine.mark_failure(id, 10).await.unwrap().unwrap();
        assert_eq!(capped.delay, Duration::from_secs(3600));
        assert_eq!(capped.attempts, 11);

        assert_eq!(engine.mark_failure(9_999, 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unrepresentable_retry_time_is_an_error() {
        let store = jobs_store(Arc::new(InMemoryBackend::new()), TenantId::new());
        let saved = store.save(&Job::pending("far", at(0))).await.unwrap();
        let engine = engine(store);
        let id = saved.id.unwrap();
        engine.claim_batch(1).await.unwrap();

        let policy = BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(10_000_000_000_000));
        let err = engine
            .mark_failure_with_backoff(id, &engine.config().backoff_columns(), 60, &policy)
            .await
            .unwrap_err();
        assert!(err.is_configuration());

        let row = engine.store().find_by_id_or_fail(id).await.unwrap();
        assert_eq!((row.status.as_str(), row.attempts), ("IN_PROGRESS", 0));
    }

    #[tokio::test]
    async fn success_and_exhaustion_are_terminal() {
        let store = jobs_store(Arc::new(InMemoryBackend::new()), TenantId::new());
        let saved = store
            .save_all(&[Job::pending("ok", at(0)), Job::pending("dead", at(1))])
            .await
            .unwrap();
        let engine = engine(store);
        engine.claim_batch(2).await.unwrap();

        assert!(engine.mark_success(saved[0].id.unwrap(), "DONE").await.unwrap());
        assert!(engine.mark_exhausted(saved[1].id.unwrap(), "FAILED", 4).await.unwrap());

        let dead = engine.store().find_by_id_or_fail(saved[1].id.unwrap()).await.unwrap();
        assert_eq!((dead.status.as_str(), dead.attempts), ("FAILED", 5));
        assert!(engine.claim_batch(10).await.unwrap().is_empty());
        assert!(!engine.update_status_by_id(12_345, "DONE").await.unwrap());
    }

    #[tokio::test]
    async fn stale_claims_return_to_pending() {
        let store = jobs_store(Arc::new(InMemoryBackend::new()), TenantId::new());
        store.save(&Job::pending("stuck", at(0))).await.unwrap();
        let engine = engine(store);
        engine.claim_batch(1).await.unwrap();

        assert_eq!(engine.release_stale_claims(Duration::from_secs(60)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(engine.release_stale_claims(Duration::ZERO).await.unwrap(), 1);

        let again = engine.claim_batch(1).await.unwrap();
        assert_eq!(again.records()[0].kind, "stuck");
    }

    #[tokio::test]
    async fn stale_release_needs_claimed_at() {
        let store = jobs_store(Arc::new(InMemoryBackend::new()), TenantId::new());
        let engine = ClaimEngine::new(
            store,
            ClaimConfig::new("status", "PENDING", "IN_PROGRESS", "createdAt", "nextAttemptAt"),
        )
        .unwrap();
        let err = engine.release_stale_claims(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)));
    }
}

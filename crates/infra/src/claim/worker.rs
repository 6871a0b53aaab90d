//! Queue-draining worker loop built on the claim engine.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::RecordBackend;
use crate::config::WorkerConfig;
use crate::error::{StoreError, StoreResult};
use crate::schema::Record;

use super::engine::ClaimEngine;

/// Processes one claimed record.
///
/// Any error schedules a retry (or a terminal failure once the worker's
/// attempt cap is reached); the error itself is only logged.
#[async_trait::async_trait]
pub trait ClaimHandler<R>: Send + Sync {
    async fn handle(&self, record: &R) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
impl<R, H> ClaimHandler<R> for Arc<H>
where
    R: Sync,
    H: ClaimHandler<R> + ?Sized,
{
    async fn handle(&self, record: &R) -> anyhow::Result<()> {
        (**self).handle(record).await
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct BatchReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub retried: usize,
    /// Rows moved to the terminal failed status.
    pub exhausted: usize,
    pub released: u64,
    /// Rows whose outcome could not be written back. They stay claimed
    /// until a stale-claim sweep returns them to the queue.
    pub errors: usize,
}

enum Finalized {
    Succeeded,
    Retried,
    Exhausted,
}

/// Running totals across cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub batches: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub exhausted: u64,
    pub released: u64,
    pub errors: u64,
}

impl WorkerStats {
    fn record(&mut self, report: &BatchReport) {
        self.batches += 1;
        self.processed += report.claimed as u64;
        self.succeeded += report.succeeded as u64;
        self.retried += report.retried as u64;
        self.exhausted += report.exhausted as u64;
        self.released += report.released;
        self.errors += report.errors as u64;
    }
}

/// Handle to control a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the current cycle to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "claim worker task failed");
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Claims batches for one table and tenant and runs a handler on each row.
pub struct ClaimWorker<R, B, H> {
    engine: Arc<ClaimEngine<R, B>>,
    handler: H,
    config: WorkerConfig,
}

impl<R, B, H> ClaimWorker<R, B, H>
where
    R: Record,
    B: RecordBackend + 'static,
    H: ClaimHandler<R> + 'static,
{
    pub fn new(engine: ClaimEngine<R, B>, handler: H, config: WorkerConfig) -> StoreResult<Self> {
        if config.stale_after.is_some() && engine.config().claimed_at_field().is_none() {
            return Err(StoreError::configuration(format!(
                "worker '{}' releases stale claims but its claim config has no claimed-at field",
                config.name
            )));
        }
        if config.success_status == *engine.config().in_progress()
            || config.success_status == *engine.config().pending()
        {
            return Err(StoreError::configuration(format!(
                "worker '{}' success status must differ from the queue statuses",
                config.name
            )));
        }
        Ok(Self {
            engine: Arc::new(engine),
            handler,
            config,
        })
    }

    pub fn engine(&self) -> &ClaimEngine<R, B> {
        &self.engine
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// One cycle: optional stale-claim sweep, one claim, every row handled
    /// and finalized.
    pub async fn run_once(&self) -> StoreResult<BatchReport> {
        let mut report = BatchReport::default();

        if let Some(age) = self.config.stale_after {
            report.released = self.engine.release_stale_claims(age).await?;
        }

        let batch = self.engine.claim_batch(self.config.batch_size).await?;
        report.claimed = batch.len();

        for record in batch {
            match self.finalize(&record).await {
                Ok(Finalized::Succeeded) => report.succeeded += 1,
                Ok(Finalized::Retried) => report.retried += 1,
                Ok(Finalized::Exhausted) => report.exhausted += 1,
                Err(e) => {
                    error!(
                        worker = %self.config.name,
                        error = %e,
                        "could not finalize claimed row, it stays claimed"
                    );
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    /// Run the handler on one claimed row and write back its outcome.
    async fn finalize(&self, record: &R) -> StoreResult<Finalized> {
        let store = self.engine.store();
        let id = store.record_id(record)?;
        let attempts = store
            .field_value(record, self.engine.config().attempts_field())?
            .and_then(|v| v.as_u64())
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
            .unwrap_or(0);

        match self.handler.handle(record).await {
            Ok(()) => {
                self.engine
                    .mark_success(id, self.config.success_status.clone())
                    .await?;
                Ok(Finalized::Succeeded)
            }
            Err(err) if self.is_exhausted(attempts) => {
                warn!(
                    worker = %self.config.name,
                    id = %id,
                    attempts = attempts + 1,
                    error = %err,
                    "row exhausted its attempts"
                );
                self.engine
                    .mark_exhausted(id, self.config.failed_status.clone(), attempts)
                    .await?;
                Ok(Finalized::Exhausted)
            }
            Err(err) => {
                let columns = self.engine.config().backoff_columns();
                let retry = self
                    .engine
                    .mark_failure_with_backoff(id.clone(), &columns, attempts, &self.config.backoff)
                    .await?;
                debug!(
                    worker = %self.config.name,
                    id = %id,
                    error = %err,
                    next_attempt_at = ?retry.map(|r| r.next_attempt_at),
                    "row failed, retry scheduled"
                );
                Ok(Finalized::Retried)
            }
        }
    }

    fn is_exhausted(&self, attempts_so_far: u32) -> bool {
        self.config
            .max_attempts
            .is_some_and(|max| attempts_so_far.saturating_add(1) >= max)
    }

    /// Run the poll loop on the tokio runtime until shut down.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let stats_clone = stats.clone();

        let join = tokio::spawn(self.run_loop(shutdown_rx, stats_clone));

        WorkerHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }

    async fn run_loop(self, mut shutdown: watch::Receiver<bool>, stats: Arc<Mutex<WorkerStats>>) {
        info!(worker = %self.config.name, batch_size = self.config.batch_size, "claim worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.run_once().await {
                Ok(report) => {
                    stats
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .record(&report);
                    report.claimed == 0
                }
                Err(e) => {
                    error!(worker = %self.config.name, error = %e, "claim cycle failed");
                    stats.lock().unwrap_or_else(PoisonError::into_inner).errors += 1;
                    true
                }
            };

            if idle {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        info!(worker = %self.config.name, "claim worker stopped");
    }
}

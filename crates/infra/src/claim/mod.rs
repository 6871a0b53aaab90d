//! Claim-batch queue protocol.
//!
//! A queue table holds rows moving through
//! `pending → in_progress → {success | pending again (with backoff) | failed}`.
//! [`ClaimEngine`] owns the transitions, [`ClaimWorker`] is the polling loop
//! that drives them with a [`ClaimHandler`].

pub mod backoff;
pub mod config;
pub mod engine;
pub mod worker;

pub use backoff::{BackoffPolicy, ScheduledRetry};
pub use config::{BackoffColumns, ClaimConfig};
pub use engine::{ClaimEngine, ClaimedBatch};
pub use worker::{BatchReport, ClaimHandler, ClaimWorker, WorkerHandle, WorkerStats};

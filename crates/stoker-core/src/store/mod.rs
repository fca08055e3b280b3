//! Job store port: transactional persistence with row-level locking.
//!
//! The relational store is the single source of truth and the only
//! synchronization point between worker processes; there is no in-memory job
//! queue. The worker demarcates transactions itself: one transaction to claim
//! a batch, and a fresh transaction per outcome.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Job, JobId};
use crate::error::StokerError;

/// Job totals by status, for operator inspection and tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub retryable: usize,
    pub dead: usize,
}

/// One open transaction against the job store.
///
/// The worker owns the transaction and must finish it with `commit` or
/// `rollback`; an implementation must release any row locks it took if the
/// transaction is dropped unfinished.
#[async_trait]
pub trait StoreTx: Send {
    /// Insert a new job record. Fails with [`StokerError::DuplicateJob`] if
    /// the id already exists.
    async fn enqueue(&mut self, job: &Job) -> Result<(), StokerError>;

    /// Select and lock up to `limit` due, claimable jobs, ordered by
    /// `scheduled_at` then `id`. Rows locked by a concurrent transaction are
    /// skipped, never waited on (SELECT ... FOR UPDATE SKIP LOCKED).
    async fn fetch_and_lock(&mut self, limit: usize) -> Result<Vec<Job>, StokerError>;

    /// Move a claimable job into `processing`, counting the attempt and
    /// stamping `started_at`.
    async fn mark_processing(&mut self, id: JobId) -> Result<(), StokerError>;

    /// Move a `processing` job into `completed`.
    async fn mark_completed(&mut self, id: JobId) -> Result<(), StokerError>;

    /// Move a `processing` job into `retryable`, recording the failure and
    /// the instant before which it must not be claimed again.
    async fn mark_retryable(
        &mut self,
        id: JobId,
        error: &str,
        next_scheduled_at: DateTime<Utc>,
    ) -> Result<(), StokerError>;

    /// Move a `processing` job into `dead`, recording the final failure.
    async fn mark_dead(&mut self, id: JobId, error: &str) -> Result<(), StokerError>;

    /// Apply all staged changes atomically and release the row locks.
    async fn commit(self: Box<Self>) -> Result<(), StokerError>;

    /// Discard staged changes and release the row locks.
    async fn rollback(self: Box<Self>) -> Result<(), StokerError>;
}

/// Job store port. Production backs this with a relational database; tests
/// and the demo binary use [`MemoryStore`].
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StokerError>;

    /// Enqueue a job in its own transaction. Fire-and-forget callers (API
    /// handlers, application code) use this; callers that already hold a
    /// transaction use [`StoreTx::enqueue`] instead.
    async fn enqueue(&self, job: &Job) -> Result<(), StokerError> {
        let mut tx = self.begin().await?;
        tx.enqueue(job).await?;
        tx.commit().await
    }
}

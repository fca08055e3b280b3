//! In-memory job store.
//!
//! Models the row-locking relational store the worker runs against in
//! production: `fetch_and_lock` skips rows held by another open transaction,
//! changes stay invisible until commit, and locks are released on commit,
//! rollback, or drop. Serves as the test double and the demo-binary store.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{JobCounts, JobStore, StoreTx};
use crate::domain::{Job, JobId, JobStatus};
use crate::error::StokerError;

#[derive(Default)]
struct State {
    /// Committed job rows.
    jobs: HashMap<JobId, Job>,

    /// Rows currently locked by an open transaction.
    locked: HashSet<JobId>,
}

fn lock_state(state: &Mutex<State>) -> Result<MutexGuard<'_, State>, StokerError> {
    state
        .lock()
        .map_err(|_| StokerError::Store("job store mutex poisoned".into()))
}

/// In-memory job store. Cheap to clone; clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed view of a single job.
    pub fn get(&self, id: JobId) -> Option<Job> {
        self.state.lock().ok()?.jobs.get(&id).cloned()
    }

    /// Committed job totals by status.
    pub fn counts(&self) -> JobCounts {
        let mut counts = JobCounts::default();
        let Ok(state) = self.state.lock() else {
            return counts;
        };
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Retryable => counts.retryable += 1,
                JobStatus::Dead => counts.dead += 1,
            }
        }
        counts
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StokerError> {
        Ok(Box::new(MemoryTx {
            state: Arc::clone(&self.state),
            locked: Vec::new(),
            staged: HashMap::new(),
            inserted: Vec::new(),
        }))
    }
}

/// One open transaction against a [`MemoryStore`].
///
/// Invariant: the shared mutex is only ever held within a single synchronous
/// block, never across an await.
struct MemoryTx {
    state: Arc<Mutex<State>>,

    /// Rows this transaction holds locks on.
    locked: Vec<JobId>,

    /// Local, uncommitted view of every row this transaction touched.
    staged: HashMap<JobId, Job>,

    /// Ids inserted by this transaction, re-checked for conflicts at commit.
    inserted: Vec<JobId>,
}

impl MemoryTx {
    /// Staged copy of a row, locking it first if this transaction does not
    /// hold it yet.
    fn row_mut(&mut self, id: JobId) -> Result<&mut Job, StokerError> {
        if !self.staged.contains_key(&id) {
            let mut guard = lock_state(&self.state)?;
            let state = &mut *guard;
            let job = state
                .jobs
                .get(&id)
                .ok_or(StokerError::JobNotFound(id))?
                .clone();
            if !state.locked.insert(id) {
                return Err(StokerError::Store(format!(
                    "job {id} is locked by another transaction"
                )));
            }
            self.locked.push(id);
            self.staged.insert(id, job);
        }
        self.staged.get_mut(&id).ok_or(StokerError::JobNotFound(id))
    }

    /// Staged row that must currently be `processing` to accept an outcome.
    fn processing_row(&mut self, id: JobId, to: JobStatus) -> Result<&mut Job, StokerError> {
        let job = self.row_mut(id)?;
        if job.status != JobStatus::Processing {
            return Err(StokerError::InvalidTransition {
                id,
                from: job.status,
                to,
            });
        }
        Ok(job)
    }

    fn release(&mut self) {
        if self.locked.is_empty() {
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            for id in self.locked.drain(..) {
                state.locked.remove(&id);
            }
        }
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn enqueue(&mut self, job: &Job) -> Result<(), StokerError> {
        if lock_state(&self.state)?.jobs.contains_key(&job.id)
            || self.staged.contains_key(&job.id)
        {
            return Err(StokerError::DuplicateJob(job.id));
        }
        self.staged.insert(job.id, job.clone());
        self.inserted.push(job.id);
        Ok(())
    }

    async fn fetch_and_lock(&mut self, limit: usize) -> Result<Vec<Job>, StokerError> {
        let now = Utc::now();
        let mut guard = lock_state(&self.state)?;
        let State { jobs, locked } = &mut *guard;

        let mut due: Vec<(DateTime<Utc>, JobId)> = jobs
            .values()
            .filter(|job| job.is_due(now) && !locked.contains(&job.id))
            .map(|job| (job.scheduled_at, job.id))
            .collect();
        // Earliest-scheduled first, ids (time-ordered) as the tiebreak.
        due.sort_unstable();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            let Some(job) = jobs.get(&id) else { continue };
            locked.insert(id);
            self.locked.push(id);
            self.staged.insert(id, job.clone());
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn mark_processing(&mut self, id: JobId) -> Result<(), StokerError> {
        let job = self.row_mut(id)?;
        if !job.status.is_claimable() {
            return Err(StokerError::InvalidTransition {
                id,
                from: job.status,
                to: JobStatus::Processing,
            });
        }
        job.begin_attempt();
        Ok(())
    }

    async fn mark_completed(&mut self, id: JobId) -> Result<(), StokerError> {
        self.processing_row(id, JobStatus::Completed)?.complete();
        Ok(())
    }

    async fn mark_retryable(
        &mut self,
        id: JobId,
        error: &str,
        next_scheduled_at: DateTime<Utc>,
    ) -> Result<(), StokerError> {
        self.processing_row(id, JobStatus::Retryable)?
            .schedule_retry(error, next_scheduled_at);
        Ok(())
    }

    async fn mark_dead(&mut self, id: JobId, error: &str) -> Result<(), StokerError> {
        self.processing_row(id, JobStatus::Dead)?.mark_dead(error);
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StokerError> {
        {
            let mut guard = lock_state(&self.state)?;
            // A concurrent transaction may have committed the same id since
            // our enqueue-time check.
            for id in &self.inserted {
                if guard.jobs.contains_key(id) {
                    return Err(StokerError::DuplicateJob(*id));
                }
            }
            for (id, job) in self.staged.drain() {
                guard.jobs.insert(id, job);
            }
            for id in self.locked.drain(..) {
                guard.locked.remove(&id);
            }
        }
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StokerError> {
        self.release();
        Ok(())
    }
}

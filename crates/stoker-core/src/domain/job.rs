//! Job record and status transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::JobId;

/// Applied when a job is created with `max_attempts` of zero.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Job status.
///
/// Transitions only move forward:
/// - Pending -> Processing -> Completed
/// - Pending -> Processing -> Retryable -> Processing (loop while attempts remain)
/// - Pending -> Processing -> Dead
///
/// `Retryable` is claimed exactly like `Pending` once its `scheduled_at` is
/// due. `Completed` and `Dead` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Retryable,
    Dead,
}

impl JobStatus {
    /// No further transitions out of this status.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Dead)
    }

    /// Eligible for claiming once `scheduled_at` is due.
    pub fn is_claimable(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Retryable)
    }
}

/// One unit of background work and its lifecycle state.
///
/// Design: this struct is the single source of truth for a job's fields, and
/// all status transitions go through its methods, never through direct field
/// assignment. The store applies the same methods to its own rows so the
/// worker's local copy and the persisted row cannot drift.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Immutable once assigned; time-ordered, used for stable claim ordering.
    pub id: JobId,

    /// Resolves the handler at execution time. Not validated at enqueue time:
    /// a missing handler surfaces as a `dead` job, not an enqueue error.
    pub job_type: String,

    /// Opaque bytes, decoded only by the matching handler.
    pub payload: Vec<u8>,

    pub status: JobStatus,

    /// Execution attempts so far, incremented when an attempt begins.
    pub attempts: u32,

    /// Ceiling on attempts before the job goes `dead`.
    pub max_attempts: u32,

    /// Most recent failure, if any.
    pub last_error: Option<String>,

    /// The job must not be claimed before this instant.
    pub scheduled_at: DateTime<Utc>,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a job due immediately. `max_attempts` of zero falls back to
    /// [`DEFAULT_MAX_ATTEMPTS`].
    pub fn new(job_type: impl Into<String>, payload: Vec<u8>, max_attempts: u32) -> Self {
        let now = Utc::now();
        let max_attempts = if max_attempts == 0 {
            DEFAULT_MAX_ATTEMPTS
        } else {
            max_attempts
        };
        Self {
            id: JobId::generate(),
            job_type: job_type.into(),
            payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            last_error: None,
            scheduled_at: now,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a job that must not run before `scheduled_at`.
    pub fn new_scheduled(
        job_type: impl Into<String>,
        payload: Vec<u8>,
        max_attempts: u32,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        let mut job = Self::new(job_type, payload, max_attempts);
        job.scheduled_at = scheduled_at;
        job
    }

    /// The sole gate deciding `retryable` vs `dead` on failure.
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Claimable right now: status allows it and `scheduled_at` has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.scheduled_at <= now
    }

    /// Move into `processing` and count the attempt. Attempts increment here,
    /// at claim time, so failure handling and backoff both see the post-claim
    /// count.
    pub fn begin_attempt(&mut self) {
        let now = Utc::now();
        self.status = JobStatus::Processing;
        self.attempts += 1;
        self.started_at = Some(now);
        self.updated_at = now;
    }

    /// Terminal success.
    pub fn complete(&mut self) {
        let now = Utc::now();
        self.status = JobStatus::Completed;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Failure with attempts remaining: record the error and push
    /// `scheduled_at` out to the next retry instant.
    pub fn schedule_retry(&mut self, error: impl Into<String>, next_scheduled_at: DateTime<Utc>) {
        self.status = JobStatus::Retryable;
        self.last_error = Some(error.into());
        self.scheduled_at = next_scheduled_at;
        self.updated_at = Utc::now();
    }

    /// Terminal failure: attempts exhausted, or no handler exists.
    pub fn mark_dead(&mut self, error: impl Into<String>) {
        let now = Utc::now();
        self.status = JobStatus::Dead;
        self.last_error = Some(error.into());
        self.completed_at = Some(now);
        self.updated_at = now;
    }
}

use thiserror::Error;

use crate::domain::{JobId, JobStatus};

#[derive(Debug, Error)]
pub enum StokerError {
    #[error("no handler registered for job type: {0}")]
    HandlerNotFound(String),

    #[error("job already exists: {0}")]
    DuplicateJob(JobId),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// The store rejected a status update that would move a job backwards.
    #[error("invalid status transition for job {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("store: {0}")]
    Store(String),

    #[error("{0}")]
    Other(String),
}

impl StokerError {
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

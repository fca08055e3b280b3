//! Domain model: job records, the status state machine, and identifiers.

pub mod ids;
pub mod job;

pub use ids::JobId;
pub use job::{DEFAULT_MAX_ATTEMPTS, Job, JobStatus};

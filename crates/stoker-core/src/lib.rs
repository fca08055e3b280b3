//! stoker-core
//!
//! Core building blocks for the Stoker background job runtime: jobs are
//! enqueued into a transactional store, polled in batches, claimed under
//! row-level locks, executed with bounded concurrency, and on failure either
//! rescheduled with exponential backoff or moved to `dead` after exhausting
//! their attempts.
//!
//! # Module layout
//! - **domain**: job record, status state machine, identifiers
//! - **registry**: job-type -> handler dispatch table
//! - **backoff**: retry delay policy
//! - **store**: job store port (transactions, row locking) + in-memory implementation
//! - **worker**: polling, claiming, dispatch, and outcome recording
//!
//! # Known operational gap
//! A worker crash between handler completion and the outcome transaction
//! leaves the job stuck in `processing`. There is no reaper or lease-expiry
//! mechanism that reclaims such rows; operators must requeue them by hand.

pub mod backoff;
pub mod domain;
pub mod error;
pub mod registry;
pub mod store;
pub mod worker;

pub use backoff::BackoffPolicy;
pub use domain::{Job, JobId, JobStatus};
pub use error::StokerError;
pub use registry::{HandlerRegistry, JobHandler};
pub use store::{JobCounts, JobStore, MemoryStore, StoreTx};
pub use worker::{Worker, WorkerConfig};

//! Handler registry: maps a job type to the code that executes it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::StokerError;

/// A handler for a specific job type.
///
/// The payload is handed over as raw bytes so the handler can decode it as it
/// likes (JSON, bincode, ...). `cancel` mirrors the worker's shutdown signal:
/// long-running handlers should observe it and abort cooperatively — the
/// worker never force-kills a handler, and two invocations of the same
/// handler may run concurrently with distinct payloads.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, payload: &[u8], cancel: &CancellationToken) -> Result<(), StokerError>;
}

/// Registry of handlers (job_type -> handler).
///
/// Design:
/// - Built during initialization (mutable).
/// - Used during runtime (immutable, behind an `Arc`).
/// This avoids locks on the hot path.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a job type. Last write wins: re-registering a
    /// type silently replaces the previous handler.
    pub fn register(&mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type.into(), handler);
    }

    /// Resolve the handler for a job type.
    ///
    /// A missing handler is a terminal condition for the job — retrying
    /// cannot make a registration appear — so the worker routes it to `dead`.
    pub fn get(&self, job_type: &str) -> Result<Arc<dyn JobHandler>, StokerError> {
        self.handlers
            .get(job_type)
            .cloned()
            .ok_or_else(|| StokerError::HandlerNotFound(job_type.to_string()))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

//! Runnable Stoker worker.
//!
//! Wires a `MemoryStore`, a handler registry with two sample handlers, and
//! the polling worker; enqueues a couple of demo jobs and runs until they
//! reach a terminal state or ctrl-c arrives, then drains and prints the
//! final store counts.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use stoker_core::{
    BackoffPolicy, HandlerRegistry, Job, JobHandler, JobId, JobStore, MemoryStore, StokerError,
    Worker, WorkerConfig,
};

#[derive(Debug, Deserialize)]
struct WelcomePayload {
    user_id: String,
    email: String,
    name: String,
}

/// Sample handler: pretends to send a welcome email.
struct SendWelcomeEmail;

#[async_trait]
impl JobHandler for SendWelcomeEmail {
    async fn handle(&self, payload: &[u8], _cancel: &CancellationToken) -> Result<(), StokerError> {
        let data: WelcomePayload = serde_json::from_slice(payload)
            .map_err(|e| StokerError::other(format!("json decode: {e}")))?;
        info!(
            user_id = %data.user_id,
            email = %data.email,
            name = %data.name,
            "sending welcome email (stub)"
        );
        Ok(())
    }
}

/// Sample handler that fails a configured number of times before succeeding,
/// to show the retry/backoff cycle in the logs.
struct FlakyPing {
    remaining_failures: AtomicU32,
}

impl FlakyPing {
    fn new(failures: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl JobHandler for FlakyPing {
    async fn handle(&self, _payload: &[u8], _cancel: &CancellationToken) -> Result<(), StokerError> {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(StokerError::other(format!(
                "intentional failure (left={left})"
            )));
        }
        info!("pong");
        Ok(())
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn worker_config_from_env() -> WorkerConfig {
    WorkerConfig {
        poll_interval: Duration::from_millis(env_u64("STOKER_POLL_INTERVAL_MS", 1_000)),
        batch_size: env_usize("STOKER_BATCH_SIZE", 10),
        max_concurrency: env_usize("STOKER_MAX_CONCURRENCY", 5),
        backoff: BackoffPolicy::new(
            Duration::from_millis(env_u64("STOKER_BACKOFF_BASE_MS", 1_000)),
            Duration::from_millis(env_u64("STOKER_BACKOFF_MAX_MS", 30_000)),
        ),
    }
}

async fn all_terminal(store: &MemoryStore, ids: &[JobId]) {
    loop {
        let done = ids
            .iter()
            .all(|id| store.get(*id).is_some_and(|job| job.status.is_terminal()));
        if done {
            return;
        }
        sleep(Duration::from_millis(200)).await;
    }
}

#[tokio::main]
async fn main() -> Result<(), StokerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = worker_config_from_env();
    let store = MemoryStore::new();

    let mut registry = HandlerRegistry::new();
    registry.register("send_welcome_email", Arc::new(SendWelcomeEmail));
    registry.register("flaky_ping", Arc::new(FlakyPing::new(2)));

    let welcome_payload = serde_json::to_vec(&serde_json::json!({
        "user_id": "01H0DEMO0USER",
        "email": "new.user@example.com",
        "name": "New User",
    }))
    .map_err(|e| StokerError::other(format!("json encode: {e}")))?;

    let welcome = Job::new("send_welcome_email", welcome_payload, 3);
    let flaky = Job::new("flaky_ping", b"{}".to_vec(), 5);
    store.enqueue(&welcome).await?;
    store.enqueue(&flaky).await?;
    info!(welcome_id = %welcome.id, flaky_id = %flaky.id, "enqueued demo jobs");

    let worker = Worker::new(Arc::new(store.clone()), Arc::new(registry), config);
    let shutdown = CancellationToken::new();
    let run = {
        let token = shutdown.clone();
        tokio::spawn(async move { worker.run(token).await })
    };

    let ids = [welcome.id, flaky.id];
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                error!(error = %err, "failed to listen for ctrl-c");
            }
            info!("received ctrl-c, shutting down");
        }
        _ = all_terminal(&store, &ids) => {
            info!("demo jobs finished, shutting down");
        }
    }

    shutdown.cancel();
    run.await
        .map_err(|e| StokerError::other(format!("worker task panicked: {e}")))??;

    for id in ids {
        if let Some(job) = store.get(id) {
            info!(
                job_id = %id,
                job_type = %job.job_type,
                status = ?job.status,
                attempts = job.attempts,
                last_error = job.last_error.as_deref().unwrap_or(""),
                "final job state"
            );
        }
    }
    info!(counts = ?store.counts(), "final counts");
    Ok(())
}

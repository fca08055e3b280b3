//! Polling worker: claims due jobs in batches and dispatches them to
//! handlers under a bounded concurrency ceiling.
//!
//! Control flow per tick: one transaction fetches-and-locks up to
//! `batch_size` due jobs and marks each `processing`; the commit releases the
//! row locks and makes the claims durable; each claimed job then executes on
//! its own task, gated by a semaphore shared across ticks, and writes its
//! outcome back in a fresh transaction. The store's row locks are the only
//! cross-process exclusion; the semaphore is the only in-process budget.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::domain::Job;
use crate::error::StokerError;
use crate::registry::HandlerRegistry;
use crate::store::JobStore;

/// Worker tuning knobs. Plain values; how they are loaded is the caller's
/// concern.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Time between poll ticks.
    pub poll_interval: Duration,

    /// Maximum jobs claimed per tick.
    pub batch_size: usize,

    /// Hard ceiling on concurrently executing jobs, shared across ticks: a
    /// slow previous batch throttles new dispatch.
    pub max_concurrency: usize,

    pub backoff: BackoffPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            max_concurrency: 5,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// What `process_job` decided; applied in its own transaction.
enum Outcome {
    Completed,
    Retry {
        error: String,
        next_scheduled_at: DateTime<Utc>,
    },
    Dead {
        error: String,
    },
}

/// Drives the job lifecycle end-to-end: poll, claim, dispatch, record.
#[derive(Clone)]
pub struct Worker {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    semaphore: Arc<Semaphore>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        config: WorkerConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency));
        Self {
            store,
            registry,
            config,
            semaphore,
        }
    }

    /// Run until `shutdown` is cancelled, then drain: no new polls start, but
    /// every job already dispatched runs to completion and has its outcome
    /// committed before this returns. No deadline is imposed here; an
    /// enclosing caller may wrap this in a timeout.
    ///
    /// No error from an individual job or tick ever terminates the loop.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), StokerError> {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            max_concurrency = self.config.max_concurrency,
            "worker started"
        );

        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.poll(&shutdown, &mut in_flight).await,
            }
            // Reap finished executions so the set does not grow without bound.
            while in_flight.try_join_next().is_some() {}
        }

        info!("worker shutting down, waiting for in-flight jobs");
        while in_flight.join_next().await.is_some() {}
        info!("worker stopped");
        Ok(())
    }

    /// One tick: claim a batch, then dispatch each claimed job onto its own
    /// task. Returns once dispatch is issued; execution completes later.
    async fn poll(&self, shutdown: &CancellationToken, in_flight: &mut JoinSet<()>) {
        let claimed = match self.claim_batch().await {
            Ok(jobs) => jobs,
            Err(err) => {
                // Expected when the store unwinds during shutdown.
                if shutdown.is_cancelled() {
                    return;
                }
                warn!(error = %err, "failed to poll jobs");
                return;
            }
        };

        for job in claimed {
            let worker = self.clone();
            let cancel = shutdown.clone();
            // The permit is acquired inside the task: a full pool delays
            // execution but never stalls the poll loop.
            in_flight.spawn(async move {
                let Ok(_permit) = worker.semaphore.clone().acquire_owned().await else {
                    return;
                };
                worker.process_job(&cancel, job).await;
            });
        }
    }

    /// One transaction: fetch-and-lock up to `batch_size` due jobs and mark
    /// each `processing`. A job that fails to mark is logged and skipped;
    /// the rest of the batch goes through.
    async fn claim_batch(&self) -> Result<Vec<Job>, StokerError> {
        let mut tx = self.store.begin().await?;
        let due = tx.fetch_and_lock(self.config.batch_size).await?;

        let mut claimed = Vec::with_capacity(due.len());
        for mut job in due {
            match tx.mark_processing(job.id).await {
                Ok(()) => {
                    // Mirror the stored transition so attempts and status on
                    // the local copy match the row we just updated.
                    job.begin_attempt();
                    claimed.push(job);
                }
                Err(err) => {
                    warn!(job_id = %job.id, error = %err, "failed to mark job processing");
                }
            }
        }

        tx.commit().await?;
        Ok(claimed)
    }

    /// Execute one claimed job and record exactly one outcome transition.
    /// Handler errors are captured into the job, never propagated.
    async fn process_job(&self, cancel: &CancellationToken, job: Job) {
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            "processing job"
        );
        let started = Instant::now();

        let handler = match self.registry.get(&job.job_type) {
            Ok(handler) => handler,
            Err(err) => {
                // Retrying cannot make a registration appear: straight to dead.
                error!(job_id = %job.id, job_type = %job.job_type, "no handler for job type");
                self.record_outcome(
                    &job,
                    Outcome::Dead {
                        error: err.to_string(),
                    },
                )
                .await;
                return;
            }
        };

        match handler.handle(&job.payload, cancel).await {
            Ok(()) => {
                info!(
                    job_id = %job.id,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "job completed"
                );
                self.record_outcome(&job, Outcome::Completed).await;
            }
            Err(err) => {
                error!(
                    job_id = %job.id,
                    error = %err,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "job failed"
                );
                let outcome = if job.can_retry() {
                    let delay = self.config.backoff.delay(job.attempts);
                    let next_scheduled_at =
                        Utc::now() + TimeDelta::milliseconds(delay.as_millis() as i64);
                    info!(
                        job_id = %job.id,
                        backoff_ms = delay.as_millis() as u64,
                        "scheduling retry"
                    );
                    Outcome::Retry {
                        error: err.to_string(),
                        next_scheduled_at,
                    }
                } else {
                    error!(
                        job_id = %job.id,
                        attempts = job.attempts,
                        "job moved to dead letter (max attempts reached)"
                    );
                    Outcome::Dead {
                        error: err.to_string(),
                    }
                };
                self.record_outcome(&job, outcome).await;
            }
        }
    }

    /// Apply one outcome transition in a fresh transaction. A failure here
    /// strands the job in `processing` (see crate docs); all we can do is log.
    async fn record_outcome(&self, job: &Job, outcome: Outcome) {
        let result: Result<(), StokerError> = async {
            let mut tx = self.store.begin().await?;
            match &outcome {
                Outcome::Completed => tx.mark_completed(job.id).await?,
                Outcome::Retry {
                    error,
                    next_scheduled_at,
                } => {
                    tx.mark_retryable(job.id, error, *next_scheduled_at)
                        .await?;
                }
                Outcome::Dead { error } => tx.mark_dead(job.id, error).await?,
            }
            tx.commit().await
        }
        .await;

        if let Err(err) = result {
            error!(job_id = %job.id, error = %err, "failed to record job outcome");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use tokio::task::JoinHandle;
    use tokio::time::{sleep, timeout};

    use super::*;
    use crate::domain::JobStatus;
    use crate::registry::JobHandler;
    use crate::store::MemoryStore;

    struct OkHandler;

    #[async_trait]
    impl JobHandler for OkHandler {
        async fn handle(
            &self,
            _payload: &[u8],
            _cancel: &CancellationToken,
        ) -> Result<(), StokerError> {
            Ok(())
        }
    }

    struct FailHandler;

    #[async_trait]
    impl JobHandler for FailHandler {
        async fn handle(
            &self,
            _payload: &[u8],
            _cancel: &CancellationToken,
        ) -> Result<(), StokerError> {
            Err(StokerError::other("boom"))
        }
    }

    /// Fails the first `remaining` invocations, then succeeds.
    struct FlakyHandler {
        remaining: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        async fn handle(
            &self,
            _payload: &[u8],
            _cancel: &CancellationToken,
        ) -> Result<(), StokerError> {
            let left = self.remaining.load(Ordering::Relaxed);
            if left > 0 {
                self.remaining.fetch_sub(1, Ordering::Relaxed);
                return Err(StokerError::other(format!("flaky failure (left={left})")));
            }
            Ok(())
        }
    }

    struct SlowHandler {
        delay: Duration,
    }

    #[async_trait]
    impl JobHandler for SlowHandler {
        async fn handle(
            &self,
            _payload: &[u8],
            _cancel: &CancellationToken,
        ) -> Result<(), StokerError> {
            sleep(self.delay).await;
            Ok(())
        }
    }

    /// Tracks the highest number of concurrently running invocations.
    struct GaugeHandler {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for GaugeHandler {
        async fn handle(
            &self,
            _payload: &[u8],
            _cancel: &CancellationToken,
        ) -> Result<(), StokerError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            sleep(Duration::from_millis(40)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_config() -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_millis(10),
            batch_size: 10,
            max_concurrency: 5,
            backoff: BackoffPolicy::new(Duration::from_millis(20), Duration::from_millis(100)),
        }
    }

    fn start_worker(
        store: &MemoryStore,
        registry: HandlerRegistry,
        config: WorkerConfig,
    ) -> (CancellationToken, JoinHandle<Result<(), StokerError>>) {
        let worker = Worker::new(
            Arc::new(store.clone()),
            Arc::new(registry),
            config,
        );
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { worker.run(token).await });
        (shutdown, handle)
    }

    async fn wait_for_status(store: &MemoryStore, id: crate::domain::JobId, status: JobStatus) {
        timeout(Duration::from_secs(3), async {
            loop {
                if store.get(id).map(|j| j.status) == Some(status) {
                    return;
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "job never reached {status:?}, currently {:?}",
                store.get(id).map(|j| j.status)
            )
        });
    }

    #[tokio::test]
    async fn successful_job_runs_to_completed() {
        let store = MemoryStore::new();
        let mut registry = HandlerRegistry::new();
        registry.register("ok", Arc::new(OkHandler));

        let job = Job::new("ok", b"{}".to_vec(), 3);
        store.enqueue(&job).await.unwrap();

        let (shutdown, handle) = start_worker(&store, registry, test_config());
        wait_for_status(&store, job.id, JobStatus::Completed).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        let done = store.get(job.id).unwrap();
        assert_eq!(done.attempts, 1);
        assert!(done.completed_at.is_some());
        assert!(done.started_at.is_some());
        assert!(done.last_error.is_none());
    }

    #[tokio::test]
    async fn failing_job_retries_then_dies_at_max_attempts() {
        let store = MemoryStore::new();
        let mut registry = HandlerRegistry::new();
        registry.register("doomed", Arc::new(FailHandler));

        let job = Job::new("doomed", Vec::new(), 2);
        store.enqueue(&job).await.unwrap();

        let (shutdown, handle) = start_worker(&store, registry, test_config());
        wait_for_status(&store, job.id, JobStatus::Dead).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        let dead = store.get(job.id).unwrap();
        // Attempt 1 failed retryably, attempt 2 exhausted the budget.
        assert_eq!(dead.attempts, 2);
        assert_eq!(dead.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn flaky_job_recovers_on_a_later_attempt() {
        let store = MemoryStore::new();
        let mut registry = HandlerRegistry::new();
        registry.register(
            "flaky",
            Arc::new(FlakyHandler {
                remaining: AtomicU32::new(1),
            }),
        );

        let job = Job::new("flaky", Vec::new(), 3);
        store.enqueue(&job).await.unwrap();

        let (shutdown, handle) = start_worker(&store, registry, test_config());
        wait_for_status(&store, job.id, JobStatus::Completed).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        let done = store.get(job.id).unwrap();
        assert_eq!(done.attempts, 2);
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn unregistered_job_type_goes_straight_to_dead() {
        let store = MemoryStore::new();
        let registry = HandlerRegistry::new();

        // A generous max_attempts must not matter: missing handlers never retry.
        let job = Job::new("nobody_home", Vec::new(), 10);
        store.enqueue(&job).await.unwrap();

        let (shutdown, handle) = start_worker(&store, registry, test_config());
        wait_for_status(&store, job.id, JobStatus::Dead).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        let dead = store.get(job.id).unwrap();
        assert_eq!(dead.attempts, 1);
        assert!(
            dead.last_error
                .as_deref()
                .is_some_and(|e| e.contains("no handler"))
        );
    }

    #[tokio::test]
    async fn claims_every_due_job_but_leaves_future_ones_alone() {
        let store = MemoryStore::new();
        let mut registry = HandlerRegistry::new();
        registry.register("ok", Arc::new(OkHandler));

        let mut due = Vec::new();
        for _ in 0..3 {
            let job = Job::new("ok", Vec::new(), 3);
            store.enqueue(&job).await.unwrap();
            due.push(job.id);
        }
        let later = Job::new_scheduled(
            "ok",
            Vec::new(),
            3,
            Utc::now() + ChronoDuration::minutes(10),
        );
        store.enqueue(&later).await.unwrap();

        let (shutdown, handle) = start_worker(&store, registry, test_config());
        for id in due {
            wait_for_status(&store, id, JobStatus::Completed).await;
        }
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(store.get(later.id).unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_the_ceiling() {
        let store = MemoryStore::new();
        let gauge = Arc::new(GaugeHandler {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let mut registry = HandlerRegistry::new();
        registry.register("gauge", Arc::clone(&gauge) as Arc<dyn JobHandler>);

        let mut ids = Vec::new();
        for _ in 0..6 {
            let job = Job::new("gauge", Vec::new(), 3);
            store.enqueue(&job).await.unwrap();
            ids.push(job.id);
        }

        let config = WorkerConfig {
            max_concurrency: 2,
            ..test_config()
        };
        let (shutdown, handle) = start_worker(&store, registry, config);
        for id in ids {
            wait_for_status(&store, id, JobStatus::Completed).await;
        }
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn shutdown_drains_in_flight_jobs_and_commits_their_outcomes() {
        let store = MemoryStore::new();
        let mut registry = HandlerRegistry::new();
        registry.register(
            "slow",
            Arc::new(SlowHandler {
                delay: Duration::from_millis(150),
            }),
        );

        let job = Job::new("slow", Vec::new(), 3);
        store.enqueue(&job).await.unwrap();

        let (shutdown, handle) = start_worker(&store, registry, test_config());
        wait_for_status(&store, job.id, JobStatus::Processing).await;

        // Cancel mid-execution: run() must not return until the outcome is in.
        shutdown.cancel();
        timeout(Duration::from_secs(3), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(store.get(job.id).unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn no_new_jobs_are_claimed_after_shutdown() {
        let store = MemoryStore::new();
        let mut registry = HandlerRegistry::new();
        registry.register("ok", Arc::new(OkHandler));

        let (shutdown, handle) = start_worker(&store, registry, test_config());
        sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        let job = Job::new("ok", Vec::new(), 3);
        store.enqueue(&job).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get(job.id).unwrap().status, JobStatus::Pending);
    }
}

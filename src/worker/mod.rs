pub mod limiter;

pub use limiter::RateLimiter;

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    backend::QueueBackend, observability::RelayMetrics, ClaimedJob, FailOutcome, JobId,
    JobProcessor, RelayError, RelayResult,
};

/// Rate limit: at most `max` job starts within any rolling `duration` window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimit {
    pub max: usize,
    pub duration: Duration,
}

/// Configuration for the relay worker
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Maximum number of jobs in flight simultaneously
    pub concurrency: usize,

    /// Admission rate limit, independent of the concurrency cap
    pub limiter: Option<RateLimit>,

    /// How long to sleep when the queue has nothing eligible
    pub poll_interval: Duration,

    /// How long in-flight jobs get to finish after shutdown is requested
    pub shutdown_grace: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            limiter: Some(RateLimit {
                max: 10,
                duration: Duration::from_millis(1000),
            }),
            poll_interval: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Handle for managing worker lifecycle
pub struct WorkerHandle {
    cancel: CancellationToken,
    join: tokio::task::JoinHandle<RelayResult<()>>,
    metrics: Arc<RelayMetrics>,
    in_flight: Arc<DashMap<JobId, Instant>>,
}

impl WorkerHandle {
    /// Gracefully shut down: stop claiming, drain in-flight jobs up to the
    /// grace period, then return
    pub async fn shutdown(self) -> RelayResult<()> {
        self.cancel.cancel();
        self.join
            .await
            .map_err(|e| RelayError::Internal(format!("Worker join error: {e}")))?
    }

    /// Live counters for this worker
    pub fn metrics(&self) -> Arc<RelayMetrics> {
        self.metrics.clone()
    }

    /// Number of jobs currently in flight
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

/// The relay worker: continuously claims jobs from the durable queue and
/// drives each one through the processor to an ack.
///
/// Admission is gated twice - a semaphore bounds how many jobs are in flight
/// (resource usage on this side) and a rolling-window limiter bounds how
/// fast new jobs start (load imposed downstream). All retry state lives in
/// the queue; the worker is stateless between jobs.
pub struct RelayWorker {
    queue: String,
    backend: Arc<dyn QueueBackend>,
    processor: Arc<dyn JobProcessor>,
    options: WorkerOptions,
    metrics: Arc<RelayMetrics>,
}

impl RelayWorker {
    /// Create a worker for `queue` with default options
    pub fn new(
        queue: impl Into<String>,
        backend: Arc<dyn QueueBackend>,
        processor: Arc<dyn JobProcessor>,
    ) -> Self {
        Self {
            queue: queue.into(),
            backend,
            processor,
            options: WorkerOptions::default(),
            metrics: Arc::new(RelayMetrics::new()),
        }
    }

    /// Create worker with custom options
    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    /// Live counters for this worker
    pub fn metrics(&self) -> Arc<RelayMetrics> {
        self.metrics.clone()
    }

    /// Spawn the claim loop and return a handle for shutdown
    pub fn start(self) -> WorkerHandle {
        let cancel = CancellationToken::new();
        let metrics = self.metrics.clone();
        let in_flight: Arc<DashMap<JobId, Instant>> = Arc::new(DashMap::new());

        let child_cancel = cancel.clone();
        let child_in_flight = in_flight.clone();
        let join = tokio::spawn(self.run(child_cancel, child_in_flight));

        WorkerHandle {
            cancel,
            join,
            metrics,
            in_flight,
        }
    }

    async fn run(
        self,
        cancel: CancellationToken,
        in_flight: Arc<DashMap<JobId, Instant>>,
    ) -> RelayResult<()> {
        let semaphore = Arc::new(Semaphore::new(self.options.concurrency));
        let limiter = self
            .options
            .limiter
            .as_ref()
            .map(|l| Arc::new(RateLimiter::new(l.max, l.duration)));
        let mut handlers = JoinSet::new();

        info!(
            queue = %self.queue,
            concurrency = self.options.concurrency,
            rate_limit = ?self.options.limiter,
            "worker ready; claiming jobs"
        );

        loop {
            // Reap finished handlers; a panic in one must not take the loop down
            while let Some(result) = handlers.try_join_next() {
                if let Err(e) = result {
                    error!(error = %e, "job handler panicked");
                }
            }

            // Concurrency gate: one permit per in-flight job
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // Rate gate: reserve a start slot in the rolling window
            if let Some(limiter) = &limiter {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = limiter.reserve() => {}
                }
            }

            match self.backend.claim(&self.queue).await {
                Ok(Some(job)) => {
                    self.metrics.record_claimed();

                    let queue = self.queue.clone();
                    let backend = self.backend.clone();
                    let processor = self.processor.clone();
                    let metrics = self.metrics.clone();
                    let in_flight = in_flight.clone();

                    handlers.spawn(async move {
                        let _permit = permit;
                        handle_job(&queue, backend, processor, metrics, in_flight, job).await;
                    });
                }
                Ok(None) => {
                    // No job started; the rate slot goes back to the window
                    if let Some(limiter) = &limiter {
                        limiter.cancel_reservation();
                    }
                    drop(permit);

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = sleep(self.options.poll_interval) => {}
                    }
                }
                Err(e) => {
                    if let Some(limiter) = &limiter {
                        limiter.cancel_reservation();
                    }
                    drop(permit);
                    error!(error = %e, queue = %self.queue, "failed to claim from queue");

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        info!(
            in_flight = handlers.len(),
            "shutdown initiated; no new claims, draining in-flight jobs"
        );

        let drained = tokio::time::timeout(self.options.shutdown_grace, async {
            while handlers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = handlers.len(),
                "shutdown grace elapsed; abandoned jobs will be reclaimed at claim expiry"
            );
            handlers.abort_all();
            while handlers.join_next().await.is_some() {}
        }

        let snapshot = self.metrics.snapshot();
        info!(
            completed = snapshot.completed,
            retried = snapshot.retried,
            failed = snapshot.failed_terminal,
            "shutdown complete"
        );

        Ok(())
    }
}

/// Drive one claimed job to an ack. Never returns an error: every outcome is
/// reported to the queue, and ack failures (claim expired under us) only log
/// - the queue will redeliver.
async fn handle_job(
    queue: &str,
    backend: Arc<dyn QueueBackend>,
    processor: Arc<dyn JobProcessor>,
    metrics: Arc<RelayMetrics>,
    in_flight: Arc<DashMap<JobId, Instant>>,
    job: ClaimedJob,
) {
    let job_id = job.job_id().clone();
    let attempt = job.attempt();
    let started = Instant::now();
    in_flight.insert(job_id.clone(), started);

    info!(
        %job_id,
        attempt,
        session_id = %job.envelope().session_id,
        message_id = %job.envelope().message_id,
        "job started"
    );

    match processor.process(job.envelope()).await {
        Ok(_body) => {
            match backend
                .ack_complete(queue, job_id.clone(), job.token)
                .await
            {
                Ok(()) => {
                    metrics.record_completed();
                    info!(
                        %job_id,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "job completed"
                    );
                }
                Err(e) => {
                    warn!(%job_id, error = %e, "completion not recorded; job may be delivered again");
                }
            }
        }
        Err(process_error) => {
            let detail = process_error.to_string();
            match backend
                .ack_fail(queue, job_id.clone(), job.token, detail.clone())
                .await
            {
                Ok(FailOutcome::Retrying { retry_at }) => {
                    metrics.record_retried();
                    warn!(%job_id, attempt, error = %detail, %retry_at, "job failed; retry scheduled");
                }
                Ok(FailOutcome::Terminal) => {
                    metrics.record_failed_terminal();
                    error!(%job_id, attempt, error = %detail, "job failed terminally; attempts exhausted");
                }
                Err(e) => {
                    warn!(%job_id, error = %e, "failure not recorded; job may be delivered again");
                }
            }
        }
    }

    in_flight.remove(&job_id);
}

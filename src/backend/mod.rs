#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use futures_core::Stream;
use std::pin::Pin;

use crate::{
    ClaimToken, ClaimedJob, EnqueueOptions, FailOutcome, JobEvent, JobId, JobRecord, JobStatus,
    RelayResult, TaskEnvelope,
};

/// Type alias for boxed streams (stable Rust compatible)
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// Durable queue contract.
///
/// All retry bookkeeping lives behind this trait: attempt counters, backoff
/// scheduling, and retention/GC are queue capabilities. Workers stay
/// stateless between jobs - they claim, process, and report.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Enqueue an envelope with per-job retry/retention options.
    /// Returns the queue-assigned job ID.
    async fn enqueue(
        &self,
        queue: &str,
        envelope: TaskEnvelope,
        options: EnqueueOptions,
    ) -> RelayResult<JobId>;

    /// Atomically claim the next eligible job (enqueued, or retrying with an
    /// elapsed backoff delay). The claim is exclusive until its deadline;
    /// the attempt counter is charged as part of the claim.
    async fn claim(&self, queue: &str) -> RelayResult<Option<ClaimedJob>>;

    /// Report successful completion (claim token required).
    /// Exactly one completion is recorded; the job will not be retried.
    async fn ack_complete(&self, queue: &str, job_id: JobId, token: ClaimToken)
        -> RelayResult<()>;

    /// Report a failed attempt (claim token required). The queue consults the
    /// stored attempt counter and backoff policy: either the job is
    /// re-enqueued with a strictly increasing delay, or - once the attempt
    /// budget is exhausted - marked failed-terminal and retained.
    async fn ack_fail(
        &self,
        queue: &str,
        job_id: JobId,
        token: ClaimToken,
        error: String,
    ) -> RelayResult<FailOutcome>;

    /// Get job status
    async fn get_status(&self, queue: &str, job_id: JobId) -> RelayResult<JobStatus>;

    /// Get full job record (for observability/inspection)
    async fn get_record(&self, queue: &str, job_id: JobId) -> RelayResult<JobRecord>;

    /// Event stream for observability (boxed for stable Rust)
    fn event_stream(&self) -> BoxStream<JobEvent>;
}

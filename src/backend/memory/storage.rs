use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::{
    backend::{BoxStream, QueueBackend},
    ClaimToken, ClaimedJob, EnqueueOptions, FailOutcome, JobEvent, JobId, JobRecord, JobStatus,
    RelayError, RelayResult, TaskEnvelope,
};

/// Finished-job bookkeeping per queue, ordered oldest-first for trimming
#[derive(Default)]
pub(crate) struct FinishedJobs {
    pub(crate) completed: VecDeque<(DateTime<Utc>, JobId)>,
    pub(crate) failed: VecDeque<(DateTime<Utc>, JobId)>,
}

/// In-memory backend for testing and development.
///
/// Implements the full claim/retry/retention state machine against process
/// memory; semantics match the Redis backend so worker behavior can be
/// exercised without a running store.
pub struct MemoryBackend {
    claim_timeout: Duration,

    /// Job records indexed by job_id
    pub(crate) jobs: Arc<RwLock<HashMap<JobId, JobRecord>>>,

    /// Wait lists: queue name -> job ids (FIFO)
    pub(crate) queues: Arc<RwLock<HashMap<String, VecDeque<JobId>>>>,

    /// Terminal jobs awaiting garbage collection, per queue
    pub(crate) finished: Arc<RwLock<HashMap<String, FinishedJobs>>>,

    /// Event broadcaster for observability
    pub(crate) event_broadcaster: broadcast::Sender<JobEvent>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (event_broadcaster, _) = broadcast::channel(1024);

        Self {
            claim_timeout: Duration::from_secs(300),
            jobs: Arc::new(RwLock::new(HashMap::new())),
            queues: Arc::new(RwLock::new(HashMap::new())),
            finished: Arc::new(RwLock::new(HashMap::new())),
            event_broadcaster,
        }
    }

    /// Override the claim deadline (default 5 minutes)
    pub fn with_claim_timeout(mut self, claim_timeout: Duration) -> Self {
        self.claim_timeout = claim_timeout;
        self
    }

    fn emit(&self, event: JobEvent) {
        let _ = self.event_broadcaster.send(event);
    }

    /// Trim terminal jobs beyond the acked job's count bound, deleting the
    /// oldest records. Age-based trimming runs in the reaper sweep.
    fn trim_finished(
        jobs: &mut HashMap<JobId, JobRecord>,
        list: &mut VecDeque<(DateTime<Utc>, JobId)>,
        count: usize,
    ) {
        while list.len() > count {
            if let Some((_, old_id)) = list.pop_front() {
                jobs.remove(&old_id);
            }
        }
    }

    /// Validate that `token` currently owns `job_id` and the claim is live
    fn check_claim(
        record: &JobRecord,
        token: &ClaimToken,
        now: DateTime<Utc>,
    ) -> RelayResult<()> {
        if record.status.is_terminal() {
            return Err(RelayError::JobAlreadyTerminal);
        }
        if record.claim_token.as_ref() != Some(token) {
            return Err(RelayError::InvalidClaimToken);
        }
        if let Some(claim_until) = record.claim_until {
            if now > claim_until {
                return Err(RelayError::ClaimExpired);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn enqueue(
        &self,
        queue: &str,
        envelope: TaskEnvelope,
        options: EnqueueOptions,
    ) -> RelayResult<JobId> {
        let job_id = JobId::new();
        let record = JobRecord::new(job_id.clone(), queue.to_string(), envelope, options);
        let created_at = record.created_at;

        self.jobs.write().insert(job_id.clone(), record);
        self.queues
            .write()
            .entry(queue.to_string())
            .or_default()
            .push_back(job_id.clone());

        self.emit(JobEvent::Enqueued {
            job_id: job_id.clone(),
            queue: queue.to_string(),
            at: created_at,
        });

        Ok(job_id)
    }

    async fn claim(&self, queue: &str) -> RelayResult<Option<ClaimedJob>> {
        let now = Utc::now();

        let mut jobs = self.jobs.write();
        let mut queues = self.queues.write();

        let wait = match queues.get_mut(queue) {
            Some(wait) => wait,
            None => return Ok(None),
        };

        // Drop stale entries (terminal or deleted jobs still listed)
        wait.retain(|id| jobs.get(id).is_some_and(|r| !r.status.is_terminal()));

        // First eligible job wins: enqueued, or retrying with an elapsed delay
        let position = wait
            .iter()
            .position(|id| jobs.get(id).is_some_and(|r| r.status.is_eligible(now)));

        let Some(position) = position else {
            return Ok(None);
        };

        let job_id = wait.remove(position).expect("position within bounds");
        let record = jobs
            .get_mut(&job_id)
            .ok_or_else(|| RelayError::JobNotFound(job_id.to_string()))?;

        let token = ClaimToken::new();
        let claim_until =
            now + chrono::Duration::milliseconds(self.claim_timeout.as_millis() as i64);
        record.begin_claim(token.clone(), claim_until);

        self.emit(JobEvent::Claimed {
            job_id: job_id.clone(),
            attempt: record.attempts_made,
            claim_until,
            at: now,
        });

        Ok(Some(ClaimedJob {
            record: record.clone(),
            token,
            claim_until,
        }))
    }

    async fn ack_complete(
        &self,
        queue: &str,
        job_id: JobId,
        token: ClaimToken,
    ) -> RelayResult<()> {
        let now = Utc::now();
        let mut jobs = self.jobs.write();

        let record = jobs
            .get_mut(&job_id)
            .ok_or_else(|| RelayError::JobNotFound(job_id.to_string()))?;
        Self::check_claim(record, &token, now)?;

        record.complete();
        let retain = record.options.retain_completed.count;

        let mut finished = self.finished.write();
        let sets = finished.entry(queue.to_string()).or_default();
        sets.completed.push_back((now, job_id.clone()));
        Self::trim_finished(&mut jobs, &mut sets.completed, retain);

        self.emit(JobEvent::Completed {
            job_id,
            at: now,
        });

        Ok(())
    }

    async fn ack_fail(
        &self,
        queue: &str,
        job_id: JobId,
        token: ClaimToken,
        error: String,
    ) -> RelayResult<FailOutcome> {
        let now = Utc::now();
        let mut jobs = self.jobs.write();

        let record = jobs
            .get_mut(&job_id)
            .ok_or_else(|| RelayError::JobNotFound(job_id.to_string()))?;
        Self::check_claim(record, &token, now)?;

        if record.attempts_made >= record.options.attempts {
            // Attempt budget exhausted: terminal, retained for inspection
            record.fail(error.clone());
            let retain = record.options.retain_failed.count;

            let mut finished = self.finished.write();
            let sets = finished.entry(queue.to_string()).or_default();
            sets.failed.push_back((now, job_id.clone()));
            Self::trim_finished(&mut jobs, &mut sets.failed, retain);

            self.emit(JobEvent::Failed {
                job_id,
                error,
                at: now,
            });

            return Ok(FailOutcome::Terminal);
        }

        let delay = record.options.backoff.delay_for(record.attempts_made);
        let retry_at = now + chrono::Duration::milliseconds(delay.as_millis() as i64);
        record.schedule_retry(retry_at, error.clone());

        self.queues
            .write()
            .entry(queue.to_string())
            .or_default()
            .push_back(job_id.clone());

        self.emit(JobEvent::Retrying {
            job_id,
            retry_at,
            error,
            at: now,
        });

        Ok(FailOutcome::Retrying { retry_at })
    }

    async fn get_status(&self, _queue: &str, job_id: JobId) -> RelayResult<JobStatus> {
        let jobs = self.jobs.read();
        let record = jobs
            .get(&job_id)
            .ok_or_else(|| RelayError::JobNotFound(job_id.to_string()))?;

        Ok(record.status.clone())
    }

    async fn get_record(&self, _queue: &str, job_id: JobId) -> RelayResult<JobRecord> {
        let jobs = self.jobs.read();
        let record = jobs
            .get(&job_id)
            .ok_or_else(|| RelayError::JobNotFound(job_id.to_string()))?;

        Ok(record.clone())
    }

    fn event_stream(&self) -> BoxStream<JobEvent> {
        use tokio_stream::{wrappers::BroadcastStream, StreamExt};

        let receiver = self.event_broadcaster.subscribe();
        let stream = BroadcastStream::new(receiver).filter_map(|result| result.ok());

        Box::pin(stream)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MemoryBackend {
    fn clone(&self) -> Self {
        Self {
            claim_timeout: self.claim_timeout,
            jobs: self.jobs.clone(),
            queues: self.queues.clone(),
            finished: self.finished.clone(),
            event_broadcaster: self.event_broadcaster.clone(),
        }
    }
}

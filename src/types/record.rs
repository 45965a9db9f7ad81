use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ClaimToken, EnqueueOptions, JobId, TaskEnvelope};

/// Job status lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobStatus {
    /// Job is queued and waiting to be claimed
    Enqueued,

    /// Job is claimed by exactly one worker, until the claim deadline
    Claimed { claim_until: DateTime<Utc> },

    /// Job failed and is waiting out its backoff delay
    Retrying { retry_at: DateTime<Utc> },

    /// Job completed successfully; retained until garbage-collected
    Completed { completed_at: DateTime<Utc> },

    /// Job exhausted its attempt budget; retained for inspection
    Failed {
        failed_at: DateTime<Utc>,
        error: String,
    },
}

impl JobStatus {
    /// Check if the job is in a terminal state (completed or failed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }

    /// Check if the job may be claimed right now
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::Enqueued => true,
            Self::Retrying { retry_at } => *retry_at <= now,
            _ => false,
        }
    }

    /// Get the status name as a string
    pub fn name(&self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Claimed { .. } => "claimed",
            Self::Retrying { .. } => "retrying",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Job record - mutable runtime state owned by the queue.
///
/// The worker never mutates a record directly; it only reports outcomes
/// through `ack_complete`/`ack_fail` and the queue advances the state here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique job identifier
    pub job_id: JobId,

    /// Queue the job was enqueued on
    pub queue: String,

    /// Immutable unit of work
    pub envelope: TaskEnvelope,

    /// Retry/retention options captured at enqueue time
    pub options: EnqueueOptions,

    /// Current job status
    pub status: JobStatus,

    /// Attempts charged so far (incremented at claim time)
    pub attempts_made: u32,

    /// When the job was enqueued
    pub created_at: DateTime<Utc>,

    /// When the record last changed
    pub updated_at: DateTime<Utc>,

    /// Last error message (if any)
    pub last_error: Option<String>,

    /// Current claim token (if claimed)
    pub claim_token: Option<ClaimToken>,

    /// When the current claim expires (if claimed)
    pub claim_until: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Create a new record in the enqueued state
    pub fn new(
        job_id: JobId,
        queue: String,
        envelope: TaskEnvelope,
        options: EnqueueOptions,
    ) -> Self {
        let now = Utc::now();

        Self {
            job_id,
            queue,
            envelope,
            options,
            status: JobStatus::Enqueued,
            attempts_made: 0,
            created_at: now,
            updated_at: now,
            last_error: None,
            claim_token: None,
            claim_until: None,
        }
    }

    /// Check if the job still has attempt budget left
    pub fn can_retry(&self) -> bool {
        self.attempts_made < self.options.attempts && !self.status.is_terminal()
    }

    /// Check if the current claim has expired
    pub fn claim_expired(&self, now: DateTime<Utc>) -> bool {
        match (&self.status, &self.claim_until) {
            (JobStatus::Claimed { .. }, Some(claim_until)) => *claim_until < now,
            _ => false,
        }
    }

    /// Charge an attempt and move to the claimed state
    pub fn begin_claim(&mut self, token: ClaimToken, claim_until: DateTime<Utc>) {
        self.attempts_made += 1;
        self.status = JobStatus::Claimed { claim_until };
        self.claim_token = Some(token);
        self.claim_until = Some(claim_until);
        self.updated_at = Utc::now();
    }

    /// Complete the job successfully
    pub fn complete(&mut self) {
        self.status = JobStatus::Completed {
            completed_at: Utc::now(),
        };
        self.claim_token = None;
        self.claim_until = None;
        self.updated_at = Utc::now();
    }

    /// Mark the job failed-terminal
    pub fn fail(&mut self, error: String) {
        self.status = JobStatus::Failed {
            failed_at: Utc::now(),
            error: error.clone(),
        };
        self.last_error = Some(error);
        self.claim_token = None;
        self.claim_until = None;
        self.updated_at = Utc::now();
    }

    /// Schedule a retry after the backoff delay
    pub fn schedule_retry(&mut self, retry_at: DateTime<Utc>, error: String) {
        self.status = JobStatus::Retrying { retry_at };
        self.last_error = Some(error);
        self.claim_token = None;
        self.claim_until = None;
        self.updated_at = Utc::now();
    }
}

/// A job that has been claimed for processing
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    /// The job record as of claim time
    pub record: JobRecord,

    /// Claim token required for acknowledgment
    pub token: ClaimToken,

    /// When the claim expires
    pub claim_until: DateTime<Utc>,
}

impl ClaimedJob {
    /// Get the job ID
    pub fn job_id(&self) -> &JobId {
        &self.record.job_id
    }

    /// Get the unit of work
    pub fn envelope(&self) -> &TaskEnvelope {
        &self.record.envelope
    }

    /// Which attempt this claim represents (1-based)
    pub fn attempt(&self) -> u32 {
        self.record.attempts_made
    }

    /// Check if the claim is still valid
    pub fn claim_valid(&self, now: DateTime<Utc>) -> bool {
        self.claim_until > now
    }
}

/// The queue's decision after a reported failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Attempt budget remains; the job was re-enqueued with backoff
    Retrying { retry_at: DateTime<Utc> },

    /// Attempts exhausted; the job is failed-terminal
    Terminal,
}

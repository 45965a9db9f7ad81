use std::sync::Arc;

use tracing::{info, instrument};

use crate::{backend::QueueBackend, EnqueueOptions, JobId, RelayResult, TaskEnvelope};

/// Producer handle for a named queue.
///
/// Captures the default per-job options once so every producer call site
/// enqueues with the same retry and retention configuration. The relay
/// itself never enqueues; this is the contract the HTTP front end (and the
/// test suites) submit work through.
#[derive(Clone)]
pub struct TaskQueue {
    name: String,
    backend: Arc<dyn QueueBackend>,
    default_options: EnqueueOptions,
}

impl TaskQueue {
    /// Create a handle for `name` with the reference default options
    /// (3 attempts, exponential backoff from 2s, bounded retention)
    pub fn new(name: impl Into<String>, backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            name: name.into(),
            backend,
            default_options: EnqueueOptions::default(),
        }
    }

    /// Override the default per-job options
    pub fn with_default_options(mut self, options: EnqueueOptions) -> Self {
        self.default_options = options;
        self
    }

    /// Queue name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue an envelope with the queue's default options
    #[instrument(skip(self, envelope), fields(queue = %self.name))]
    pub async fn add(&self, envelope: TaskEnvelope) -> RelayResult<JobId> {
        self.add_with_options(envelope, self.default_options.clone())
            .await
    }

    /// Enqueue an envelope with explicit options
    pub async fn add_with_options(
        &self,
        envelope: TaskEnvelope,
        options: EnqueueOptions,
    ) -> RelayResult<JobId> {
        let job_id = self
            .backend
            .enqueue(&self.name, envelope, options)
            .await?;

        info!(%job_id, queue = %self.name, "enqueued job");
        Ok(job_id)
    }
}

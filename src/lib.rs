//! # relay-queue: Durable AI Task Relay
//!
//! **At-least-once job relay with queue-owned retry semantics**
//!
//! relay-queue drains a Redis-backed durable queue and forwards each job to
//! a downstream processing service over HTTP, keeping the blast radius of a
//! struggling downstream bounded on both sides:
//!
//! - **Bounded concurrency**: at most `C` jobs in flight per worker process
//! - **Rolling-window rate limit**: never more than `N` job starts within
//!   any `T`-millisecond window, independent of the concurrency cap
//! - **Queue-owned retries**: attempt counting, exponential backoff, and
//!   retention/GC live in the durable queue - the worker is stateless
//!   between jobs, so a crashed worker loses nothing
//! - **Exclusive claims**: a claim token and deadline guarantee a job is
//!   never processed by two handlers at once; expired claims are reclaimed
//! - **Graceful shutdown**: SIGTERM/SIGINT stop new claims and drain
//!   in-flight jobs within a bounded grace period
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use relay_queue::backend::memory::MemoryBackend;
//! use relay_queue::{DownstreamClient, RelayWorker, TaskEnvelope, TaskQueue};
//!
//! # async fn demo() -> relay_queue::RelayResult<()> {
//! let backend = Arc::new(MemoryBackend::new());
//!
//! // Producer side: enqueue with the reference retry/retention defaults
//! let queue = TaskQueue::new("ai-tasks", backend.clone());
//! queue
//!     .add(TaskEnvelope::new(
//!         "s1",
//!         "u1",
//!         "m1",
//!         "hello",
//!         "2025-01-01T00:00:00Z",
//!     ))
//!     .await?;
//!
//! // Relay side: claim jobs and forward them downstream
//! let client =
//!     DownstreamClient::new("http://localhost:8000", "secret", Duration::from_secs(30))?;
//! let worker = RelayWorker::new("ai-tasks", backend, Arc::new(client));
//! let handle = worker.start();
//!
//! // ... later: stop claiming, drain in-flight jobs
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod downstream;
pub mod error;
pub mod observability;
pub mod processor;
pub mod queue;
pub mod types;
pub mod worker;

// Core API exports
pub use config::{ConfigError, RelayConfig};
pub use downstream::DownstreamClient;
pub use error::{ProcessError, RelayError, RelayResult};
pub use observability::{MetricsSnapshot, RelayMetrics};
pub use processor::JobProcessor;
pub use queue::TaskQueue;
pub use types::{
    BackoffPolicy, ClaimToken, ClaimedJob, EnqueueOptions, FailOutcome, JobEvent, JobId,
    JobRecord, JobStatus, RetentionPolicy, TaskEnvelope,
};
pub use worker::{RateLimit, RelayWorker, WorkerHandle, WorkerOptions};

pub use backend::QueueBackend;

// Backend implementations
#[cfg(feature = "memory")]
pub use backend::memory::MemoryBackend;

#[cfg(feature = "redis")]
pub use backend::redis::RedisBackend;

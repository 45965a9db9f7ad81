use thiserror::Error;

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

/// Infrastructure errors for queue and worker operations
#[derive(Error, Debug, Clone)]
pub enum RelayError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid claim token")]
    InvalidClaimToken,

    #[error("Claim has expired")]
    ClaimExpired,

    #[error("Job is already in terminal state")]
    JobAlreadyTerminal,

    #[error("Queue storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Worker shutdown")]
    WorkerShutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for RelayError {
    fn from(err: redis::RedisError) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Downstream processing outcome for a single forwarded job.
///
/// Both variants are reported to the queue identically: the downstream
/// contract does not distinguish retryable from permanent rejections, so
/// every failure consumes an attempt and rides the queue's backoff schedule.
#[derive(Error, Debug)]
pub enum ProcessError {
    /// Downstream answered with a non-2xx status; body text captured as detail
    #[error("Downstream returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Request never produced a response (connect, DNS, timeout) or the
    /// success body could not be read
    #[error("Downstream request failed: {0}")]
    Network(#[from] reqwest::Error),
}

impl ProcessError {
    /// HTTP status code, when the failure was an HTTP-level rejection
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Network(err) => err.status().map(|s| s.as_u16()),
        }
    }
}

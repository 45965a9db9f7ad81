use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-job options recorded at enqueue time.
///
/// Once enqueued these are owned by the queue: retry scheduling and
/// garbage collection of finished jobs are driven from the stored copy,
/// never from worker-side state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOptions {
    /// Maximum attempt count before the job is marked failed-terminal
    pub attempts: u32,

    /// Delay schedule applied between failed attempts
    pub backoff: BackoffPolicy,

    /// How long/how many completed jobs are retained before GC
    pub retain_completed: RetentionPolicy,

    /// How long/how many failed-terminal jobs are retained before GC
    pub retain_failed: RetentionPolicy,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: BackoffPolicy::Exponential {
                delay: Duration::from_millis(2000),
            },
            retain_completed: RetentionPolicy {
                age: Duration::from_secs(3600),
                count: 1000,
            },
            retain_failed: RetentionPolicy {
                age: Duration::from_secs(86400),
                count: 5000,
            },
        }
    }
}

impl EnqueueOptions {
    /// Set the maximum attempt count
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Set the backoff policy
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the retention policy for completed jobs
    pub fn with_retain_completed(mut self, policy: RetentionPolicy) -> Self {
        self.retain_completed = policy;
        self
    }

    /// Set the retention policy for failed-terminal jobs
    pub fn with_retain_failed(mut self, policy: RetentionPolicy) -> Self {
        self.retain_failed = policy;
        self
    }
}

/// Delay schedule between failed attempts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// delay, 2*delay, 4*delay, ... doubling per prior attempt
    Exponential { delay: Duration },

    /// The same delay after every failed attempt
    Fixed { delay: Duration },
}

impl BackoffPolicy {
    /// Delay before the next attempt, given how many attempts have already
    /// been made (>= 1 whenever a failure is being scheduled)
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match self {
            Self::Exponential { delay } => {
                let exponent = attempts_made.saturating_sub(1).min(31);
                *delay * 2u32.pow(exponent)
            }
            Self::Fixed { delay } => *delay,
        }
    }
}

/// Bounded retention window for finished jobs; whichever bound is hit first
/// triggers garbage collection by the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Maximum age before a finished job is garbage-collected
    pub age: Duration,

    /// Maximum number of finished jobs kept
    pub count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_doubles() {
        let backoff = BackoffPolicy::Exponential {
            delay: Duration::from_millis(2000),
        };

        assert_eq!(backoff.delay_for(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(4));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(8));
    }

    #[test]
    fn test_fixed_backoff_is_constant() {
        let backoff = BackoffPolicy::Fixed {
            delay: Duration::from_millis(500),
        };

        assert_eq!(backoff.delay_for(1), Duration::from_millis(500));
        assert_eq!(backoff.delay_for(7), Duration::from_millis(500));
    }

    #[test]
    fn test_reference_defaults() {
        let options = EnqueueOptions::default();

        assert_eq!(options.attempts, 3);
        assert_eq!(options.retain_completed.count, 1000);
        assert_eq!(options.retain_failed.age, Duration::from_secs(86400));
    }
}

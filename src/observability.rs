use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters for a single worker process.
///
/// Cheap enough to bump on every job; read via [`RelayMetrics::snapshot`]
/// for logging or inspection. Cumulative since worker start.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    claimed: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    failed_terminal: AtomicU64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_claimed(&self) {
        self.claimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_terminal(&self) {
        self.failed_terminal.fetch_add(1, Ordering::Relaxed);
    }

    /// Consistent-enough point-in-time view of the counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            claimed: self.claimed.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed_terminal: self.failed_terminal.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of worker counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub claimed: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed_terminal: u64,
}

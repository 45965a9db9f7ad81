use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::{
    backend::memory::storage::MemoryBackend, JobEvent, JobStatus, RelayResult,
};

/// Claim-expiry reaper: returns abandoned claims to the queue and enforces
/// age-based retention for finished jobs.
///
/// A worker that dies mid-job never acks; once its claim deadline passes the
/// reaper makes the job eligible again, preserving at-least-once delivery.
pub struct ClaimReaper {
    backend: Arc<MemoryBackend>,
    interval: Duration,
}

impl ClaimReaper {
    /// Create a new reaper with the default 30-second cycle
    pub fn new(backend: Arc<MemoryBackend>) -> Self {
        Self {
            backend,
            interval: Duration::from_secs(30),
        }
    }

    /// Create reaper with custom interval
    pub fn with_interval(backend: Arc<MemoryBackend>, interval: Duration) -> Self {
        Self { backend, interval }
    }

    /// Run the reaper until the task is dropped
    pub async fn start(self) -> RelayResult<()> {
        let mut ticker = interval(self.interval);

        info!(interval = ?self.interval, "starting claim reaper");

        loop {
            ticker.tick().await;

            match self.reap_expired_claims().await {
                Ok(reclaimed) if reclaimed > 0 => {
                    info!(reclaimed, "reclaimed expired claims");
                }
                Ok(_) => debug!("no expired claims found"),
                Err(e) => warn!(error = %e, "error during claim reaping"),
            }

            if let Err(e) = self.sweep_retention().await {
                warn!(error = %e, "error during retention sweep");
            }
        }
    }

    /// Run one reclaim cycle; returns how many claims were reclaimed
    pub async fn reap_expired_claims(&self) -> RelayResult<usize> {
        let now = Utc::now();
        let mut reclaimed = 0;

        let expired: Vec<_> = {
            let jobs = self.backend.jobs.read();
            jobs.values()
                .filter(|record| record.claim_expired(now))
                .map(|record| record.job_id.clone())
                .collect()
        };

        for job_id in expired {
            let mut jobs = self.backend.jobs.write();
            let Some(record) = jobs.get_mut(&job_id) else {
                continue;
            };
            // Re-check under the lock; an ack may have raced the scan
            if !record.claim_expired(now) {
                continue;
            }

            debug!(%job_id, "reclaiming expired claim");

            if record.attempts_made >= record.options.attempts {
                record.fail("Claim expired after final attempt".to_string());
                let queue = record.queue.clone();
                let error = record.last_error.clone().unwrap_or_default();
                drop(jobs);

                self.backend
                    .finished
                    .write()
                    .entry(queue)
                    .or_default()
                    .failed
                    .push_back((now, job_id.clone()));

                let _ = self.backend.event_broadcaster.send(JobEvent::Failed {
                    job_id,
                    error,
                    at: now,
                });
            } else {
                // Make immediately eligible again; the attempt was already
                // charged at claim time
                record.schedule_retry(now, "Claim expired".to_string());
                let queue = record.queue.clone();
                drop(jobs);

                self.backend
                    .queues
                    .write()
                    .entry(queue)
                    .or_default()
                    .push_back(job_id.clone());

                let _ = self.backend.event_broadcaster.send(JobEvent::Retrying {
                    job_id,
                    retry_at: now,
                    error: "Claim expired".to_string(),
                    at: now,
                });
            }

            reclaimed += 1;
        }

        Ok(reclaimed)
    }

    /// Garbage-collect finished jobs past their retention age
    pub async fn sweep_retention(&self) -> RelayResult<usize> {
        let now = Utc::now();
        let mut removed = 0;

        let mut jobs = self.backend.jobs.write();
        let mut finished = self.backend.finished.write();

        for sets in finished.values_mut() {
            for list in [&mut sets.completed, &mut sets.failed] {
                list.retain(|(finished_at, job_id)| {
                    let expired = jobs.get(job_id).is_some_and(|record| {
                        let age = match record.status {
                            JobStatus::Completed { .. } => record.options.retain_completed.age,
                            _ => record.options.retain_failed.age,
                        };
                        *finished_at + chrono::Duration::milliseconds(age.as_millis() as i64)
                            <= now
                    });

                    if expired {
                        jobs.remove(job_id);
                        removed += 1;
                    }
                    !expired && jobs.contains_key(job_id)
                });
            }
        }

        Ok(removed)
    }
}

/// Test helpers for deterministic claim-expiry scenarios
impl MemoryBackend {
    /// Force a claim to expire (test helper)
    pub fn force_claim_expiry(&self, job_id: &crate::JobId) {
        let mut jobs = self.jobs.write();
        if let Some(record) = jobs.get_mut(job_id) {
            let past = Utc::now() - chrono::Duration::seconds(1);
            if let JobStatus::Claimed { ref mut claim_until } = record.status {
                *claim_until = past;
            }
            record.claim_until = Some(past);
        }
    }

    /// Run one reaper cycle (test helper)
    pub async fn run_reaper_tick(&self) -> RelayResult<usize> {
        let reaper = ClaimReaper::new(Arc::new(self.clone()));
        reaper.reap_expired_claims().await
    }
}

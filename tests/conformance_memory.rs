//! Conformance suite for the in-memory queue backend: claim exclusivity,
//! token-guarded acks, retry/backoff scheduling, claim-expiry reclaim, and
//! retention trimming.

#![cfg(feature = "memory")]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_stream::StreamExt;

use relay_queue::backend::memory::{ClaimReaper, MemoryBackend};
use relay_queue::{
    BackoffPolicy, ClaimToken, EnqueueOptions, FailOutcome, JobEvent, JobStatus, QueueBackend,
    RelayError, RetentionPolicy, TaskEnvelope,
};

/// Test factory functions
fn test_envelope() -> TaskEnvelope {
    TaskEnvelope::new("s1", "u1", "m1", "hello", "2025-01-01T00:00:00Z")
}

fn fast_backoff_options() -> EnqueueOptions {
    EnqueueOptions::default().with_backoff(BackoffPolicy::Exponential {
        delay: Duration::from_millis(40),
    })
}

async fn next_event(stream: &mut relay_queue::backend::BoxStream<JobEvent>) -> JobEvent {
    tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("Timeout waiting for event")
        .expect("Stream ended")
}

/// A1. Claim Is Atomic And Exclusive
#[tokio::test]
async fn test_claim_is_atomic_and_exclusive() {
    let backend = MemoryBackend::new();

    // Arrange: enqueue one job
    let job_id = backend
        .enqueue("ai-tasks", test_envelope(), EnqueueOptions::default())
        .await
        .unwrap();

    // Act: claim
    let claimed = backend.claim("ai-tasks").await.unwrap().unwrap();

    // Assert: claim carries a token and a future deadline
    assert_eq!(claimed.record.job_id, job_id);
    assert!(!claimed.token.as_str().is_empty());
    assert!(claimed.claim_until > Utc::now());

    // Status reflects the claim
    let status = backend
        .get_status("ai-tasks", job_id.clone())
        .await
        .unwrap();
    assert!(matches!(status, JobStatus::Claimed { .. }));

    // Exclusive: no second claim while the first is live
    assert!(backend.claim("ai-tasks").await.unwrap().is_none());
}

/// A2. Only Claim Holder Can Ack
#[tokio::test]
async fn test_only_claim_holder_can_ack() {
    let backend = MemoryBackend::new();

    // Arrange: claim a job (token = T1)
    backend
        .enqueue("ai-tasks", test_envelope(), EnqueueOptions::default())
        .await
        .unwrap();
    let claimed = backend.claim("ai-tasks").await.unwrap().unwrap();
    let fake_token = ClaimToken::from("invalid_token");

    // Act: ack_complete with a different token
    let result = backend
        .ack_complete("ai-tasks", claimed.record.job_id.clone(), fake_token.clone())
        .await;

    // Assert: InvalidClaimToken, and the same for ack_fail
    assert!(matches!(result, Err(RelayError::InvalidClaimToken)));

    let result = backend
        .ack_fail(
            "ai-tasks",
            claimed.record.job_id,
            fake_token,
            "boom".to_string(),
        )
        .await;
    assert!(matches!(result, Err(RelayError::InvalidClaimToken)));
}

/// A3. Claim Expiry Race -> ClaimExpired
#[tokio::test]
async fn test_claim_expiry_race() {
    let backend = MemoryBackend::new();

    backend
        .enqueue("ai-tasks", test_envelope(), EnqueueOptions::default())
        .await
        .unwrap();
    let claimed = backend.claim("ai-tasks").await.unwrap().unwrap();
    backend.force_claim_expiry(&claimed.record.job_id);

    // Act: ack_complete with an expired claim
    let result = backend
        .ack_complete("ai-tasks", claimed.record.job_id, claimed.token)
        .await;

    assert!(matches!(result, Err(RelayError::ClaimExpired)));
}

/// A4. Expired Claim Becomes Eligible Again
#[tokio::test]
async fn test_expired_claim_becomes_eligible_again() {
    let backend = Arc::new(MemoryBackend::new());

    let job_id = backend
        .enqueue("ai-tasks", test_envelope(), EnqueueOptions::default())
        .await
        .unwrap();
    let first = backend.claim("ai-tasks").await.unwrap().unwrap();
    assert_eq!(first.attempt(), 1);

    backend.force_claim_expiry(&job_id);
    let reclaimed = backend.run_reaper_tick().await.unwrap();
    assert_eq!(reclaimed, 1);

    // The same job is claimable again; the abandoned claim consumed an attempt
    let second = backend.claim("ai-tasks").await.unwrap().unwrap();
    assert_eq!(second.record.job_id, job_id);
    assert_eq!(second.attempt(), 2);
    assert_ne!(second.token, first.token);
}

/// B1. Retry Delays Strictly Increase
#[tokio::test]
async fn test_retry_delays_strictly_increase() {
    let backend = MemoryBackend::new();

    let job_id = backend
        .enqueue("ai-tasks", test_envelope(), fast_backoff_options())
        .await
        .unwrap();

    // First failure
    let claimed = backend.claim("ai-tasks").await.unwrap().unwrap();
    let failed_at = Utc::now();
    let outcome = backend
        .ack_fail("ai-tasks", job_id.clone(), claimed.token, "503".to_string())
        .await
        .unwrap();
    let FailOutcome::Retrying { retry_at: first_retry } = outcome else {
        panic!("expected retry after first failure");
    };
    let first_delay = first_retry - failed_at;

    // Wait out the backoff, fail again
    tokio::time::sleep(Duration::from_millis(60)).await;
    let claimed = backend.claim("ai-tasks").await.unwrap().unwrap();
    assert_eq!(claimed.attempt(), 2);
    let failed_at = Utc::now();
    let outcome = backend
        .ack_fail("ai-tasks", job_id.clone(), claimed.token, "503".to_string())
        .await
        .unwrap();
    let FailOutcome::Retrying { retry_at: second_retry } = outcome else {
        panic!("expected retry after second failure");
    };
    let second_delay = second_retry - failed_at;

    // Exponential: the second delay is at least ~double the first
    assert!(second_delay > first_delay);
    assert!(second_delay >= chrono::Duration::milliseconds(75));
}

/// B2. Attempts Exhausted -> Failed-Terminal, Retained For Inspection
#[tokio::test]
async fn test_attempts_exhausted_is_terminal() {
    let backend = MemoryBackend::new();

    let job_id = backend
        .enqueue(
            "ai-tasks",
            test_envelope(),
            fast_backoff_options().with_attempts(2),
        )
        .await
        .unwrap();

    // Attempt 1 fails -> retry
    let claimed = backend.claim("ai-tasks").await.unwrap().unwrap();
    let outcome = backend
        .ack_fail("ai-tasks", job_id.clone(), claimed.token, "503".to_string())
        .await
        .unwrap();
    assert!(matches!(outcome, FailOutcome::Retrying { .. }));

    // Attempt 2 fails -> terminal
    tokio::time::sleep(Duration::from_millis(60)).await;
    let claimed = backend.claim("ai-tasks").await.unwrap().unwrap();
    let outcome = backend
        .ack_fail("ai-tasks", job_id.clone(), claimed.token, "503 final".to_string())
        .await
        .unwrap();
    assert_eq!(outcome, FailOutcome::Terminal);

    // Never claimed again
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(backend.claim("ai-tasks").await.unwrap().is_none());

    // Retained for inspection with the final error
    let record = backend.get_record("ai-tasks", job_id).await.unwrap();
    assert!(matches!(record.status, JobStatus::Failed { .. }));
    assert_eq!(record.last_error.as_deref(), Some("503 final"));
    assert_eq!(record.attempts_made, 2);
}

/// C1. FIFO Claim Order
#[tokio::test]
async fn test_fifo_claim_order() {
    let backend = MemoryBackend::new();

    let mut enqueued = Vec::new();
    for i in 0..3 {
        let envelope = TaskEnvelope::new("s1", "u1", format!("m{i}"), "hello", "2025-01-01T00:00:00Z");
        enqueued.push(
            backend
                .enqueue("ai-tasks", envelope, EnqueueOptions::default())
                .await
                .unwrap(),
        );
    }

    for expected in &enqueued {
        let claimed = backend.claim("ai-tasks").await.unwrap().unwrap();
        assert_eq!(&claimed.record.job_id, expected);
    }
}

/// D1. Retention Trims Completed Jobs By Count
#[tokio::test]
async fn test_retention_trims_completed_by_count() {
    let backend = MemoryBackend::new();
    let options = EnqueueOptions::default().with_retain_completed(RetentionPolicy {
        age: Duration::from_secs(3600),
        count: 2,
    });

    let mut completed = Vec::new();
    for _ in 0..3 {
        let job_id = backend
            .enqueue("ai-tasks", test_envelope(), options.clone())
            .await
            .unwrap();
        let claimed = backend.claim("ai-tasks").await.unwrap().unwrap();
        backend
            .ack_complete("ai-tasks", job_id.clone(), claimed.token)
            .await
            .unwrap();
        completed.push(job_id);
    }

    // Oldest record garbage-collected, newest two retained
    let result = backend.get_record("ai-tasks", completed[0].clone()).await;
    assert!(matches!(result, Err(RelayError::JobNotFound(_))));

    for job_id in &completed[1..] {
        let record = backend.get_record("ai-tasks", job_id.clone()).await.unwrap();
        assert!(matches!(record.status, JobStatus::Completed { .. }));
    }
}

/// D2. Retention Sweeps Finished Jobs By Age
#[tokio::test]
async fn test_retention_sweeps_by_age() {
    let backend = Arc::new(MemoryBackend::new());
    let options = EnqueueOptions::default().with_retain_completed(RetentionPolicy {
        age: Duration::from_millis(10),
        count: 1000,
    });

    let job_id = backend
        .enqueue("ai-tasks", test_envelope(), options)
        .await
        .unwrap();
    let claimed = backend.claim("ai-tasks").await.unwrap().unwrap();
    backend
        .ack_complete("ai-tasks", job_id.clone(), claimed.token)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;

    let reaper = ClaimReaper::new(backend.clone());
    let removed = reaper.sweep_retention().await.unwrap();
    assert_eq!(removed, 1);

    let result = backend.get_record("ai-tasks", job_id).await;
    assert!(matches!(result, Err(RelayError::JobNotFound(_))));
}

/// E1. Completion Is Recorded Exactly Once
#[tokio::test]
async fn test_double_ack_is_rejected() {
    let backend = MemoryBackend::new();

    let job_id = backend
        .enqueue("ai-tasks", test_envelope(), EnqueueOptions::default())
        .await
        .unwrap();
    let claimed = backend.claim("ai-tasks").await.unwrap().unwrap();

    backend
        .ack_complete("ai-tasks", job_id.clone(), claimed.token.clone())
        .await
        .unwrap();

    // Second completion and a late failure are both rejected
    let result = backend
        .ack_complete("ai-tasks", job_id.clone(), claimed.token.clone())
        .await;
    assert!(matches!(result, Err(RelayError::JobAlreadyTerminal)));

    let result = backend
        .ack_fail("ai-tasks", job_id, claimed.token, "late".to_string())
        .await;
    assert!(matches!(result, Err(RelayError::JobAlreadyTerminal)));
}

/// E2. Lifecycle Events Are Observable
#[tokio::test]
async fn test_event_stream_follows_lifecycle() {
    let backend = MemoryBackend::new();
    let mut events = backend.event_stream();

    let job_id = backend
        .enqueue("ai-tasks", test_envelope(), EnqueueOptions::default())
        .await
        .unwrap();
    let claimed = backend.claim("ai-tasks").await.unwrap().unwrap();
    backend
        .ack_complete("ai-tasks", job_id.clone(), claimed.token)
        .await
        .unwrap();

    let event = next_event(&mut events).await;
    assert_eq!(event.event_name(), "enqueued");
    assert_eq!(event.job_id(), &job_id);

    let event = next_event(&mut events).await;
    assert_eq!(event.event_name(), "claimed");

    let event = next_event(&mut events).await;
    assert_eq!(event.event_name(), "completed");
}

#![allow(dead_code)]

//! Store conformance scenarios shared by every `JobStore` backend.

use chrono::{DateTime, Duration as ChronoDuration, SubsecRound, Utc};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;

use booking_jobs::{
    DedupePolicy, JobError, JobEvent, JobStatus, JobStore, LockToken, NewJob, QueueError, RetryBackoff, StoreOptions,
};

/// Options the scenarios below are written against
pub fn options() -> StoreOptions {
    StoreOptions {
        lease_duration: Duration::from_secs(30),
        max_attempts: 3,
        backoff: RetryBackoff::new(Duration::from_secs(1), Duration::from_secs(60)),
        dedupe_policy: DedupePolicy::Replace,
    }
}

pub fn reject_options() -> StoreOptions {
    StoreOptions {
        dedupe_policy: DedupePolicy::Reject,
        ..options()
    }
}

/// Whole-second offset from now; SQL backends may truncate sub-second precision
pub fn at(offset_secs: i64) -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0) + ChronoDuration::seconds(offset_secs)
}

fn reminder(key: &str) -> NewJob {
    NewJob::new("reminder", json!({ "booking": key })).with_dedupe_key(key)
}

/// C1. Lease hands out a due job under a fresh token
pub async fn lease_assigns_token(store: Arc<dyn JobStore>) {
    // Arrange
    let job = store.enqueue(reminder("c1")).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    // Act
    let leased = store.lease_due_jobs(Utc::now(), 10).await.unwrap();

    // Assert
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0].id, job.id);
    assert_eq!(leased[0].status, JobStatus::InFlight);
    assert!(leased[0].lock_token.is_some());
    assert!(leased[0].locked_until.unwrap() > Utc::now());

    // Nothing left to lease
    assert!(store.lease_due_jobs(Utc::now(), 10).await.unwrap().is_empty());
}

/// C2. Future jobs stay put; due jobs come out earliest first and within the limit
pub async fn lease_respects_due_time_and_limit(store: Arc<dyn JobStore>) {
    let later = store.enqueue(reminder("late").run_at(at(3600))).await.unwrap();
    let second = store.enqueue(reminder("second").run_at(at(-10))).await.unwrap();
    let first = store.enqueue(reminder("first").run_at(at(-20))).await.unwrap();
    store.enqueue(reminder("third").run_at(at(-5))).await.unwrap();

    let leased = store.lease_due_jobs(Utc::now(), 2).await.unwrap();

    let ids: Vec<_> = leased.iter().map(|j| j.id.clone()).collect();
    assert_eq!(ids, vec![first.id, second.id]);
    assert_eq!(store.get(&later.id).await.unwrap().status, JobStatus::Pending);
}

/// C3. Only the lease holder can complete, and only once
pub async fn only_lease_holder_can_complete(store: Arc<dyn JobStore>) {
    store.enqueue(reminder("c3")).await.unwrap();
    let job = store.lease_due_jobs(Utc::now(), 1).await.unwrap().remove(0);
    let token = job.lock_token.clone().unwrap();

    let stranger = store.complete(&job.id, &LockToken::new()).await;
    assert!(matches!(stranger, Err(QueueError::LeaseExpired)));

    assert_eq!(store.complete(&job.id, &token).await.unwrap(), JobStatus::Delivered);

    let again = store.complete(&job.id, &token).await;
    assert!(matches!(again, Err(QueueError::LeaseExpired)));

    let stored = store.get(&job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Delivered);
    assert_eq!(stored.attempts, 1);
    assert!(stored.lock_token.is_none());
}

/// C4. A retryable failure returns the job to pending after a backoff
pub async fn retryable_failure_backs_off(store: Arc<dyn JobStore>) {
    store.enqueue(reminder("c4")).await.unwrap();
    let job = store.lease_due_jobs(Utc::now(), 1).await.unwrap().remove(0);
    let before = Utc::now();

    let status = store
        .fail(&job.id, job.lock_token.as_ref().unwrap(), &JobError::retryable("smtp down"))
        .await
        .unwrap();

    assert_eq!(status, JobStatus::Pending);
    let stored = store.get(&job.id).await.unwrap();
    assert_eq!(stored.attempts, 1);
    assert_eq!(stored.last_error.as_deref(), Some("smtp down"));
    // base 1s * 2^1
    assert!(stored.scheduled_at > before + ChronoDuration::seconds(1));
    assert!(stored.scheduled_at <= Utc::now() + ChronoDuration::seconds(2));
    assert!(store.lease_due_jobs(Utc::now(), 1).await.unwrap().is_empty());
}

/// C5. The last allowed attempt failing is terminal
pub async fn exhausted_attempts_fail(store: Arc<dyn JobStore>) {
    let job = store.enqueue(reminder("c5").with_max_attempts(2)).await.unwrap();

    for (round, expected) in [(0, JobStatus::Pending), (1, JobStatus::Failed)] {
        let lease_at = Utc::now() + ChronoDuration::minutes(5 * round);
        let leased = store.lease_due_jobs(lease_at, 1).await.unwrap().remove(0);
        let status = store
            .fail(&job.id, leased.lock_token.as_ref().unwrap(), &JobError::retryable("nope"))
            .await
            .unwrap();
        assert_eq!(status, expected);
    }

    let stored = store.get(&job.id).await.unwrap();
    assert_eq!(stored.attempts, 2);
    assert!(store.lease_due_jobs(at(86_400), 10).await.unwrap().is_empty());
}

/// C6. A permanent failure skips the remaining attempts
pub async fn permanent_failure_is_terminal(store: Arc<dyn JobStore>) {
    store.enqueue(reminder("c6")).await.unwrap();
    let job = store.lease_due_jobs(Utc::now(), 1).await.unwrap().remove(0);

    let status = store
        .fail(&job.id, job.lock_token.as_ref().unwrap(), &JobError::permanent("no such booking"))
        .await
        .unwrap();

    assert_eq!(status, JobStatus::Failed);
    assert_eq!(store.get(&job.id).await.unwrap().attempts, 1);
}

/// C7. Re-enqueueing a pending key replaces it in place
pub async fn reschedule_replaces_pending(store: Arc<dyn JobStore>) {
    let original = store.enqueue(reminder("c7").run_at(at(600))).await.unwrap();
    let moved_to = at(1200);

    let replaced = store
        .enqueue(NewJob::new("reminder", json!({ "booking": "c7", "v": 2 })).with_dedupe_key("c7").run_at(moved_to))
        .await
        .unwrap();

    assert_eq!(replaced.id, original.id);
    assert_eq!(replaced.revision, 1);
    assert_ne!(replaced.idempotency_key(), original.idempotency_key());

    let stored = store.get(&original.id).await.unwrap();
    assert_eq!(stored.scheduled_at, moved_to);
    assert_eq!(stored.payload["v"], 2);
    assert_eq!(store.list(None, 10).await.unwrap().len(), 1);
}

/// C8. Rescheduling an in-flight job takes effect when the attempt resolves
pub async fn reschedule_in_flight_is_deferred(store: Arc<dyn JobStore>) {
    store.enqueue(reminder("c8")).await.unwrap();
    let leased = store.lease_due_jobs(Utc::now(), 1).await.unwrap().remove(0);
    let moved_to = at(3600);

    let updated = store.enqueue(reminder("c8").run_at(moved_to)).await.unwrap();
    assert_eq!(updated.id, leased.id);
    assert_eq!(updated.status, JobStatus::InFlight);

    // The old attempt completes, but the job goes back to pending for the new time
    let status = store.complete(&leased.id, leased.lock_token.as_ref().unwrap()).await.unwrap();

    assert_eq!(status, JobStatus::Pending);
    let stored = store.get(&leased.id).await.unwrap();
    assert_eq!(stored.attempts, 0);
    assert_eq!(stored.scheduled_at, moved_to);
    assert_eq!(stored.revision, 1);
    assert!(stored.deferred.is_none());
}

/// C9. The reject policy refuses a second live job for a key
pub async fn reject_policy_refuses_duplicates(store: Arc<dyn JobStore>) {
    store.enqueue(reminder("c9")).await.unwrap();

    let duplicate = store.enqueue(reminder("c9").run_at(at(60))).await;

    assert!(matches!(duplicate, Err(QueueError::DuplicateJob(key)) if key == "c9"));
}

/// C10. Cancel: pending is immediate, in-flight is deferred, unknown is a no-op
pub async fn cancel_pending_and_in_flight(store: Arc<dyn JobStore>) {
    let pending = store.enqueue(reminder("pending").run_at(at(600))).await.unwrap();
    store.enqueue(reminder("running")).await.unwrap();
    let running = store.lease_due_jobs(Utc::now(), 1).await.unwrap().remove(0);

    assert!(store.cancel("pending").await.unwrap());
    assert_eq!(store.get(&pending.id).await.unwrap().status, JobStatus::Cancelled);

    assert!(!store.cancel("running").await.unwrap());
    assert_eq!(store.get(&running.id).await.unwrap().status, JobStatus::InFlight);

    assert!(!store.cancel("missing").await.unwrap());

    // The attempt fails retryably, but the cancel wins
    let status = store
        .fail(&running.id, running.lock_token.as_ref().unwrap(), &JobError::retryable("boom"))
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Cancelled);
}

/// C11. A terminal job frees its dedupe key
pub async fn terminal_job_frees_dedupe_key(store: Arc<dyn JobStore>) {
    let first = store.enqueue(reminder("c11")).await.unwrap();
    assert!(store.cancel("c11").await.unwrap());

    let second = store.enqueue(reminder("c11")).await.unwrap();

    assert_ne!(first.id, second.id);
    let found = store.find_by_dedupe_key("c11").await.unwrap().unwrap();
    assert_eq!(found.id, second.id);
    assert!(store.find_by_dedupe_key("nobody").await.unwrap().is_none());
}

/// C12. An expired lease is reclaimed and the stale holder is locked out
pub async fn expired_lease_is_reclaimed(store: Arc<dyn JobStore>) {
    // Leasing in the past yields a lease that has already run out
    let job = store.enqueue(reminder("c12").run_at(at(-7200))).await.unwrap();
    let leased = store.lease_due_jobs(at(-3600), 1).await.unwrap().remove(0);

    let reclaimed = store.reclaim_expired_leases(Utc::now()).await.unwrap();

    assert_eq!(reclaimed, 1);
    let stored = store.get(&job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.attempts, 1);

    let late = store.complete(&job.id, leased.lock_token.as_ref().unwrap()).await;
    assert!(matches!(late, Err(QueueError::LeaseExpired)));

    // The job is leasable again right away
    assert_eq!(store.lease_due_jobs(Utc::now(), 1).await.unwrap().len(), 1);
}

/// C13. Reclaiming the last allowed attempt fails the job
pub async fn reclaim_exhausts_attempts(store: Arc<dyn JobStore>) {
    let job = store
        .enqueue(reminder("c13").with_max_attempts(1).run_at(at(-7200)))
        .await
        .unwrap();
    store.lease_due_jobs(at(-3600), 1).await.unwrap();

    assert_eq!(store.reclaim_expired_leases(Utc::now()).await.unwrap(), 1);

    let stored = store.get(&job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.last_error.as_deref(), Some("lease expired"));
}

/// C14. Live leases are left alone by the reaper
pub async fn live_lease_survives_reclaim(store: Arc<dyn JobStore>) {
    store.enqueue(reminder("c14")).await.unwrap();
    let leased = store.lease_due_jobs(Utc::now(), 1).await.unwrap().remove(0);

    assert_eq!(store.reclaim_expired_leases(Utc::now()).await.unwrap(), 0);
    assert_eq!(store.get(&leased.id).await.unwrap().status, JobStatus::InFlight);
}

/// C15. Concurrent lease calls never hand out the same job twice
pub async fn concurrent_leases_are_disjoint(store: Arc<dyn JobStore>) {
    for i in 0..40 {
        store.enqueue(NewJob::new("reminder", json!({ "n": i }))).await.unwrap();
    }

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let store = store.clone();
        tasks.spawn(async move {
            let mut mine = Vec::new();
            loop {
                let batch = store.lease_due_jobs(Utc::now(), 3).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                mine.extend(batch.into_iter().map(|j| j.id));
            }
            mine
        });
    }

    let mut seen = HashSet::new();
    while let Some(result) = tasks.join_next().await {
        for id in result.unwrap() {
            assert!(seen.insert(id.clone()), "job {} leased twice", id);
        }
    }
    assert_eq!(seen.len(), 40);
}

/// C16. Unknown ids are reported as not found
pub async fn unknown_job_is_not_found(store: Arc<dyn JobStore>) {
    let ghost = booking_jobs::JobId::new();

    assert!(matches!(store.get(&ghost).await, Err(QueueError::NotFound(_))));
    assert!(matches!(
        store.complete(&ghost, &LockToken::new()).await,
        Err(QueueError::NotFound(_))
    ));
    assert!(matches!(store.cancel_job(&ghost).await, Err(QueueError::NotFound(_))));
}

/// C17. Purge removes old terminal jobs only
pub async fn purge_keeps_live_jobs(store: Arc<dyn JobStore>) {
    store.enqueue(reminder("keep").run_at(at(600))).await.unwrap();
    store.enqueue(reminder("drop")).await.unwrap();
    assert!(store.cancel("drop").await.unwrap());

    assert_eq!(store.purge_terminal(at(-60)).await.unwrap(), 0);
    assert_eq!(store.purge_terminal(at(60)).await.unwrap(), 1);

    let left = store.list(None, 10).await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].dedupe_key.as_deref(), Some("keep"));
    assert_eq!(store.list(Some(JobStatus::Cancelled), 10).await.unwrap().len(), 0);
}

/// C18. Lifecycle events are published
pub async fn lifecycle_events_are_published(store: Arc<dyn JobStore>) {
    let mut events = store.events();

    let job = store.enqueue(reminder("c18")).await.unwrap();
    let leased = store.lease_due_jobs(Utc::now(), 1).await.unwrap().remove(0);
    store.complete(&job.id, leased.lock_token.as_ref().unwrap()).await.unwrap();

    let mut names = Vec::new();
    for _ in 0..3 {
        let event: JobEvent = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .expect("Timeout waiting for event")
            .expect("Stream ended");
        assert_eq!(event.job_id(), &job.id);
        names.push(event.event_name());
    }
    assert_eq!(names, vec!["enqueued", "leased", "delivered"]);
}

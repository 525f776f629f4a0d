use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::{
    config::StoreOptions,
    error::{JobError, QueueError, QueueResult},
    store::{event_stream, BoxStream, JobStore},
    types::{DedupePolicy, Job, JobEvent, JobId, JobStatus, LockToken, NewJob, Outcome, Superseded},
};

/// In-memory store for tests and single-process development.
///
/// Each job lives in its own `DashMap` entry, so leasing and acknowledging
/// different jobs never contend on one lock. Lock order is always dedupe
/// index first, then job entry.
#[derive(Clone)]
pub struct MemoryStore {
    jobs: Arc<DashMap<JobId, Job>>,
    /// dedupe key -> latest job that used it
    dedupe: Arc<DashMap<String, JobId>>,
    options: StoreOptions,
    events: broadcast::Sender<JobEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_options(StoreOptions::default())
    }

    pub fn with_options(options: StoreOptions) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            jobs: Arc::new(DashMap::new()),
            dedupe: Arc::new(DashMap::new()),
            options,
            events,
        }
    }

    fn publish(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }

    fn insert(&self, new: NewJob, now: DateTime<Utc>) -> Job {
        let job = Job::from_new(new, self.options.max_attempts, now);
        self.jobs.insert(job.id.clone(), job.clone());
        self.publish(JobEvent::Enqueued {
            job_id: job.id.clone(),
            kind: job.kind.clone(),
            scheduled_at: job.scheduled_at,
            at: now,
        });
        job
    }

    /// Apply a duplicate enqueue to the job currently holding the key.
    /// `None` means the slot is free for a new job.
    fn supersede_existing(&self, key: &str, id: &JobId, new: &NewJob, now: DateTime<Utc>) -> QueueResult<Option<Job>> {
        let Some(mut existing) = self.jobs.get_mut(id) else {
            return Ok(None);
        };
        if existing.status.is_terminal() {
            return Ok(None);
        }
        if self.options.dedupe_policy == DedupePolicy::Reject {
            return Err(QueueError::DuplicateJob(key.to_string()));
        }

        let superseded = existing.supersede(new, self.options.max_attempts, now);
        let job = existing.value().clone();
        drop(existing);

        if superseded == Superseded::Deferred {
            debug!(job_id = %job.id, "job in flight; reschedule applies when the attempt resolves");
        }
        self.publish(JobEvent::Rescheduled {
            job_id: job.id.clone(),
            scheduled_at: job.scheduled_at,
            revision: job.revision,
            at: now,
        });
        Ok(Some(job))
    }

    fn resolve(&self, id: &JobId, token: &LockToken, outcome: Outcome<'_>) -> QueueResult<JobStatus> {
        let now = Utc::now();
        let mut job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        if !job.owns_lease(token, now) {
            return Err(QueueError::LeaseExpired);
        }

        let status = job.resolve(outcome, &self.options.backoff, now);
        let event = JobEvent::for_resolution(&job);
        drop(job);

        self.publish(event);
        Ok(status)
    }

    fn cancel_entry(&self, id: &JobId) -> bool {
        let now = Utc::now();
        let Some(mut job) = self.jobs.get_mut(id) else {
            return false;
        };
        let was_in_flight = job.status == JobStatus::InFlight;
        let cancelled = job.request_cancel(now);
        let job_id = job.id.clone();
        drop(job);

        if cancelled {
            self.publish(JobEvent::Cancelled { job_id, at: now });
        } else if was_in_flight {
            self.publish(JobEvent::CancelDeferred { job_id, at: now });
        }
        cancelled
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn enqueue(&self, new: NewJob) -> QueueResult<Job> {
        let now = Utc::now();
        let Some(key) = new.dedupe_key.clone() else {
            return Ok(self.insert(new, now));
        };

        // The entry guard serializes concurrent enqueues for one key.
        match self.dedupe.entry(key) {
            Entry::Occupied(mut slot) => {
                let existing = slot.get().clone();
                if let Some(job) = self.supersede_existing(slot.key(), &existing, &new, now)? {
                    return Ok(job);
                }
                let job = self.insert(new, now);
                slot.insert(job.id.clone());
                Ok(job)
            }
            Entry::Vacant(slot) => {
                let job = self.insert(new, now);
                slot.insert(job.id.clone());
                Ok(job)
            }
        }
    }

    async fn cancel(&self, dedupe_key: &str) -> QueueResult<bool> {
        let Some(id) = self.dedupe.get(dedupe_key).map(|id| id.value().clone()) else {
            return Ok(false);
        };
        Ok(self.cancel_entry(&id))
    }

    async fn cancel_job(&self, id: &JobId) -> QueueResult<bool> {
        if !self.jobs.contains_key(id) {
            return Err(QueueError::NotFound(id.to_string()));
        }
        Ok(self.cancel_entry(id))
    }

    async fn lease_due_jobs(&self, now: DateTime<Utc>, limit: usize) -> QueueResult<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut candidates: Vec<(DateTime<Utc>, JobId)> = self
            .jobs
            .iter()
            .filter(|entry| entry.is_leasable(now))
            .map(|entry| (entry.scheduled_at, entry.id.clone()))
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        let locked_until = now + self.options.lease_length();
        let mut leased = Vec::with_capacity(limit.min(candidates.len()));

        for (_, id) in candidates {
            if leased.len() == limit {
                break;
            }
            let Some(mut job) = self.jobs.get_mut(&id) else {
                continue;
            };
            // Compare-and-swap: another caller may have leased or cancelled it.
            if !job.is_leasable(now) {
                continue;
            }
            job.lease(LockToken::new(), locked_until, now);
            leased.push(job.value().clone());
        }

        for job in &leased {
            self.publish(JobEvent::Leased {
                job_id: job.id.clone(),
                locked_until,
                at: now,
            });
        }
        Ok(leased)
    }

    async fn complete(&self, id: &JobId, token: &LockToken) -> QueueResult<JobStatus> {
        self.resolve(id, token, Outcome::Delivered)
    }

    async fn fail(&self, id: &JobId, token: &LockToken, error: &JobError) -> QueueResult<JobStatus> {
        self.resolve(id, token, Outcome::Failed(error))
    }

    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> QueueResult<usize> {
        let expired: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|entry| entry.lease_expired(now))
            .map(|entry| entry.id.clone())
            .collect();

        let mut reclaimed = 0;
        for id in expired {
            let Some(mut job) = self.jobs.get_mut(&id) else {
                continue;
            };
            if !job.lease_expired(now) {
                continue;
            }
            job.resolve(Outcome::LeaseLost, &self.options.backoff, now);
            let attempts = job.attempts;
            let event = JobEvent::for_resolution(&job);
            drop(job);

            debug!(job_id = %id, attempts, "reclaimed expired lease");
            self.publish(JobEvent::Reclaimed { job_id: id, attempts, at: now });
            self.publish(event);
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    async fn get(&self, id: &JobId) -> QueueResult<Job> {
        self.jobs
            .get(id)
            .map(|job| job.value().clone())
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    async fn find_by_dedupe_key(&self, dedupe_key: &str) -> QueueResult<Option<Job>> {
        let Some(id) = self.dedupe.get(dedupe_key).map(|id| id.value().clone()) else {
            return Ok(None);
        };
        Ok(self.jobs.get(&id).map(|job| job.value().clone()))
    }

    async fn list(&self, status: Option<JobStatus>, limit: usize) -> QueueResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|entry| status.map_or(true, |s| entry.status == s))
            .map(|entry| entry.value().clone())
            .collect();
        jobs.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at).then(a.created_at.cmp(&b.created_at)));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn purge_terminal(&self, before: DateTime<Utc>) -> QueueResult<u64> {
        let mut purged = 0u64;
        self.jobs.retain(|_, job| {
            let stale = job.status.is_terminal() && job.updated_at < before;
            if stale {
                purged += 1;
            }
            !stale
        });
        self.dedupe.retain(|_, id| self.jobs.contains_key(&*id));
        Ok(purged)
    }

    fn events(&self) -> BoxStream<JobEvent> {
        event_stream(&self.events)
    }
}

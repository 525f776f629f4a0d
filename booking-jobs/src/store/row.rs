use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Database, Encode, Type};
use tracing::debug;

use crate::config::StoreOptions;
use crate::error::{QueueError, QueueResult};
use crate::types::{DedupePolicy, Job, JobEvent, JobId, JobStatus, LockToken, NewJob, Outcome};

/// Column layout shared by the SQL stores
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct JobRow {
    pub id: String,
    pub kind: String,
    pub payload: Json<Value>,
    pub dedupe_key: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub status: String,
    pub attempts: i64,
    pub max_attempts: i64,
    pub last_error: Option<String>,
    pub lock_token: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub deferred: Option<String>,
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> QueueResult<Self> {
        Ok(Job {
            id: JobId(row.id),
            kind: row.kind,
            payload: row.payload.0,
            dedupe_key: row.dedupe_key,
            scheduled_at: row.scheduled_at,
            status: row.status.parse()?,
            attempts: counter(row.attempts, "attempts")?,
            max_attempts: counter(row.max_attempts, "max_attempts")?,
            last_error: row.last_error,
            lock_token: row.lock_token.map(LockToken),
            locked_until: row.locked_until,
            deferred: row.deferred.as_deref().map(str::parse).transpose()?,
            revision: counter(row.revision, "revision")?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub(crate) fn into_jobs(rows: Vec<JobRow>) -> QueueResult<Vec<Job>> {
    rows.into_iter().map(Job::try_from).collect()
}

fn counter(value: i64, column: &str) -> QueueResult<u32> {
    u32::try_from(value).map_err(|_| QueueError::Serialization(format!("{} out of range: {}", column, value)))
}

/// Retries allowed when a concurrent writer wins the race for a row or dedupe key
pub(crate) const CAS_RETRIES: usize = 5;

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Dialect-specific row access the SQL stores provide; everything else
/// about their state transitions lives in the helpers below.
#[async_trait::async_trait]
pub(crate) trait CasRows: Send + Sync {
    fn options(&self) -> &StoreOptions;

    fn publish(&self, event: JobEvent);

    async fn fetch(&self, id: &JobId) -> QueueResult<Option<Job>>;

    /// Write `next` only if the row still matches `current`; false means a
    /// concurrent writer got there first.
    async fn swap(&self, current: &Job, next: &Job) -> QueueResult<bool>;

    async fn insert(&self, job: &Job) -> Result<(), sqlx::Error>;

    /// The pending or in-flight job holding `dedupe_key`
    async fn live_by_key(&self, dedupe_key: &str) -> QueueResult<Option<Job>>;

    /// In-flight jobs whose lease ran out before `now`
    async fn expired_lease_ids(&self, now: DateTime<Utc>) -> QueueResult<Vec<JobId>>;
}

type Args<'q, DB> = <DB as Database>::Arguments<'q>;

/// Bind all fifteen columns in table order, for `INSERT`
pub(crate) fn bind_insert<'q, DB>(query: Query<'q, DB, Args<'q, DB>>, job: &'q Job) -> Query<'q, DB, Args<'q, DB>>
where
    DB: Database,
    &'q str: Encode<'q, DB> + Type<DB>,
    i64: Encode<'q, DB> + Type<DB>,
    DateTime<Utc>: Encode<'q, DB> + Type<DB>,
    Json<&'q Value>: Encode<'q, DB> + Type<DB>,
    Option<&'q str>: Encode<'q, DB> + Type<DB>,
    Option<DateTime<Utc>>: Encode<'q, DB> + Type<DB>,
{
    query
        .bind(job.id.as_str())
        .bind(job.kind.as_str())
        .bind(Json(&job.payload))
        .bind(job.dedupe_key.as_deref())
        .bind(job.scheduled_at)
        .bind(job.status.as_str())
        .bind(i64::from(job.attempts))
        .bind(i64::from(job.max_attempts))
        .bind(job.last_error.as_deref())
        .bind(job.lock_token.as_ref().map(LockToken::as_str))
        .bind(job.locked_until)
        .bind(job.deferred.map(|d| d.as_str()))
        .bind(i64::from(job.revision))
        .bind(job.created_at)
        .bind(job.updated_at)
}

/// Bind the twelve mutable columns of `next`, then the five columns of
/// `current` the swap is conditional on
pub(crate) fn bind_swap<'q, DB>(
    query: Query<'q, DB, Args<'q, DB>>,
    current: &'q Job,
    next: &'q Job,
) -> Query<'q, DB, Args<'q, DB>>
where
    DB: Database,
    &'q str: Encode<'q, DB> + Type<DB>,
    i64: Encode<'q, DB> + Type<DB>,
    DateTime<Utc>: Encode<'q, DB> + Type<DB>,
    Json<&'q Value>: Encode<'q, DB> + Type<DB>,
    Option<&'q str>: Encode<'q, DB> + Type<DB>,
    Option<DateTime<Utc>>: Encode<'q, DB> + Type<DB>,
{
    query
        .bind(next.kind.as_str())
        .bind(Json(&next.payload))
        .bind(next.scheduled_at)
        .bind(next.status.as_str())
        .bind(i64::from(next.attempts))
        .bind(i64::from(next.max_attempts))
        .bind(next.last_error.as_deref())
        .bind(next.lock_token.as_ref().map(LockToken::as_str))
        .bind(next.locked_until)
        .bind(next.deferred.map(|d| d.as_str()))
        .bind(i64::from(next.revision))
        .bind(next.updated_at)
        .bind(current.id.as_str())
        .bind(current.status.as_str())
        .bind(i64::from(current.revision))
        .bind(current.lock_token.as_ref().map(LockToken::as_str))
        .bind(current.deferred.map(|d| d.as_str()))
}

/// Read-modify-write loop over one row. `apply` runs against the freshest
/// copy on every attempt; a rejected swap re-reads and re-applies.
pub(crate) async fn mutate<S, T, F>(store: &S, id: &JobId, mut apply: F) -> QueueResult<(Job, T)>
where
    S: CasRows + ?Sized,
    F: FnMut(&mut Job) -> QueueResult<T> + Send,
    T: Send,
{
    for _ in 0..CAS_RETRIES {
        let current = store
            .fetch(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        let mut next = current.clone();
        let outcome = apply(&mut next)?;

        if next == current || store.swap(&current, &next).await? {
            return Ok((next, outcome));
        }
    }
    Err(QueueError::Internal(format!("job {} kept changing under concurrent writers", id)))
}

fn enqueued(job: &Job, now: DateTime<Utc>) -> JobEvent {
    JobEvent::Enqueued {
        job_id: job.id.clone(),
        kind: job.kind.clone(),
        scheduled_at: job.scheduled_at,
        at: now,
    }
}

/// Insert, or supersede the live job holding the same dedupe key. The
/// partial unique index turns a lost insert race into a retry.
pub(crate) async fn enqueue<S>(store: &S, new: NewJob) -> QueueResult<Job>
where
    S: CasRows + ?Sized,
{
    let now = Utc::now();
    let options = store.options();
    let Some(key) = new.dedupe_key.clone() else {
        let job = Job::from_new(new, options.max_attempts, now);
        store.insert(&job).await?;
        store.publish(enqueued(&job, now));
        return Ok(job);
    };

    for _ in 0..CAS_RETRIES {
        match store.live_by_key(&key).await? {
            Some(current) => {
                if options.dedupe_policy == DedupePolicy::Reject {
                    return Err(QueueError::DuplicateJob(key));
                }
                let mut next = current.clone();
                next.supersede(&new, options.max_attempts, now);
                if store.swap(&current, &next).await? {
                    store.publish(JobEvent::Rescheduled {
                        job_id: next.id.clone(),
                        scheduled_at: next.scheduled_at,
                        revision: next.revision,
                        at: now,
                    });
                    return Ok(next);
                }
            }
            None => {
                let job = Job::from_new(new.clone(), options.max_attempts, now);
                match store.insert(&job).await {
                    Ok(()) => {
                        store.publish(enqueued(&job, now));
                        return Ok(job);
                    }
                    Err(err) if is_unique_violation(&err) => {
                        debug!(dedupe_key = %key, "lost insert race for dedupe key; retrying");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
    }
    Err(QueueError::Internal(format!("enqueue for dedupe key {} kept losing races", key)))
}

/// Apply a worker's outcome, provided its lease is still live
pub(crate) async fn resolve<S>(store: &S, id: &JobId, token: &LockToken, outcome: Outcome<'_>) -> QueueResult<JobStatus>
where
    S: CasRows + ?Sized,
{
    let now = Utc::now();
    let backoff = store.options().backoff;
    let (job, status) = mutate(store, id, |job| {
        if !job.owns_lease(token, now) {
            return Err(QueueError::LeaseExpired);
        }
        Ok(job.resolve(outcome, &backoff, now))
    })
    .await?;

    store.publish(JobEvent::for_resolution(&job));
    Ok(status)
}

pub(crate) async fn cancel_by_id<S>(store: &S, id: &JobId) -> QueueResult<bool>
where
    S: CasRows + ?Sized,
{
    let now = Utc::now();
    let (job, (cancelled, deferred)) = mutate(store, id, |job| {
        let in_flight = job.status == JobStatus::InFlight;
        Ok((job.request_cancel(now), in_flight))
    })
    .await?;

    if cancelled {
        store.publish(JobEvent::Cancelled { job_id: job.id, at: now });
    } else if deferred {
        store.publish(JobEvent::CancelDeferred { job_id: job.id, at: now });
    }
    Ok(cancelled)
}

pub(crate) async fn cancel_by_key<S>(store: &S, dedupe_key: &str) -> QueueResult<bool>
where
    S: CasRows + ?Sized,
{
    match store.live_by_key(dedupe_key).await? {
        Some(job) => cancel_by_id(store, &job.id).await,
        None => Ok(false),
    }
}

/// Take back every expired lease. Each row is re-checked under CAS, so a
/// worker that reports back in the meantime keeps its job.
pub(crate) async fn reclaim_expired<S>(store: &S, now: DateTime<Utc>) -> QueueResult<usize>
where
    S: CasRows + ?Sized,
{
    let backoff = store.options().backoff;
    let mut reclaimed = 0;
    for id in store.expired_lease_ids(now).await? {
        let (job, taken) = mutate(store, &id, |job| {
            if !job.lease_expired(now) {
                return Ok(false);
            }
            job.resolve(Outcome::LeaseLost, &backoff, now);
            Ok(true)
        })
        .await?;

        if taken {
            debug!(job_id = %id, attempts = job.attempts, "reclaimed expired lease");
            store.publish(JobEvent::Reclaimed {
                job_id: id,
                attempts: job.attempts,
                at: now,
            });
            store.publish(JobEvent::for_resolution(&job));
            reclaimed += 1;
        }
    }
    Ok(reclaimed)
}

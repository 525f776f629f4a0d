use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

use super::row::{self, bind_insert, bind_swap, into_jobs, CasRows, JobRow};
use crate::{
    config::StoreOptions,
    error::{JobError, QueueError, QueueResult},
    store::{event_stream, BoxStream, JobStore},
    types::{Job, JobEvent, JobId, JobStatus, LockToken, NewJob, Outcome},
};

const INSERT: &str = "INSERT INTO jobs (id, kind, payload, dedupe_key, scheduled_at, status, attempts, max_attempts, \
     last_error, lock_token, locked_until, deferred, revision, created_at, updated_at) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)";

const SWAP: &str = "UPDATE jobs SET kind = $1, payload = $2, scheduled_at = $3, status = $4, attempts = $5, \
     max_attempts = $6, last_error = $7, lock_token = $8, locked_until = $9, deferred = $10, \
     revision = $11, updated_at = $12 \
     WHERE id = $13 AND status = $14 AND revision = $15 \
     AND lock_token IS NOT DISTINCT FROM $16 AND deferred IS NOT DISTINCT FROM $17";

/// PostgreSQL-backed job store.
///
/// Leasing locks candidate rows with `FOR UPDATE SKIP LOCKED`, so any number
/// of dispatchers can poll the same table without claiming a job twice.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    options: StoreOptions,
    events: broadcast::Sender<JobEvent>,
}

impl PostgresStore {
    /// Connect to `url` and run migrations
    pub async fn connect(url: &str, options: StoreOptions) -> QueueResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await?;

        let store = Self::new(pool, options);
        store.migrate().await?;
        info!("postgres job store ready");
        Ok(store)
    }

    pub fn new(pool: PgPool, options: StoreOptions) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self { pool, options, events }
    }

    pub async fn migrate(&self) -> QueueResult<()> {
        let mut migrator = sqlx::migrate!("./migrations/postgres");
        // Applications may record their own migrations in the same database
        migrator.set_ignore_missing(true);
        migrator.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CasRows for PostgresStore {
    fn options(&self) -> &StoreOptions {
        &self.options
    }

    fn publish(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }

    async fn fetch(&self, id: &JobId) -> QueueResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    async fn swap(&self, current: &Job, next: &Job) -> QueueResult<bool> {
        let result = bind_swap(sqlx::query(SWAP), current, next).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert(&self, job: &Job) -> Result<(), sqlx::Error> {
        bind_insert(sqlx::query(INSERT), job).execute(&self.pool).await?;
        Ok(())
    }

    async fn live_by_key(&self, dedupe_key: &str) -> QueueResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE dedupe_key = $1 AND status IN ('pending', 'in_flight')",
        )
        .bind(dedupe_key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Job::try_from).transpose()
    }

    async fn expired_lease_ids(&self, now: DateTime<Utc>) -> QueueResult<Vec<JobId>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM jobs WHERE status = 'in_flight' AND (locked_until IS NULL OR locked_until < $1)",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(JobId).collect())
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn enqueue(&self, new: NewJob) -> QueueResult<Job> {
        row::enqueue(self, new).await
    }

    async fn cancel(&self, dedupe_key: &str) -> QueueResult<bool> {
        row::cancel_by_key(self, dedupe_key).await
    }

    async fn cancel_job(&self, id: &JobId) -> QueueResult<bool> {
        row::cancel_by_id(self, id).await
    }

    async fn lease_due_jobs(&self, now: DateTime<Utc>, limit: usize) -> QueueResult<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let locked_until = now + self.options.lease_length();

        let rows = sqlx::query_as::<_, JobRow>(
            "UPDATE jobs \
             SET status = 'in_flight', lock_token = replace(gen_random_uuid()::text, '-', ''), \
                 locked_until = $1, updated_at = $2 \
             WHERE id IN ( \
                 SELECT id FROM jobs \
                 WHERE status = 'pending' AND scheduled_at <= $2 AND attempts < max_attempts \
                 ORDER BY scheduled_at \
                 LIMIT $3 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING *",
        )
        .bind(locked_until)
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = into_jobs(rows)?;
        jobs.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at));
        for job in &jobs {
            self.publish(JobEvent::Leased {
                job_id: job.id.clone(),
                locked_until,
                at: now,
            });
        }
        Ok(jobs)
    }

    async fn complete(&self, id: &JobId, token: &LockToken) -> QueueResult<JobStatus> {
        row::resolve(self, id, token, Outcome::Delivered).await
    }

    async fn fail(&self, id: &JobId, token: &LockToken, error: &JobError) -> QueueResult<JobStatus> {
        row::resolve(self, id, token, Outcome::Failed(error)).await
    }

    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> QueueResult<usize> {
        row::reclaim_expired(self, now).await
    }

    async fn get(&self, id: &JobId) -> QueueResult<Job> {
        self.fetch(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    async fn find_by_dedupe_key(&self, dedupe_key: &str) -> QueueResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE dedupe_key = $1 \
             ORDER BY CASE WHEN status IN ('pending', 'in_flight') THEN 0 ELSE 1 END, created_at DESC \
             LIMIT 1",
        )
        .bind(dedupe_key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Job::try_from).transpose()
    }

    async fn list(&self, status: Option<JobStatus>, limit: usize) -> QueueResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE ($1::text IS NULL OR status = $1) ORDER BY scheduled_at, created_at LIMIT $2",
        )
        .bind(status.map(|s| s.as_str()))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        into_jobs(rows)
    }

    async fn purge_terminal(&self, before: DateTime<Utc>) -> QueueResult<u64> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE status IN ('delivered', 'failed', 'cancelled') AND updated_at < $1",
        )
        .bind(before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    fn events(&self) -> BoxStream<JobEvent> {
        event_stream(&self.events)
    }
}

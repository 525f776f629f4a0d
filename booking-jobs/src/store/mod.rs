pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(any(feature = "sqlite", feature = "postgres"))]
mod row;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::pin::Pin;

use crate::{
    error::{JobError, QueueResult},
    types::{Job, JobEvent, JobId, JobStatus, LockToken, NewJob},
};

/// Type alias for boxed streams (stable Rust compatible)
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// Durable record of scheduled jobs.
///
/// Every state change is a conditional update on a single job, so callers
/// never need an in-process lock around store calls.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a pending job, or supersede the non-terminal job holding the
    /// same dedupe key according to the configured [`crate::DedupePolicy`].
    async fn enqueue(&self, job: NewJob) -> QueueResult<Job>;

    /// Cancel the non-terminal job holding `dedupe_key`.
    ///
    /// Returns true when a pending job was cancelled. An in-flight job is
    /// flagged for cancellation once its attempt resolves and false is returned.
    async fn cancel(&self, dedupe_key: &str) -> QueueResult<bool>;

    /// Same as [`JobStore::cancel`], addressed by id
    async fn cancel_job(&self, id: &JobId) -> QueueResult<bool>;

    /// Atomically move up to `limit` due pending jobs to in-flight, each under
    /// a fresh lock token valid until `now + lease_duration`.
    async fn lease_due_jobs(&self, now: DateTime<Utc>, limit: usize) -> QueueResult<Vec<Job>>;

    /// Mark a leased job delivered. Fails with `LeaseExpired` when `token`
    /// no longer holds a live lease.
    async fn complete(&self, id: &JobId, token: &LockToken) -> QueueResult<JobStatus>;

    /// Record a failed attempt; retryable errors back off, permanent errors
    /// and exhausted jobs become failed.
    async fn fail(&self, id: &JobId, token: &LockToken, error: &JobError) -> QueueResult<JobStatus>;

    /// Return in-flight jobs whose lease ran out before `now` to pending,
    /// counting the abandoned attempt.
    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> QueueResult<usize>;

    async fn get(&self, id: &JobId) -> QueueResult<Job>;

    /// The non-terminal job for `dedupe_key`, else its most recent terminal one
    async fn find_by_dedupe_key(&self, dedupe_key: &str) -> QueueResult<Option<Job>>;

    /// Jobs ordered by due time, optionally filtered by status
    async fn list(&self, status: Option<JobStatus>, limit: usize) -> QueueResult<Vec<Job>>;

    /// Delete terminal jobs last touched before `before`
    async fn purge_terminal(&self, before: DateTime<Utc>) -> QueueResult<u64>;

    /// Event stream for observability (boxed for stable Rust)
    fn events(&self) -> BoxStream<JobEvent>;
}

pub(crate) fn event_stream(sender: &tokio::sync::broadcast::Sender<JobEvent>) -> BoxStream<JobEvent> {
    use tokio_stream::{wrappers::BroadcastStream, StreamExt};

    let stream = BroadcastStream::new(sender.subscribe()).filter_map(|result| result.ok());
    Box::pin(stream)
}

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

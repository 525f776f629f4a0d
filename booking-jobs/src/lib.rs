//! # booking-jobs: durable delayed jobs for booking reminders
//!
//! Jobs are persisted with a due time and delivered at-least-once:
//!
//! - **Lease-based delivery**: a dispatcher leases due jobs under a fresh lock
//!   token; only the token holder can complete or fail the attempt, and a
//!   reaper returns jobs whose lease ran out.
//! - **Replace-on-reschedule**: enqueueing under an existing dedupe key
//!   updates the live job instead of creating a second one.
//! - **Deferred cancel**: cancelling an in-flight job takes effect when its
//!   attempt resolves, so it is never retried.
//! - **Pluggable stores**: memory, SQLite and Postgres share one
//!   [`JobStore`] contract.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use booking_jobs::prelude::*;
//! use serde::Deserialize;
//! use std::sync::Arc;
//!
//! #[derive(Deserialize)]
//! struct Ping {
//!     to: String,
//! }
//!
//! struct PingHandler;
//!
//! #[async_trait]
//! impl JobHandler for PingHandler {
//!     type Payload = Ping;
//!     const KIND: &'static str = "ping";
//!
//!     async fn handle(&self, payload: Ping, ctx: &JobContext) -> Result<(), JobError> {
//!         if !ctx.still_wanted().await {
//!             return Ok(());
//!         }
//!         println!("ping {} ({})", payload.to, ctx.idempotency_key());
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> QueueResult<()> {
//! let registry = HandlerRegistry::new().with(PingHandler)?;
//! let queue = JobQueue::new(Arc::new(MemoryStore::new()), registry, QueueConfig::default());
//! let running = queue.start()?;
//!
//! queue
//!     .enqueue(NewJob::new("ping", serde_json::json!({ "to": "ada" })).with_dedupe_key("ping:ada"))
//!     .await?;
//!
//! running.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod pool;
pub mod queue;
pub mod reaper;
pub mod store;
pub mod types;

pub use backoff::RetryBackoff;
pub use config::{QueueConfig, StoreOptions};
pub use dispatcher::{Dispatcher, LoopHandle};
pub use error::{JobError, QueueError, QueueResult};
pub use handler::{HandlerRegistry, JobContext, JobHandler};
pub use pool::{PoolSender, WorkerPool};
pub use queue::{JobQueue, RunningQueue};
pub use reaper::LeaseReaper;
pub use store::{BoxStream, JobStore, MemoryStore};
pub use types::{DedupePolicy, Deferred, Job, JobEvent, JobId, JobStatus, LockToken, NewJob};

#[cfg(feature = "postgres")]
pub use store::PostgresStore;

#[cfg(feature = "sqlite")]
pub use store::SqliteStore;

/// Everything a producer or handler author needs
pub mod prelude {
    pub use crate::{
        DedupePolicy, HandlerRegistry, Job, JobContext, JobError, JobHandler, JobId, JobQueue, JobStatus, JobStore,
        MemoryStore, NewJob, QueueConfig, QueueError, QueueResult, RunningQueue,
    };

    pub use async_trait::async_trait;
}

use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::{
    config::QueueConfig,
    dispatcher::{Dispatcher, LoopHandle},
    error::QueueResult,
    handler::HandlerRegistry,
    pool::WorkerPool,
    reaper::LeaseReaper,
    store::{BoxStream, JobStore},
    types::{Job, JobEvent, JobId, NewJob},
};

/// Entry point for producers and for starting the background machinery.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    config: QueueConfig,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, registry: HandlerRegistry, config: QueueConfig) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            config,
        }
    }

    /// Schedule a job. Kinds with no registered handler are accepted but get
    /// a single attempt, since they can only ever fail permanently.
    #[instrument(skip(self, job), fields(kind = %job.kind, dedupe_key = ?job.dedupe_key))]
    pub async fn enqueue(&self, job: NewJob) -> QueueResult<Job> {
        let job = if self.registry.is_registered(&job.kind) {
            job
        } else {
            warn!("no handler registered for job kind");
            job.with_max_attempts(1)
        };
        let job = self.store.enqueue(job).await?;
        info!(job_id = %job.id, scheduled_at = %job.scheduled_at, revision = job.revision, "job enqueued");
        Ok(job)
    }

    /// Cancel by dedupe key; see [`JobStore::cancel`]
    #[instrument(skip(self))]
    pub async fn cancel(&self, dedupe_key: &str) -> QueueResult<bool> {
        self.store.cancel(dedupe_key).await
    }

    pub async fn get(&self, id: &JobId) -> QueueResult<Job> {
        self.store.get(id).await
    }

    pub async fn find_by_dedupe_key(&self, dedupe_key: &str) -> QueueResult<Option<Job>> {
        self.store.find_by_dedupe_key(dedupe_key).await
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn events(&self) -> BoxStream<JobEvent> {
        self.store.events()
    }

    /// Start the worker pool, dispatcher and lease reaper
    pub fn start(&self) -> QueueResult<RunningQueue> {
        self.config.validate()?;
        let config = &self.config;

        let pool = WorkerPool::start(
            self.store.clone(),
            self.registry.clone(),
            config.max_concurrency,
            config.queue_capacity,
            config.handler_timeout,
        );
        let dispatcher = Dispatcher::new(self.store.clone(), pool.sender(), config.batch_size, config.tick_interval)
            .with_retry_cap(config.store_retry_cap)
            .spawn();
        let reaper = LeaseReaper::with_interval(self.store.clone(), config.reclaim_interval)
            .with_retry_cap(config.store_retry_cap)
            .spawn();

        info!(kinds = ?self.registry.registered_kinds(), "job queue started");
        Ok(RunningQueue { dispatcher, reaper, pool })
    }
}

/// Background tasks of a started [`JobQueue`]
pub struct RunningQueue {
    dispatcher: LoopHandle,
    reaper: LoopHandle,
    pool: WorkerPool,
}

impl RunningQueue {
    /// Stop leasing, then let already-leased jobs finish.
    pub async fn shutdown(self) -> QueueResult<()> {
        self.dispatcher.shutdown().await?;
        self.reaper.shutdown().await?;
        self.pool.shutdown().await?;
        info!("job queue stopped");
        Ok(())
    }
}

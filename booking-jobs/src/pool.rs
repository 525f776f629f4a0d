use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, info_span, warn, Instrument};

use crate::{
    error::{JobError, QueueError, QueueResult},
    handler::{HandlerRegistry, JobContext},
    store::JobStore,
    types::Job,
};

/// Submission side of the worker pool.
///
/// Cloned into the dispatcher; every leased job must go through a slot
/// reserved here, so the pool's bounded queue is the dispatcher's brake.
#[derive(Clone)]
pub struct PoolSender {
    sender: mpsc::Sender<Job>,
    active: Arc<AtomicUsize>,
}

impl PoolSender {
    /// Queue a leased job, waiting for a free slot
    pub async fn submit(&self, job: Job) -> QueueResult<()> {
        self.sender.send(job).await.map_err(|_| QueueError::WorkerShutdown)
    }

    /// Free slots in the work queue
    pub fn capacity(&self) -> usize {
        self.sender.capacity()
    }

    pub fn has_capacity(&self) -> bool {
        self.capacity() > 0
    }

    /// Handlers currently executing
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub(crate) fn raw(&self) -> &mpsc::Sender<Job> {
        &self.sender
    }

    /// Sender with no supervisor behind it; the caller owns the receiver.
    #[cfg(test)]
    pub(crate) fn detached(sender: mpsc::Sender<Job>) -> Self {
        Self {
            sender,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Handle for managing the pool's lifecycle
pub struct WorkerPool {
    sender: PoolSender,
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

impl WorkerPool {
    /// Spawn the pool: a bounded queue of `queue_capacity` jobs drained by at
    /// most `max_concurrency` concurrently running handlers.
    pub fn start(
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        max_concurrency: usize,
        queue_capacity: usize,
        handler_timeout: Duration,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let active = Arc::new(AtomicUsize::new(0));

        let worker = Supervisor {
            store,
            registry,
            running: Arc::new(Semaphore::new(max_concurrency.max(1))),
            active: active.clone(),
            handler_timeout,
            receiver,
            shutdown_rx,
        };
        let join_handle = tokio::spawn(worker.run().in_current_span());
        info!(max_concurrency, queue_capacity, "worker pool started");

        Self {
            sender: PoolSender { sender, active },
            shutdown_tx,
            join_handle,
        }
    }

    pub fn sender(&self) -> PoolSender {
        self.sender.clone()
    }

    /// Stop accepting jobs, run whatever is already queued, and wait for
    /// running handlers to finish.
    pub async fn shutdown(self) -> QueueResult<()> {
        let _ = self.shutdown_tx.send(());
        self.join_handle
            .await
            .map_err(|e| QueueError::Internal(format!("Worker pool join error: {}", e)))
    }
}

struct Supervisor {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    running: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    handler_timeout: Duration,
    receiver: mpsc::Receiver<Job>,
    shutdown_rx: oneshot::Receiver<()>,
}

impl Supervisor {
    async fn run(mut self) {
        let mut tasks = JoinSet::new();

        loop {
            // Waiting for a permit before receiving leaves jobs in the queue,
            // which is what the dispatcher's capacity check observes.
            let permit = tokio::select! {
                _ = &mut self.shutdown_rx => break,
                permit = self.running.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let job = tokio::select! {
                _ = &mut self.shutdown_rx => break,
                job = self.receiver.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            self.spawn_job(&mut tasks, job, permit);

            while let Some(Ok(())) = tasks.try_join_next() {}
        }

        // Anything already queued is leased; run it rather than leave it to reclaim.
        self.receiver.close();
        while let Some(job) = self.receiver.recv().await {
            match self.running.clone().acquire_owned().await {
                Ok(permit) => self.spawn_job(&mut tasks, job, permit),
                Err(_) => break,
            }
        }
        while tasks.join_next().await.is_some() {}
        info!("worker pool stopped");
    }

    fn spawn_job(&self, tasks: &mut JoinSet<()>, job: Job, permit: OwnedSemaphorePermit) {
        let store = self.store.clone();
        let registry = self.registry.clone();
        let active = self.active.clone();
        let timeout = self.handler_timeout;
        active.fetch_add(1, Ordering::Relaxed);
        let task = async move {
            execute(store, registry, job, timeout).await;
            active.fetch_sub(1, Ordering::Relaxed);
            drop(permit);
        };
        tasks.spawn(task.in_current_span());
    }
}

/// Run one leased job and record its outcome in the store.
async fn execute(store: Arc<dyn JobStore>, registry: Arc<HandlerRegistry>, job: Job, timeout: Duration) {
    let span = info_span!("job", job_id = %job.id, kind = %job.kind, attempt = job.attempts + 1);

    async move {
        let Some(token) = job.lock_token.clone() else {
            error!("job handed to the pool without a lock token");
            return;
        };
        let id = job.id.clone();
        let ctx = JobContext::new(job, token.clone(), store.clone());

        // Own task so a panicking handler surfaces as a JoinError.
        let mut handle = tokio::spawn(async move { registry.dispatch(&ctx).await }.in_current_span());
        let outcome = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) if join_err.is_panic() => Err(JobError::retryable("handler panicked")),
            Ok(Err(join_err)) => Err(JobError::retryable(format!("handler aborted: {}", join_err))),
            Err(_) => {
                handle.abort();
                Err(JobError::retryable(format!("handler timed out after {:?}", timeout)))
            }
        };

        let recorded = match &outcome {
            Ok(()) => store.complete(&id, &token).await,
            Err(err) => store.fail(&id, &token, err).await,
        };

        match (recorded, outcome) {
            (Ok(status), Ok(())) => info!(%status, "job finished"),
            (Ok(status), Err(err)) => warn!(%status, error = %err, "job attempt failed"),
            (Err(QueueError::LeaseExpired), _) => {
                warn!("lease expired before the outcome was recorded; job was reassigned")
            }
            (Err(err), _) => {
                error!(error = %err, "could not record job outcome; lease reclaim will recover it")
            }
        }
    }
    .instrument(span)
    .await
}

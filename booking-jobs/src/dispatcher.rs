use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc::error::TrySendError, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::{
    error::{QueueError, QueueResult},
    pool::PoolSender,
    store::JobStore,
};

/// Handle for a background tick loop
pub struct LoopHandle {
    name: &'static str,
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

impl LoopHandle {
    /// Stop after the tick in progress (if any) finishes
    pub async fn shutdown(self) -> QueueResult<()> {
        let _ = self.shutdown_tx.send(());
        self.join_handle
            .await
            .map_err(|e| QueueError::Internal(format!("{} join error: {}", self.name, e)))
    }
}

/// Run `tick` every `period` until shut down. A failing tick never ends the
/// loop; the wait doubles per consecutive failure up to `retry_cap`.
pub(crate) fn spawn_tick_loop<F, Fut>(name: &'static str, period: Duration, retry_cap: Duration, mut tick: F) -> LoopHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = QueueResult<usize>> + Send,
{
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let join_handle = tokio::spawn(async move {
        info!(task = name, ?period, "tick loop started");
        let mut failures: u32 = 0;

        loop {
            let delay = match tick().await {
                Ok(count) => {
                    if failures > 0 {
                        info!(task = name, failures, "store reachable again");
                    }
                    failures = 0;
                    if count > 0 {
                        debug!(task = name, count, "tick handled jobs");
                    }
                    period
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    let delay = retry_delay(period, retry_cap, failures);
                    if failures == 1 {
                        warn!(task = name, error = %err, retry_in = ?delay, "tick failed");
                    } else {
                        error!(task = name, error = %err, consecutive_failures = failures, retry_in = ?delay, "tick keeps failing");
                    }
                    delay
                }
            };

            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!(task = name, "tick loop stopped");
    }
    .in_current_span());

    LoopHandle {
        name,
        shutdown_tx,
        join_handle,
    }
}

fn retry_delay(period: Duration, cap: Duration, failures: u32) -> Duration {
    let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
    let cap = cap.max(period);
    period.checked_mul(factor).map_or(cap, |delay| delay.min(cap))
}

/// Leases due jobs and hands them to the worker pool.
///
/// Holds no job state of its own: any number of dispatchers may poll the
/// same store, relying on the store's atomic lease.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    pool: PoolSender,
    batch_size: usize,
    tick_interval: Duration,
    retry_cap: Duration,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn JobStore>, pool: PoolSender, batch_size: usize, tick_interval: Duration) -> Self {
        Self {
            store,
            pool,
            batch_size,
            tick_interval,
            retry_cap: Duration::from_secs(60),
        }
    }

    /// Longest wait between ticks while the store is failing
    pub fn with_retry_cap(mut self, retry_cap: Duration) -> Self {
        self.retry_cap = retry_cap;
        self
    }

    /// One dispatch cycle. Queue slots are reserved before leasing, so every
    /// leased job is guaranteed a place in the pool.
    pub async fn run_once(&self, now: DateTime<Utc>) -> QueueResult<usize> {
        let wanted = self.batch_size.min(self.pool.capacity());
        if wanted == 0 {
            debug!("worker pool saturated; not leasing this tick");
            return Ok(0);
        }

        let permits = match self.pool.raw().try_reserve_many(wanted) {
            Ok(permits) => permits,
            Err(TrySendError::Full(())) => return Ok(0),
            Err(TrySendError::Closed(())) => return Err(QueueError::WorkerShutdown),
        };

        let jobs = self.store.lease_due_jobs(now, wanted).await?;
        let leased = jobs.len();
        for (permit, job) in permits.zip(jobs) {
            permit.send(job);
        }
        Ok(leased)
    }

    pub fn spawn(self) -> LoopHandle {
        let period = self.tick_interval;
        let retry_cap = self.retry_cap;
        let dispatcher = Arc::new(self);
        spawn_tick_loop("dispatcher", period, retry_cap, move || {
            let dispatcher = dispatcher.clone();
            async move { dispatcher.run_once(Utc::now()).await }
        })
    }
}

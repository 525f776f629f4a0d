use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::{
    dispatcher::{spawn_tick_loop, LoopHandle},
    error::QueueResult,
    store::JobStore,
};

/// Lease expiry reaper for reclaiming jobs whose worker went away
pub struct LeaseReaper {
    store: Arc<dyn JobStore>,
    interval: Duration,
    retry_cap: Duration,
}

impl LeaseReaper {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self::with_interval(store, Duration::from_secs(30))
    }

    pub fn with_interval(store: Arc<dyn JobStore>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            retry_cap: Duration::from_secs(60),
        }
    }

    pub fn with_retry_cap(mut self, retry_cap: Duration) -> Self {
        self.retry_cap = retry_cap;
        self
    }

    /// Run one reaper cycle
    pub async fn reap_once(&self, now: DateTime<Utc>) -> QueueResult<usize> {
        let reclaimed = self.store.reclaim_expired_leases(now).await?;
        if reclaimed > 0 {
            info!(reclaimed, "reclaimed expired leases");
        } else {
            debug!("no expired leases");
        }
        Ok(reclaimed)
    }

    pub fn spawn(self) -> LoopHandle {
        let period = self.interval;
        let retry_cap = self.retry_cap;
        let reaper = Arc::new(self);
        spawn_tick_loop("lease-reaper", period, retry_cap, move || {
            let reaper = reaper.clone();
            async move { reaper.reap_once(Utc::now()).await }
        })
    }
}

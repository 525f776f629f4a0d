use std::str::FromStr;
use std::time::Duration;

use crate::backoff::RetryBackoff;
use crate::error::{QueueError, QueueResult};
use crate::types::DedupePolicy;

/// Configuration for the job subsystem.
///
/// Every knob can be supplied through `QUEUE_*` environment variables via
/// [`QueueConfig::from_env`]; anything unset keeps the [`Default`] value.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// How often the dispatcher leases due jobs
    pub tick_interval: Duration,
    /// Upper bound on jobs leased per tick
    pub batch_size: usize,
    /// How often expired leases are reclaimed
    pub reclaim_interval: Duration,
    /// Lease length; must exceed the worst-case handler run plus a store round-trip
    pub lease_duration: Duration,
    /// Handlers running at once
    pub max_concurrency: usize,
    /// Slots in the worker pool's bounded queue
    pub queue_capacity: usize,
    /// Retry ceiling for jobs that do not set their own
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub handler_timeout: Duration,
    pub dedupe_policy: DedupePolicy,
    /// Longest wait between tick retries while the store is failing
    pub store_retry_cap: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            batch_size: 32,
            reclaim_interval: Duration::from_secs(30),
            lease_duration: Duration::from_secs(300), // 5 minutes
            max_concurrency: 8,
            queue_capacity: 64,
            max_attempts: 5,
            backoff_base: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(3600), // 1 hour
            handler_timeout: Duration::from_secs(60),
            dedupe_policy: DedupePolicy::Replace,
            store_retry_cap: Duration::from_secs(60),
        }
    }
}

impl QueueConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> QueueResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> QueueResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            tick_interval: millis(&lookup, "QUEUE_TICK_INTERVAL_MS", defaults.tick_interval)?,
            batch_size: parsed(&lookup, "QUEUE_BATCH_SIZE", defaults.batch_size)?,
            reclaim_interval: secs(&lookup, "QUEUE_RECLAIM_INTERVAL_SECS", defaults.reclaim_interval)?,
            lease_duration: secs(&lookup, "QUEUE_LEASE_DURATION_SECS", defaults.lease_duration)?,
            max_concurrency: parsed(&lookup, "QUEUE_MAX_CONCURRENCY", defaults.max_concurrency)?,
            queue_capacity: parsed(&lookup, "QUEUE_CAPACITY", defaults.queue_capacity)?,
            max_attempts: parsed(&lookup, "QUEUE_MAX_ATTEMPTS", defaults.max_attempts)?,
            backoff_base: millis(&lookup, "QUEUE_BACKOFF_BASE_MS", defaults.backoff_base)?,
            backoff_cap: secs(&lookup, "QUEUE_BACKOFF_CAP_SECS", defaults.backoff_cap)?,
            handler_timeout: secs(&lookup, "QUEUE_HANDLER_TIMEOUT_SECS", defaults.handler_timeout)?,
            dedupe_policy: parsed(&lookup, "QUEUE_DEDUPE_POLICY", defaults.dedupe_policy)?,
            store_retry_cap: secs(&lookup, "QUEUE_STORE_RETRY_CAP_SECS", defaults.store_retry_cap)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.batch_size == 0 {
            return Err(QueueError::Config("batch_size must be at least 1".to_string()));
        }
        if self.max_concurrency == 0 || self.queue_capacity == 0 {
            return Err(QueueError::Config(
                "max_concurrency and queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(QueueError::Config("max_attempts must be at least 1".to_string()));
        }
        if self.tick_interval.is_zero() || self.reclaim_interval.is_zero() {
            return Err(QueueError::Config("tick intervals must be non-zero".to_string()));
        }
        if self.handler_timeout >= self.lease_duration {
            return Err(QueueError::Config(format!(
                "handler_timeout ({:?}) must be shorter than lease_duration ({:?})",
                self.handler_timeout, self.lease_duration
            )));
        }
        Ok(())
    }

    pub fn backoff(&self) -> RetryBackoff {
        RetryBackoff::new(self.backoff_base, self.backoff_cap)
    }

    /// Settings a store needs to apply transitions on its own
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            lease_duration: self.lease_duration,
            max_attempts: self.max_attempts,
            backoff: self.backoff(),
            dedupe_policy: self.dedupe_policy,
        }
    }
}

/// Policy values shared by every store implementation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreOptions {
    pub lease_duration: Duration,
    pub max_attempts: u32,
    pub backoff: RetryBackoff,
    pub dedupe_policy: DedupePolicy,
}

impl StoreOptions {
    pub(crate) fn lease_length(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lease_duration).unwrap_or_else(|_| chrono::Duration::hours(1))
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        QueueConfig::default().store_options()
    }
}

fn parsed<F, T>(lookup: &F, key: &str, default: T) -> QueueResult<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| QueueError::Config(format!("{} = {:?}: {}", key, raw, e))),
    }
}

fn secs<F>(lookup: &F, key: &str, default: Duration) -> QueueResult<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    parsed(lookup, key, default.as_secs()).map(Duration::from_secs)
}

fn millis<F>(lookup: &F, key: &str, default: Duration) -> QueueResult<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    parsed(lookup, key, default.as_millis() as u64).map(Duration::from_millis)
}

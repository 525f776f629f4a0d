use anyhow::{Context, Result};
use booking_jobs::QueueConfig;
use std::time::Duration;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://booking-jobs.db?mode=rwc";

/// Process configuration, built once in `main` and passed down
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    /// `sqlite://…`, `postgres://…`, or `memory`
    pub database_url: String,
    /// How long before a booking starts its reminder fires
    pub reminder_lead: Duration,
    pub queue: QueueConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            reminder_lead: Duration::from_secs(3600),
            queue: QueueConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let reminder_lead = match lookup("REMINDER_LEAD_SECS") {
            Some(raw) => Duration::from_secs(
                raw.trim()
                    .parse()
                    .with_context(|| format!("REMINDER_LEAD_SECS = {:?} is not a number of seconds", raw))?,
            ),
            None => defaults.reminder_lead,
        };

        Ok(Self {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            reminder_lead,
            queue: QueueConfig::from_lookup(&lookup).context("invalid QUEUE_* configuration")?,
        })
    }

    pub fn reminder_lead(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.reminder_lead).unwrap_or_else(|_| chrono::Duration::days(365))
    }
}

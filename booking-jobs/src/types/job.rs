use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::{JobId, LockToken};
use crate::backoff::RetryBackoff;
use crate::error::{JobError, QueueError, QueueResult};

/// Job status lifecycle
///
/// `pending -> in_flight -> {delivered | pending (retry) | failed}` and
/// `pending -> cancelled`. An in-flight job is never cancelled directly; the
/// request is parked in [`Job::deferred`] until the attempt resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InFlight,
    Delivered,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Check if the job is in a terminal state (delivered, failed, or cancelled)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(QueueError::Serialization(format!("unknown job status: {}", other))),
        }
    }
}

/// A cancel or reschedule requested while the job was in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Deferred {
    Cancel,
    Reschedule,
}

impl Deferred {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancel => "cancel",
            Self::Reschedule => "reschedule",
        }
    }
}

impl FromStr for Deferred {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cancel" => Ok(Self::Cancel),
            "reschedule" => Ok(Self::Reschedule),
            other => Err(QueueError::Serialization(format!("unknown deferred action: {}", other))),
        }
    }
}

/// What to do when `enqueue` meets a non-terminal job holding the same dedupe key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupePolicy {
    /// Replace payload and due time of the existing job (reschedule semantics)
    #[default]
    Replace,
    /// Fail with `QueueError::DuplicateJob`
    Reject,
}

impl FromStr for DedupePolicy {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "replace" => Ok(Self::Replace),
            "reject" => Ok(Self::Reject),
            other => Err(QueueError::Config(format!("unknown dedupe policy: {}", other))),
        }
    }
}

/// Request to schedule a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub kind: String,
    pub payload: Value,
    pub scheduled_at: DateTime<Utc>,
    pub dedupe_key: Option<String>,
    /// Falls back to the store's configured ceiling when unset
    pub max_attempts: Option<u32>,
}

impl NewJob {
    /// A job due immediately
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            scheduled_at: Utc::now(),
            dedupe_key: None,
            max_attempts: None,
        }
    }

    /// Build a job from any serializable payload
    pub fn from_payload<T: Serialize>(kind: impl Into<String>, payload: &T) -> QueueResult<Self> {
        Ok(Self::new(kind, serde_json::to_value(payload)?))
    }

    pub fn run_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = scheduled_at;
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// How an in-flight attempt ended
#[derive(Debug, Clone, Copy)]
pub(crate) enum Outcome<'a> {
    Delivered,
    Failed(&'a JobError),
    /// The lease ran out before the worker reported back
    LeaseLost,
}

/// Result of applying a duplicate enqueue to an existing job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Superseded {
    /// Pending job updated in place
    Replaced,
    /// In-flight job will be rescheduled once its attempt resolves
    Deferred,
}

/// Durable job record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: String,
    pub payload: Value,
    pub dedupe_key: Option<String>,
    /// Eligible for delivery at or after this instant
    pub scheduled_at: DateTime<Utc>,
    pub status: JobStatus,
    /// Resolved delivery attempts so far
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub lock_token: Option<LockToken>,
    pub locked_until: Option<DateTime<Utc>>,
    pub deferred: Option<Deferred>,
    /// Bumped every time a duplicate enqueue replaces payload or due time
    pub revision: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub(crate) fn from_new(new: NewJob, default_max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            kind: new.kind,
            payload: new.payload,
            dedupe_key: new.dedupe_key,
            scheduled_at: new.scheduled_at,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: new.max_attempts.unwrap_or(default_max_attempts).max(1),
            last_error: None,
            lock_token: None,
            locked_until: None,
            deferred: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Key handed to side-effecting collaborators so a retried attempt of the
    /// same revision can be recognised, while a rescheduled one cannot.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.id, self.revision)
    }

    pub fn is_leasable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending
            && self.scheduled_at <= now
            && self.attempts < self.max_attempts
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::InFlight && self.locked_until.map_or(true, |until| until < now)
    }

    /// True while `token` is the live lease on this job
    pub fn owns_lease(&self, token: &LockToken, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::InFlight
            && self.lock_token.as_ref() == Some(token)
            && !self.lease_expired(now)
    }

    pub(crate) fn lease(&mut self, token: LockToken, locked_until: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = JobStatus::InFlight;
        self.lock_token = Some(token);
        self.locked_until = Some(locked_until);
        self.updated_at = now;
    }

    pub(crate) fn supersede(&mut self, new: &NewJob, default_max_attempts: u32, now: DateTime<Utc>) -> Superseded {
        self.kind = new.kind.clone();
        self.payload = new.payload.clone();
        self.scheduled_at = new.scheduled_at;
        self.max_attempts = new.max_attempts.unwrap_or(default_max_attempts).max(1);
        self.revision += 1;
        self.updated_at = now;

        if self.status == JobStatus::InFlight {
            self.deferred = Some(Deferred::Reschedule);
            Superseded::Deferred
        } else {
            self.attempts = 0;
            self.last_error = None;
            Superseded::Replaced
        }
    }

    /// Close the current attempt and pick the next status.
    pub(crate) fn resolve(&mut self, outcome: Outcome<'_>, backoff: &RetryBackoff, now: DateTime<Utc>) -> JobStatus {
        self.attempts = self.attempts.saturating_add(1);
        self.lock_token = None;
        self.locked_until = None;
        self.updated_at = now;

        match outcome {
            Outcome::Failed(err) => self.last_error = Some(err.message().to_string()),
            Outcome::LeaseLost => self.last_error = Some("lease expired".to_string()),
            Outcome::Delivered => {}
        }

        self.status = match (self.deferred.take(), outcome) {
            (Some(Deferred::Cancel), _) => JobStatus::Cancelled,
            (Some(Deferred::Reschedule), _) => {
                self.attempts = 0;
                self.last_error = None;
                JobStatus::Pending
            }
            (None, Outcome::Delivered) => JobStatus::Delivered,
            (None, Outcome::Failed(err)) if !err.is_retryable() => JobStatus::Failed,
            (None, _) if self.attempts >= self.max_attempts => JobStatus::Failed,
            (None, Outcome::Failed(_)) => {
                self.scheduled_at = backoff.retry_at(now, self.attempts);
                JobStatus::Pending
            }
            (None, Outcome::LeaseLost) => JobStatus::Pending,
        };

        self.status
    }

    /// Cancel a pending job; in-flight jobs get a deferred cancel instead.
    /// Returns true only when the job reached `cancelled` immediately.
    pub(crate) fn request_cancel(&mut self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending => {
                self.status = JobStatus::Cancelled;
                self.updated_at = now;
                true
            }
            JobStatus::InFlight => {
                self.deferred = Some(Deferred::Cancel);
                self.updated_at = now;
                false
            }
            _ => false,
        }
    }
}

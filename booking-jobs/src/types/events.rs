use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Job, JobId, JobStatus};

/// Job lifecycle events published by every store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobEvent {
    Enqueued {
        job_id: JobId,
        kind: String,
        scheduled_at: DateTime<Utc>,
        at: DateTime<Utc>,
    },

    /// A duplicate enqueue replaced the due time or payload
    Rescheduled {
        job_id: JobId,
        scheduled_at: DateTime<Utc>,
        revision: u32,
        at: DateTime<Utc>,
    },

    Leased {
        job_id: JobId,
        locked_until: DateTime<Utc>,
        at: DateTime<Utc>,
    },

    Delivered {
        job_id: JobId,
        at: DateTime<Utc>,
    },

    Retrying {
        job_id: JobId,
        retry_at: DateTime<Utc>,
        error: Option<String>,
        at: DateTime<Utc>,
    },

    Failed {
        job_id: JobId,
        error: Option<String>,
        at: DateTime<Utc>,
    },

    Cancelled {
        job_id: JobId,
        at: DateTime<Utc>,
    },

    /// Cancel requested while in flight; applied when the attempt resolves
    CancelDeferred {
        job_id: JobId,
        at: DateTime<Utc>,
    },

    /// Lease expired and the job was taken back from its worker
    Reclaimed {
        job_id: JobId,
        attempts: u32,
        at: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Event describing the status a job just resolved to
    pub(crate) fn for_resolution(job: &Job) -> Self {
        let job_id = job.id.clone();
        let at = job.updated_at;
        match job.status {
            JobStatus::Delivered => Self::Delivered { job_id, at },
            JobStatus::Failed => Self::Failed {
                job_id,
                error: job.last_error.clone(),
                at,
            },
            JobStatus::Cancelled => Self::Cancelled { job_id, at },
            JobStatus::Pending | JobStatus::InFlight => Self::Retrying {
                job_id,
                retry_at: job.scheduled_at,
                error: job.last_error.clone(),
                at,
            },
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Enqueued { .. } => "enqueued",
            Self::Rescheduled { .. } => "rescheduled",
            Self::Leased { .. } => "leased",
            Self::Delivered { .. } => "delivered",
            Self::Retrying { .. } => "retrying",
            Self::Failed { .. } => "failed",
            Self::Cancelled { .. } => "cancelled",
            Self::CancelDeferred { .. } => "cancel_deferred",
            Self::Reclaimed { .. } => "reclaimed",
        }
    }

    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Enqueued { job_id, .. }
            | Self::Rescheduled { job_id, .. }
            | Self::Leased { job_id, .. }
            | Self::Delivered { job_id, .. }
            | Self::Retrying { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Cancelled { job_id, .. }
            | Self::CancelDeferred { job_id, .. }
            | Self::Reclaimed { job_id, .. } => job_id,
        }
    }

    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::Enqueued { at, .. }
            | Self::Rescheduled { at, .. }
            | Self::Leased { at, .. }
            | Self::Delivered { at, .. }
            | Self::Retrying { at, .. }
            | Self::Failed { at, .. }
            | Self::Cancelled { at, .. }
            | Self::CancelDeferred { at, .. }
            | Self::Reclaimed { at, .. } => at,
        }
    }
}

use anyhow::Result;
use async_trait::async_trait;
use booking_jobs::{JobQueue, NewJob};
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

use super::bookings_shared::{Booking, BookingStatus};
use crate::notify::{Notification, NotificationGateway};
use crate::reminder::{reminder_key, ReminderPayload, REMINDER_KIND};

pub const BOOKING_CREATED: &str = "booking-created";
pub const BOOKING_UPDATED: &str = "booking-updated";
pub const BOOKING_DELETED: &str = "booking-deleted";

/// Reacts to booking changes after they are stored.
///
/// Errors are reported to the caller but never undo the booking change.
#[async_trait]
pub trait BookingLifecycle: Send + Sync {
    async fn on_created(&self, booking: &Booking) -> Result<()>;

    async fn on_updated(&self, before: &Booking, after: &Booking) -> Result<()>;

    async fn on_deleted(&self, booking: &Booking) -> Result<()>;
}

/// Keeps exactly one reminder job per scheduled booking
pub struct ReminderHooks {
    queue: JobQueue,
    lead: Duration,
}

impl ReminderHooks {
    pub fn new(queue: JobQueue, lead: Duration) -> Self {
        Self { queue, lead }
    }

    /// When the reminder for a booking starting at `start` should fire
    pub fn reminder_time(&self, start: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        (start - self.lead).max(now)
    }

    async fn schedule(&self, booking: &Booking) -> Result<()> {
        let payload = ReminderPayload::for_booking(booking);
        let run_at = self.reminder_time(booking.start_time, Utc::now());
        let job = NewJob::from_payload(REMINDER_KIND, &payload)?
            .with_dedupe_key(reminder_key(&booking.id))
            .run_at(run_at);

        let job = self.queue.enqueue(job).await?;
        info!(booking_id = %booking.id, job_id = %job.id, %run_at, "reminder scheduled");
        Ok(())
    }

    async fn unschedule(&self, booking: &Booking) -> Result<()> {
        let cancelled = self.queue.cancel(&reminder_key(&booking.id)).await?;
        if cancelled {
            info!(booking_id = %booking.id, "reminder cancelled");
        } else {
            debug!(booking_id = %booking.id, "no pending reminder to cancel");
        }
        Ok(())
    }
}

#[async_trait]
impl BookingLifecycle for ReminderHooks {
    async fn on_created(&self, booking: &Booking) -> Result<()> {
        if booking.status != BookingStatus::Scheduled {
            return Ok(());
        }
        self.schedule(booking).await
    }

    async fn on_updated(&self, before: &Booking, after: &Booking) -> Result<()> {
        if after.status != BookingStatus::Scheduled {
            if before.status == BookingStatus::Scheduled {
                return self.unschedule(after).await;
            }
            return Ok(());
        }

        let reactivated = before.status != BookingStatus::Scheduled;
        let moved = before.start_time != after.start_time;
        let renamed = before.title != after.title;
        if reactivated || moved || (renamed && !after.reminder_sent) {
            return self.schedule(after).await;
        }
        Ok(())
    }

    async fn on_deleted(&self, booking: &Booking) -> Result<()> {
        self.unschedule(booking).await
    }
}

/// Pushes booking changes to the owner's connected clients
pub struct BookingEventHooks {
    gateway: Arc<dyn NotificationGateway>,
}

impl BookingEventHooks {
    pub fn new(gateway: Arc<dyn NotificationGateway>) -> Self {
        Self { gateway }
    }

    async fn publish(&self, kind: &str, booking: &Booking, payload: Value) -> Result<()> {
        // Events are sent once and never retried, so each gets its own key
        let notification = Notification {
            kind: kind.to_string(),
            recipient_id: booking.user_id.clone(),
            payload,
            idempotency_key: format!("{}:{}:{}", kind, booking.id, uuid::Uuid::new_v4().simple()),
        };
        self.gateway.send(notification).await?;
        debug!(booking_id = %booking.id, kind, "booking event sent");
        Ok(())
    }
}

#[async_trait]
impl BookingLifecycle for BookingEventHooks {
    async fn on_created(&self, booking: &Booking) -> Result<()> {
        self.publish(BOOKING_CREATED, booking, serde_json::to_value(booking)?).await
    }

    async fn on_updated(&self, _before: &Booking, after: &Booking) -> Result<()> {
        self.publish(BOOKING_UPDATED, after, serde_json::to_value(after)?).await
    }

    async fn on_deleted(&self, booking: &Booking) -> Result<()> {
        self.publish(BOOKING_DELETED, booking, json!({ "booking_id": booking.id })).await
    }
}

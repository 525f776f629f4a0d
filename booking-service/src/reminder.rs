use async_trait::async_trait;
use booking_jobs::{JobContext, JobError, JobHandler};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

use crate::bookings::{Booking, BookingRepository, BookingStatus};
use crate::notify::{Notification, NotificationGateway};

pub const REMINDER_KIND: &str = "booking-reminder";

/// Dedupe key of a booking's reminder job
pub fn reminder_key(booking_id: &str) -> String {
    format!("{}:{}", REMINDER_KIND, booking_id)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderPayload {
    pub booking_id: String,
    pub recipient_id: String,
    pub title: String,
    /// Start time the reminder was scheduled for; a booking that has moved since is skipped
    pub start_time: DateTime<Utc>,
}

impl ReminderPayload {
    pub fn for_booking(booking: &Booking) -> Self {
        Self {
            booking_id: booking.id.clone(),
            recipient_id: booking.user_id.clone(),
            title: booking.title.clone(),
            start_time: booking.start_time,
        }
    }
}

/// Sends the "your booking starts soon" notification
pub struct BookingReminderHandler {
    bookings: Arc<dyn BookingRepository>,
    gateway: Arc<dyn NotificationGateway>,
}

impl BookingReminderHandler {
    pub fn new(bookings: Arc<dyn BookingRepository>, gateway: Arc<dyn NotificationGateway>) -> Self {
        Self { bookings, gateway }
    }
}

#[async_trait]
impl JobHandler for BookingReminderHandler {
    type Payload = ReminderPayload;
    const KIND: &'static str = REMINDER_KIND;

    async fn handle(&self, payload: ReminderPayload, ctx: &JobContext) -> Result<(), JobError> {
        let booking = self
            .bookings
            .get(&payload.booking_id)
            .await
            .map_err(|e| JobError::retryable(e.to_string()))?;

        let Some(booking) = booking else {
            debug!(booking_id = %payload.booking_id, "booking gone; reminder skipped");
            return Ok(());
        };
        if booking.status != BookingStatus::Scheduled || booking.start_time != payload.start_time {
            debug!(booking_id = %booking.id, status = %booking.status, "booking changed; reminder skipped");
            return Ok(());
        }
        if !ctx.still_wanted().await {
            debug!(booking_id = %booking.id, "reminder cancelled while running; skipped");
            return Ok(());
        }

        let notification = Notification {
            kind: REMINDER_KIND.to_string(),
            recipient_id: payload.recipient_id,
            payload: json!({
                "booking_id": booking.id,
                "title": booking.title,
                "start_time": booking.start_time,
                "location": booking.location,
            }),
            idempotency_key: ctx.idempotency_key(),
        };
        self.gateway
            .send(notification)
            .await
            .map_err(|e| JobError::retryable(e.to_string()))?;

        self.bookings
            .mark_reminder_sent(&booking.id)
            .await
            .map_err(|e| JobError::retryable(e.to_string()))?;
        info!(booking_id = %booking.id, attempt = ctx.attempt(), "booking reminder delivered");
        Ok(())
    }
}

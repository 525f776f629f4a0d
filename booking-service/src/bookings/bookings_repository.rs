use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::bookings_shared::{Booking, BookingResult};

/// Persistence seam for bookings
#[async_trait]
pub trait BookingRepository: Send + Sync {
    async fn insert(&self, booking: Booking) -> BookingResult<Booking>;

    async fn get(&self, id: &str) -> BookingResult<Option<Booking>>;

    /// Replace a stored booking; false when it no longer exists
    async fn save(&self, booking: &Booking) -> BookingResult<bool>;

    async fn delete(&self, id: &str) -> BookingResult<Option<Booking>>;

    /// A user's bookings, earliest start first
    async fn list_for_user(&self, user_id: &str) -> BookingResult<Vec<Booking>>;

    async fn mark_reminder_sent(&self, id: &str) -> BookingResult<bool>;
}

#[derive(Default)]
pub struct InMemoryBookingRepository {
    bookings: RwLock<HashMap<String, Booking>>,
}

impl InMemoryBookingRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BookingRepository for InMemoryBookingRepository {
    async fn insert(&self, booking: Booking) -> BookingResult<Booking> {
        self.bookings.write().insert(booking.id.clone(), booking.clone());
        Ok(booking)
    }

    async fn get(&self, id: &str) -> BookingResult<Option<Booking>> {
        Ok(self.bookings.read().get(id).cloned())
    }

    async fn save(&self, booking: &Booking) -> BookingResult<bool> {
        let mut bookings = self.bookings.write();
        match bookings.get_mut(&booking.id) {
            Some(stored) => {
                *stored = booking.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, id: &str) -> BookingResult<Option<Booking>> {
        Ok(self.bookings.write().remove(id))
    }

    async fn list_for_user(&self, user_id: &str) -> BookingResult<Vec<Booking>> {
        let mut found: Vec<Booking> = self
            .bookings
            .read()
            .values()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect();
        found.sort_by_key(|b| b.start_time);
        Ok(found)
    }

    async fn mark_reminder_sent(&self, id: &str) -> BookingResult<bool> {
        let mut bookings = self.bookings.write();
        match bookings.get_mut(id) {
            Some(booking) => {
                booking.reminder_sent = true;
                booking.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

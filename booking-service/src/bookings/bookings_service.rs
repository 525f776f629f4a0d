use chrono::{DateTime, SubsecRound, Utc};
use std::sync::Arc;
use tracing::{error, info, instrument};

use super::bookings_hooks::BookingLifecycle;
use super::bookings_repository::BookingRepository;
use super::bookings_shared::{
    Booking, BookingError, BookingPage, BookingResult, BookingStatus, CreateBooking, UpdateBooking,
};

/// Booking CRUD with time-range rules and lifecycle hooks.
///
/// Hooks run after the repository write. A failing hook is logged and the
/// booking operation still succeeds.
pub struct BookingService {
    repo: Arc<dyn BookingRepository>,
    hooks: Vec<Arc<dyn BookingLifecycle>>,
}

impl BookingService {
    pub fn new(repo: Arc<dyn BookingRepository>) -> Self {
        Self { repo, hooks: Vec::new() }
    }

    pub fn with_hook(mut self, hook: Arc<dyn BookingLifecycle>) -> Self {
        self.hooks.push(hook);
        self
    }

    #[instrument(skip(self, input), fields(title = %input.title))]
    pub async fn create(&self, user_id: &str, input: CreateBooking) -> BookingResult<Booking> {
        let now = stored_time(Utc::now());
        let (start_time, end_time) = (stored_time(input.start_time), stored_time(input.end_time));
        if start_time <= now {
            return Err(BookingError::Validation("Start time must be in the future".to_string()));
        }
        check_range(start_time, end_time)?;
        self.check_overlap(user_id, start_time, end_time, None).await?;

        let booking = Booking {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: input.title,
            description: input.description,
            start_time,
            end_time,
            status: BookingStatus::Scheduled,
            location: input.location,
            notes: input.notes,
            reminder_sent: false,
            created_at: now,
            updated_at: now,
        };
        let booking = self.repo.insert(booking).await?;
        info!(booking_id = %booking.id, "booking created");

        for hook in &self.hooks {
            if let Err(err) = hook.on_created(&booking).await {
                error!(booking_id = %booking.id, error = %err, "booking hook failed after create");
            }
        }
        Ok(booking)
    }

    /// A user's bookings, earliest first. `page` is 1-based.
    pub async fn find_all(&self, user_id: &str, page: usize, limit: usize) -> BookingResult<BookingPage> {
        let page = page.max(1);
        let limit = limit.max(1);
        let all = self.repo.list_for_user(user_id).await?;
        let total = all.len();
        let skipped = page.saturating_sub(1).saturating_mul(limit);
        let bookings = all.into_iter().skip(skipped).take(limit).collect();
        Ok(BookingPage {
            bookings,
            total,
            page,
            limit,
        })
    }

    pub async fn find_one(&self, id: &str, user_id: &str) -> BookingResult<Booking> {
        match self.repo.get(id).await? {
            Some(booking) if booking.user_id == user_id => Ok(booking),
            _ => Err(BookingError::NotFound(id.to_string())),
        }
    }

    /// Scheduled bookings that have not started yet
    pub async fn find_upcoming(&self, user_id: &str, limit: usize) -> BookingResult<Vec<Booking>> {
        let now = Utc::now();
        Ok(self
            .repo
            .list_for_user(user_id)
            .await?
            .into_iter()
            .filter(|b| b.status == BookingStatus::Scheduled && b.start_time > now)
            .take(limit)
            .collect())
    }

    /// Bookings that have already ended, most recent first
    pub async fn find_past(&self, user_id: &str, limit: usize) -> BookingResult<Vec<Booking>> {
        let now = Utc::now();
        let mut past: Vec<Booking> = self
            .repo
            .list_for_user(user_id)
            .await?
            .into_iter()
            .filter(|b| b.end_time < now)
            .collect();
        past.sort_by(|a, b| b.end_time.cmp(&a.end_time));
        past.truncate(limit);
        Ok(past)
    }

    #[instrument(skip(self, changes))]
    pub async fn update(&self, id: &str, user_id: &str, changes: UpdateBooking) -> BookingResult<Booking> {
        let before = self.find_one(id, user_id).await?;
        let mut after = before.clone();

        if let Some(title) = changes.title {
            after.title = title;
        }
        if let Some(description) = changes.description {
            after.description = Some(description);
        }
        if let Some(location) = changes.location {
            after.location = Some(location);
        }
        if let Some(notes) = changes.notes {
            after.notes = Some(notes);
        }
        if let Some(status) = changes.status {
            after.status = status;
        }

        if changes.start_time.is_some() || changes.end_time.is_some() {
            let start = changes.start_time.map_or(before.start_time, stored_time);
            let end = changes.end_time.map_or(before.end_time, stored_time);
            if changes.start_time.is_some() && start <= Utc::now() {
                return Err(BookingError::Validation("Start time must be in the future".to_string()));
            }
            check_range(start, end)?;
            self.check_overlap(user_id, start, end, Some(id)).await?;

            if start != before.start_time {
                after.reminder_sent = false;
            }
            after.start_time = start;
            after.end_time = end;
        }

        self.store_update(before, after).await
    }

    pub async fn update_status(&self, id: &str, user_id: &str, status: BookingStatus) -> BookingResult<Booking> {
        let changes = UpdateBooking {
            status: Some(status),
            ..UpdateBooking::default()
        };
        self.update(id, user_id, changes).await
    }

    #[instrument(skip(self))]
    pub async fn remove(&self, id: &str, user_id: &str) -> BookingResult<()> {
        self.find_one(id, user_id).await?;
        let booking = self
            .repo
            .delete(id)
            .await?
            .ok_or_else(|| BookingError::NotFound(id.to_string()))?;
        info!(booking_id = %id, "booking removed");

        for hook in &self.hooks {
            if let Err(err) = hook.on_deleted(&booking).await {
                error!(booking_id = %id, error = %err, "booking hook failed after delete");
            }
        }
        Ok(())
    }

    async fn store_update(&self, before: Booking, mut after: Booking) -> BookingResult<Booking> {
        after.updated_at = stored_time(Utc::now());
        if !self.repo.save(&after).await? {
            return Err(BookingError::NotFound(after.id));
        }
        info!(booking_id = %after.id, status = %after.status, "booking updated");

        for hook in &self.hooks {
            if let Err(err) = hook.on_updated(&before, &after).await {
                error!(booking_id = %after.id, error = %err, "booking hook failed after update");
            }
        }
        Ok(after)
    }

    async fn check_overlap(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude: Option<&str>,
    ) -> BookingResult<()> {
        let clash = self.repo.list_for_user(user_id).await?.into_iter().find(|b| {
            b.status == BookingStatus::Scheduled && Some(b.id.as_str()) != exclude && b.overlaps(start, end)
        });
        match clash {
            Some(existing) => Err(BookingError::Overlap(existing.id)),
            None => Ok(()),
        }
    }
}

/// Timestamps are kept to the microsecond, the finest precision every
/// repository round-trips.
fn stored_time(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(6)
}

fn check_range(start: DateTime<Utc>, end: DateTime<Utc>) -> BookingResult<()> {
    if end <= start {
        return Err(BookingError::Validation("End time must be after start time".to_string()));
    }
    Ok(())
}

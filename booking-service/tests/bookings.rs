use anyhow::anyhow;
use async_trait::async_trait;
use booking_jobs::{JobStatus, MemoryStore};
use chrono::{Duration, SubsecRound, Utc};
use std::sync::Arc;
use tracing_test::traced_test;

use booking_service::bookings::bookings_hooks::{BOOKING_CREATED, BOOKING_DELETED, BOOKING_UPDATED};
use booking_service::bookings::{
    Booking, BookingError, BookingLifecycle, BookingRepository, BookingService, BookingStatus, CreateBooking,
    InMemoryBookingRepository, UpdateBooking,
};
use booking_service::notify::{BroadcastGateway, LogGateway};
use booking_service::reminder::{reminder_key, ReminderPayload};
use booking_service::{BookingApp, ServiceConfig};

const USER: &str = "user-123";

fn app() -> BookingApp {
    let config = ServiceConfig::default();
    let store = Arc::new(MemoryStore::with_options(config.queue.store_options()));
    BookingApp::build(&config, store, Arc::new(InMemoryBookingRepository::new()), Arc::new(LogGateway)).unwrap()
}

fn meeting(start_in_hours: i64) -> CreateBooking {
    let start = Utc::now().trunc_subsecs(0) + Duration::hours(start_in_hours);
    CreateBooking::new("Test Meeting", start, start + Duration::hours(1))
}

/// B1. Start time must be in the future and before the end time
#[tokio::test]
async fn test_create_validates_time_range() {
    let app = app();

    let past = meeting(-2);
    let err = app.bookings.create(USER, past).await.unwrap_err();
    assert!(matches!(err, BookingError::Validation(msg) if msg.contains("future")));

    let mut backwards = meeting(2);
    backwards.end_time = backwards.start_time - Duration::minutes(30);
    let err = app.bookings.create(USER, backwards).await.unwrap_err();
    assert!(matches!(err, BookingError::Validation(msg) if msg.contains("End time")));
}

/// B2. A user cannot hold two overlapping scheduled bookings
#[tokio::test]
async fn test_create_rejects_overlap() {
    let app = app();
    let first = app.bookings.create(USER, meeting(3)).await.unwrap();

    let mut clash = meeting(3);
    clash.start_time += Duration::minutes(30);
    clash.end_time += Duration::minutes(30);
    let err = app.bookings.create(USER, clash.clone()).await.unwrap_err();
    assert!(matches!(err, BookingError::Overlap(id) if id == first.id));

    // Another user is unaffected
    assert!(app.bookings.create("user-456", clash).await.is_ok());
}

/// B3. Creating a booking schedules its reminder one lead time before the start
#[tokio::test]
async fn test_create_schedules_reminder() {
    let app = app();

    let booking = app.bookings.create(USER, meeting(5)).await.unwrap();

    let job = app.queue.find_by_dedupe_key(&reminder_key(&booking.id)).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.kind, "booking-reminder");
    assert_eq!(job.scheduled_at, booking.start_time - Duration::hours(1));

    let payload: ReminderPayload = serde_json::from_value(job.payload).unwrap();
    assert_eq!(payload, ReminderPayload::for_booking(&booking));
}

/// B4. A booking starting inside the lead time is reminded right away
#[tokio::test]
async fn test_reminder_time_is_clamped_to_now() {
    let app = app();
    let before = Utc::now();
    let mut soon = meeting(0);
    soon.start_time = Utc::now() + Duration::minutes(10);
    soon.end_time = soon.start_time + Duration::minutes(30);

    let booking = app.bookings.create(USER, soon).await.unwrap();

    let job = app.queue.find_by_dedupe_key(&reminder_key(&booking.id)).await.unwrap().unwrap();
    assert!(job.scheduled_at >= before);
    assert!(job.scheduled_at <= Utc::now());
}

/// B5. Moving a booking reschedules the same reminder job
#[tokio::test]
async fn test_reschedule_replaces_reminder() {
    let app = app();
    let booking = app.bookings.create(USER, meeting(5)).await.unwrap();
    let original = app.queue.find_by_dedupe_key(&reminder_key(&booking.id)).await.unwrap().unwrap();

    let new_start = booking.start_time + Duration::days(1);
    let changes = UpdateBooking {
        start_time: Some(new_start),
        end_time: Some(new_start + Duration::hours(1)),
        ..UpdateBooking::default()
    };
    let updated = app.bookings.update(&booking.id, USER, changes).await.unwrap();

    assert!(!updated.reminder_sent);
    let job = app.queue.find_by_dedupe_key(&reminder_key(&booking.id)).await.unwrap().unwrap();
    assert_eq!(job.id, original.id);
    assert_eq!(job.revision, 1);
    assert_eq!(job.scheduled_at, new_start - Duration::hours(1));
    assert_eq!(app.queue.store().list(None, 10).await.unwrap().len(), 1);
}

/// B6. Editing notes alone leaves the reminder untouched
#[tokio::test]
async fn test_unrelated_update_keeps_reminder() {
    let app = app();
    let booking = app.bookings.create(USER, meeting(5)).await.unwrap();

    let changes = UpdateBooking {
        notes: Some("bring slides".to_string()),
        ..UpdateBooking::default()
    };
    app.bookings.update(&booking.id, USER, changes).await.unwrap();

    let job = app.queue.find_by_dedupe_key(&reminder_key(&booking.id)).await.unwrap().unwrap();
    assert_eq!(job.revision, 0);
}

/// B7. Cancelling a booking cancels its reminder; reinstating it schedules a new one
#[tokio::test]
async fn test_status_changes_follow_reminder() {
    let app = app();
    let booking = app.bookings.create(USER, meeting(5)).await.unwrap();
    let key = reminder_key(&booking.id);
    let first = app.queue.find_by_dedupe_key(&key).await.unwrap().unwrap();

    app.bookings
        .update_status(&booking.id, USER, BookingStatus::Cancelled)
        .await
        .unwrap();
    assert_eq!(app.queue.get(&first.id).await.unwrap().status, JobStatus::Cancelled);

    app.bookings
        .update_status(&booking.id, USER, BookingStatus::Scheduled)
        .await
        .unwrap();
    let second = app.queue.find_by_dedupe_key(&key).await.unwrap().unwrap();
    assert_ne!(second.id, first.id);
    assert_eq!(second.status, JobStatus::Pending);
}

/// B8. Removing a booking cancels its reminder
#[tokio::test]
async fn test_remove_cancels_reminder() {
    let app = app();
    let booking = app.bookings.create(USER, meeting(5)).await.unwrap();

    app.bookings.remove(&booking.id, USER).await.unwrap();

    let job = app.queue.find_by_dedupe_key(&reminder_key(&booking.id)).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(matches!(
        app.bookings.find_one(&booking.id, USER).await,
        Err(BookingError::NotFound(_))
    ));
}

/// B9. Users only see their own bookings; listings are paged and ordered
#[tokio::test]
async fn test_queries_are_scoped_to_user() {
    let app = app();
    let late = app.bookings.create(USER, meeting(10)).await.unwrap();
    let early = app.bookings.create(USER, meeting(2)).await.unwrap();
    let done = app.bookings.create(USER, meeting(6)).await.unwrap();
    app.bookings.update_status(&done.id, USER, BookingStatus::Completed).await.unwrap();

    assert!(matches!(
        app.bookings.find_one(&early.id, "someone-else").await,
        Err(BookingError::NotFound(_))
    ));

    let page = app.bookings.find_all(USER, 1, 2).await.unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.bookings.len(), 2);
    assert_eq!(page.bookings[0].id, early.id);

    let upcoming: Vec<String> = app
        .bookings
        .find_upcoming(USER, 10)
        .await
        .unwrap()
        .into_iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(upcoming, vec![early.id, late.id]);
}

struct BrokenHook;

#[async_trait]
impl BookingLifecycle for BrokenHook {
    async fn on_created(&self, _booking: &Booking) -> anyhow::Result<()> {
        Err(anyhow!("job store unreachable"))
    }

    async fn on_updated(&self, _before: &Booking, _after: &Booking) -> anyhow::Result<()> {
        Err(anyhow!("job store unreachable"))
    }

    async fn on_deleted(&self, _booking: &Booking) -> anyhow::Result<()> {
        Err(anyhow!("job store unreachable"))
    }
}

/// B10. A failing hook is logged but never fails the booking operation
#[traced_test]
#[tokio::test]
async fn test_hook_failure_does_not_fail_booking() {
    let service = BookingService::new(Arc::new(InMemoryBookingRepository::new())).with_hook(Arc::new(BrokenHook));

    let booking = service.create(USER, meeting(4)).await.unwrap();
    service.remove(&booking.id, USER).await.unwrap();

    assert!(logs_contain("booking hook failed after create"));
    assert!(logs_contain("booking hook failed after delete"));
}

/// B11. Paging past the end is empty, however large the page number
#[tokio::test]
async fn test_find_all_page_out_of_range() {
    let app = app();
    app.bookings.create(USER, meeting(2)).await.unwrap();
    app.bookings.create(USER, meeting(4)).await.unwrap();

    let page = app.bookings.find_all(USER, usize::MAX, 2).await.unwrap();
    assert_eq!(page.total, 2);
    assert!(page.bookings.is_empty());

    let page = app.bookings.find_all(USER, 3, usize::MAX).await.unwrap();
    assert!(page.bookings.is_empty());
}

fn ended(id: &str, hours_ago: i64, status: BookingStatus) -> Booking {
    let end = Utc::now() - Duration::hours(hours_ago);
    Booking {
        id: id.to_string(),
        user_id: USER.to_string(),
        title: id.to_string(),
        description: None,
        start_time: end - Duration::hours(1),
        end_time: end,
        status,
        location: None,
        notes: None,
        reminder_sent: true,
        created_at: end - Duration::days(7),
        updated_at: end,
    }
}

/// B12. Past bookings of any status, most recently ended first
#[tokio::test]
async fn test_find_past_orders_by_end_desc() {
    let repo = Arc::new(InMemoryBookingRepository::new());
    repo.insert(ended("old", 48, BookingStatus::Completed)).await.unwrap();
    repo.insert(ended("recent", 2, BookingStatus::Scheduled)).await.unwrap();
    repo.insert(ended("middle", 10, BookingStatus::Cancelled)).await.unwrap();
    repo.insert(Booking {
        user_id: "someone-else".to_string(),
        ..ended("foreign", 1, BookingStatus::Completed)
    })
    .await
    .unwrap();
    let service = BookingService::new(repo);
    service.create(USER, meeting(3)).await.unwrap();

    let ids = |bookings: Vec<Booking>| bookings.into_iter().map(|b| b.id).collect::<Vec<_>>();
    assert_eq!(ids(service.find_past(USER, 10).await.unwrap()), vec!["recent", "middle", "old"]);
    assert_eq!(ids(service.find_past(USER, 1).await.unwrap()), vec!["recent"]);
    assert!(service.find_past("nobody", 10).await.unwrap().is_empty());
}

/// B13. Clients hear about every create, update and delete of their bookings
#[tokio::test]
async fn test_booking_changes_are_pushed_to_owner() {
    let config = ServiceConfig::default();
    let store = Arc::new(MemoryStore::with_options(config.queue.store_options()));
    let gateway = Arc::new(BroadcastGateway::default());
    let mut rx = gateway.subscribe();
    let app = BookingApp::build(&config, store, Arc::new(InMemoryBookingRepository::new()), gateway).unwrap();

    let booking = app.bookings.create(USER, meeting(5)).await.unwrap();
    for notes in ["first", "second"] {
        let changes = UpdateBooking {
            notes: Some(notes.to_string()),
            ..UpdateBooking::default()
        };
        app.bookings.update(&booking.id, USER, changes).await.unwrap();
    }
    app.bookings.remove(&booking.id, USER).await.unwrap();

    let mut events = Vec::new();
    while let Ok(note) = rx.try_recv() {
        assert_eq!(note.recipient_id, USER);
        events.push(note);
    }
    let kinds: Vec<&str> = events.iter().map(|n| n.kind.as_str()).collect();
    assert_eq!(kinds, vec![BOOKING_CREATED, BOOKING_UPDATED, BOOKING_UPDATED, BOOKING_DELETED]);
    assert_eq!(events[0].payload["id"], booking.id.as_str());
    assert_eq!(events[1].payload["notes"], "first");
    assert_eq!(events[2].payload["notes"], "second");
    assert_eq!(events[3].payload["booking_id"], booking.id.as_str());
}

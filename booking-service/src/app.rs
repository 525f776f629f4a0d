use anyhow::{bail, Result};
use booking_jobs::{HandlerRegistry, JobQueue, JobStore, MemoryStore, RunningQueue, StoreOptions};
use std::sync::Arc;
use tracing::info;

use crate::bookings::{BookingEventHooks, BookingRepository, BookingService, InMemoryBookingRepository, ReminderHooks};
use crate::config::ServiceConfig;
use crate::notify::NotificationGateway;
use crate::reminder::BookingReminderHandler;

/// Job store and booking repository on the same database
#[derive(Clone)]
pub struct Storage {
    pub jobs: Arc<dyn JobStore>,
    pub bookings: Arc<dyn BookingRepository>,
}

/// Open the storage named by `database_url`. Jobs and bookings share one
/// pool, so a reminder that survives a restart still finds its booking.
pub async fn open_storage(database_url: &str, options: StoreOptions) -> Result<Storage> {
    if database_url == "memory" {
        info!("using in-memory storage; bookings and reminders will not survive a restart");
        return Ok(Storage {
            jobs: Arc::new(MemoryStore::with_options(options)),
            bookings: Arc::new(InMemoryBookingRepository::new()),
        });
    }

    if database_url.starts_with("sqlite:") {
        #[cfg(feature = "sqlite")]
        {
            let jobs = booking_jobs::SqliteStore::connect(database_url, options).await?;
            let bookings = crate::bookings::SqliteBookingRepository::new(jobs.pool().clone());
            bookings.migrate().await?;
            return Ok(Storage {
                jobs: Arc::new(jobs),
                bookings: Arc::new(bookings),
            });
        }
        #[cfg(not(feature = "sqlite"))]
        bail!("built without the `sqlite` feature");
    }

    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        #[cfg(feature = "postgres")]
        {
            let jobs = booking_jobs::PostgresStore::connect(database_url, options).await?;
            let bookings = crate::bookings::PostgresBookingRepository::new(jobs.pool().clone());
            bookings.migrate().await?;
            return Ok(Storage {
                jobs: Arc::new(jobs),
                bookings: Arc::new(bookings),
            });
        }
        #[cfg(not(feature = "postgres"))]
        bail!("built without the `postgres` feature");
    }

    bail!("unsupported DATABASE_URL scheme: {}", database_url)
}

/// Booking service and reminder queue wired together
pub struct BookingApp {
    pub bookings: BookingService,
    pub queue: JobQueue,
}

impl BookingApp {
    pub fn build(
        config: &ServiceConfig,
        store: Arc<dyn JobStore>,
        repo: Arc<dyn BookingRepository>,
        gateway: Arc<dyn NotificationGateway>,
    ) -> Result<Self> {
        let registry = HandlerRegistry::new().with(BookingReminderHandler::new(repo.clone(), gateway.clone()))?;
        let queue = JobQueue::new(store, registry, config.queue.clone());

        let reminders = ReminderHooks::new(queue.clone(), config.reminder_lead());
        let bookings = BookingService::new(repo)
            .with_hook(Arc::new(reminders))
            .with_hook(Arc::new(BookingEventHooks::new(gateway)));

        Ok(Self { bookings, queue })
    }

    /// Build on storage opened with [`open_storage`]
    pub fn with_storage(config: &ServiceConfig, storage: Storage, gateway: Arc<dyn NotificationGateway>) -> Result<Self> {
        Self::build(config, storage.jobs, storage.bookings, gateway)
    }

    /// Start dispatching reminders
    pub fn start(&self) -> Result<RunningQueue> {
        Ok(self.queue.start()?)
    }
}

pub mod bookings_hooks;
pub mod bookings_repository;
pub mod bookings_service;
pub mod bookings_shared;
#[cfg(any(feature = "sqlite", feature = "postgres"))]
mod bookings_sql;
#[cfg(feature = "postgres")]
pub mod postgres_repository;
#[cfg(feature = "sqlite")]
pub mod sqlite_repository;

pub use bookings_hooks::{BookingEventHooks, BookingLifecycle, ReminderHooks};
pub use bookings_repository::{BookingRepository, InMemoryBookingRepository};
pub use bookings_service::BookingService;
pub use bookings_shared::{
    Booking, BookingError, BookingPage, BookingResult, BookingStatus, CreateBooking, UpdateBooking,
};
#[cfg(feature = "postgres")]
pub use postgres_repository::PostgresBookingRepository;
#[cfg(feature = "sqlite")]
pub use sqlite_repository::SqliteBookingRepository;

//! Booking service: booking CRUD whose lifecycle keeps one durable reminder
//! job per scheduled booking, delivered through a notification gateway.

pub mod app;
pub mod bookings;
pub mod config;
pub mod logging;
pub mod notify;
pub mod reminder;

pub use app::{open_storage, BookingApp, Storage};
pub use config::ServiceConfig;

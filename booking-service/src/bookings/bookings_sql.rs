use chrono::{DateTime, Utc};
use sqlx::query::Query;
use sqlx::{Database, Encode, Type};

use super::bookings_shared::{Booking, BookingError};

/// Column layout shared by the SQL booking repositories
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct BookingRow {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: String,
    pub location: Option<String>,
    pub notes: Option<String>,
    pub reminder_sent: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = BookingError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        Ok(Booking {
            id: row.id,
            user_id: row.user_id,
            title: row.title,
            description: row.description,
            start_time: row.start_time,
            end_time: row.end_time,
            status: row.status.parse()?,
            location: row.location,
            notes: row.notes,
            reminder_sent: row.reminder_sent,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Rows to bookings, earliest start first
pub(crate) fn into_bookings(rows: Vec<BookingRow>) -> Result<Vec<Booking>, BookingError> {
    let mut bookings = rows.into_iter().map(Booking::try_from).collect::<Result<Vec<_>, _>>()?;
    bookings.sort_by_key(|b| b.start_time);
    Ok(bookings)
}

impl From<sqlx::Error> for BookingError {
    fn from(err: sqlx::Error) -> Self {
        BookingError::Storage(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for BookingError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        BookingError::Storage(err.to_string())
    }
}

type Args<'q, DB> = <DB as Database>::Arguments<'q>;

/// Bind all twelve columns in table order; `id` comes first, so `UPDATE`
/// statements address it as the first parameter
pub(crate) fn bind_booking<'q, DB>(query: Query<'q, DB, Args<'q, DB>>, booking: &'q Booking) -> Query<'q, DB, Args<'q, DB>>
where
    DB: Database,
    &'q str: Encode<'q, DB> + Type<DB>,
    bool: Encode<'q, DB> + Type<DB>,
    DateTime<Utc>: Encode<'q, DB> + Type<DB>,
    Option<&'q str>: Encode<'q, DB> + Type<DB>,
{
    query
        .bind(booking.id.as_str())
        .bind(booking.user_id.as_str())
        .bind(booking.title.as_str())
        .bind(booking.description.as_deref())
        .bind(booking.start_time)
        .bind(booking.end_time)
        .bind(booking.status.as_str())
        .bind(booking.location.as_deref())
        .bind(booking.notes.as_deref())
        .bind(booking.reminder_sent)
        .bind(booking.created_at)
        .bind(booking.updated_at)
}

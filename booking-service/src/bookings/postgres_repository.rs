use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;

use super::bookings_repository::BookingRepository;
use super::bookings_shared::{Booking, BookingResult};
use super::bookings_sql::{bind_booking, into_bookings, BookingRow};

const INSERT: &str = "INSERT INTO bookings (id, user_id, title, description, start_time, end_time, status, \
     location, notes, reminder_sent, created_at, updated_at) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)";

const UPDATE: &str = "UPDATE bookings SET user_id = $2, title = $3, description = $4, start_time = $5, \
     end_time = $6, status = $7, location = $8, notes = $9, reminder_sent = $10, created_at = $11, \
     updated_at = $12 \
     WHERE id = $1";

/// Bookings in PostgreSQL, usually sharing the job store's pool
#[derive(Clone)]
pub struct PostgresBookingRepository {
    pool: PgPool,
}

impl PostgresBookingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> BookingResult<()> {
        let mut migrator = sqlx::migrate!("./migrations/postgres");
        // The job store records its own migrations in the same table
        migrator.set_ignore_missing(true);
        migrator.run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl BookingRepository for PostgresBookingRepository {
    async fn insert(&self, booking: Booking) -> BookingResult<Booking> {
        bind_booking(sqlx::query(INSERT), &booking).execute(&self.pool).await?;
        Ok(booking)
    }

    async fn get(&self, id: &str) -> BookingResult<Option<Booking>> {
        let row = sqlx::query_as::<_, BookingRow>("SELECT * FROM bookings WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Booking::try_from).transpose()
    }

    async fn save(&self, booking: &Booking) -> BookingResult<bool> {
        let result = bind_booking(sqlx::query(UPDATE), booking).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, id: &str) -> BookingResult<Option<Booking>> {
        let row = sqlx::query_as::<_, BookingRow>("DELETE FROM bookings WHERE id = $1 RETURNING *")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Booking::try_from).transpose()
    }

    async fn list_for_user(&self, user_id: &str) -> BookingResult<Vec<Booking>> {
        let rows = sqlx::query_as::<_, BookingRow>("SELECT * FROM bookings WHERE user_id = $1 ORDER BY start_time")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        into_bookings(rows)
    }

    async fn mark_reminder_sent(&self, id: &str) -> BookingResult<bool> {
        let result = sqlx::query("UPDATE bookings SET reminder_sent = TRUE, updated_at = $2 WHERE id = $1")
            .bind(id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

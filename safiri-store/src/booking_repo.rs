use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use safiri_core::models::{Booking, BookingStatus, ReconciliationCase};
use safiri_core::repository::{BookingRepository, RepoResult};
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
pub struct InMemoryBookingRepository {
    bookings: RwLock<HashMap<Uuid, Booking>>,
    reconciliations: RwLock<Vec<ReconciliationCase>>,
}

impl InMemoryBookingRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BookingRepository for InMemoryBookingRepository {
    async fn insert(&self, booking: &Booking) -> RepoResult<()> {
        let mut bookings = self.bookings.write().await;
        if bookings.contains_key(&booking.id) {
            return Err(format!("booking {} already exists", booking.id).into());
        }
        bookings.insert(booking.id, booking.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> RepoResult<Option<Booking>> {
        Ok(self.bookings.read().await.get(&id).cloned())
    }

    async fn delete(&self, id: Uuid) -> RepoResult<()> {
        self.bookings.write().await.remove(&id);
        Ok(())
    }

    async fn transition(
        &self,
        id: Uuid,
        from: BookingStatus,
        to: BookingStatus,
        at: DateTime<Utc>,
    ) -> RepoResult<bool> {
        let mut bookings = self.bookings.write().await;
        match bookings.get_mut(&id) {
            Some(booking) if booking.status == from => {
                booking.status = to;
                booking.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_qr_link(&self, id: Uuid, link: &str) -> RepoResult<()> {
        let mut bookings = self.bookings.write().await;
        let booking = bookings
            .get_mut(&id)
            .ok_or_else(|| format!("booking {} not found", id))?;
        booking.qr_verification_link = Some(link.to_string());
        Ok(())
    }

    async fn confirmed_seats(&self, vehicle_id: Uuid, travel_date: NaiveDate) -> RepoResult<Vec<u32>> {
        let bookings = self.bookings.read().await;
        let mut seats: Vec<u32> = bookings
            .values()
            .filter(|b| {
                b.vehicle_id == vehicle_id
                    && b.travel_date == travel_date
                    && b.status == BookingStatus::Confirmed
            })
            .map(|b| b.seat_number)
            .collect();
        seats.sort_unstable();
        Ok(seats)
    }

    async fn list_for_user(&self, user_id: &str, status: BookingStatus) -> RepoResult<Vec<Booking>> {
        let bookings = self.bookings.read().await;
        let mut matching: Vec<Booking> = bookings
            .values()
            .filter(|b| b.user_id == user_id && b.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|b| b.created_at);
        Ok(matching)
    }

    async fn list_overdue(&self, now: DateTime<Utc>) -> RepoResult<Vec<Booking>> {
        let bookings = self.bookings.read().await;
        Ok(bookings.values().filter(|b| b.is_overdue(now)).cloned().collect())
    }

    async fn record_reconciliation(&self, case: &ReconciliationCase) -> RepoResult<()> {
        self.reconciliations.write().await.push(case.clone());
        Ok(())
    }

    async fn list_reconciliations(&self) -> RepoResult<Vec<ReconciliationCase>> {
        Ok(self.reconciliations.read().await.clone())
    }
}

pub struct PgBookingRepository {
    pool: PgPool,
}

impl PgBookingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct BookingRow {
    id: Uuid,
    user_id: String,
    vehicle_id: Uuid,
    route_id: Uuid,
    seat_number: i32,
    travel_date: NaiveDate,
    price: i32,
    status: String,
    booking_expiry: DateTime<Utc>,
    qr_verification_link: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = Box<dyn std::error::Error + Send + Sync>;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        Ok(Booking {
            id: row.id,
            user_id: row.user_id,
            vehicle_id: row.vehicle_id,
            route_id: row.route_id,
            seat_number: u32::try_from(row.seat_number)?,
            travel_date: row.travel_date,
            price: row.price,
            status: row.status.parse::<BookingStatus>()?,
            booking_expiry: row.booking_expiry,
            qr_verification_link: row.qr_verification_link,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ReconciliationRow {
    id: Uuid,
    booking_id: Uuid,
    user_id: String,
    amount: i32,
    transaction_reference: Option<String>,
    booking_expiry: DateTime<Utc>,
    detected_at: DateTime<Utc>,
}

impl From<ReconciliationRow> for ReconciliationCase {
    fn from(row: ReconciliationRow) -> Self {
        ReconciliationCase {
            id: row.id,
            booking_id: row.booking_id,
            user_id: row.user_id,
            amount: row.amount,
            transaction_reference: row.transaction_reference,
            booking_expiry: row.booking_expiry,
            detected_at: row.detected_at,
        }
    }
}

const BOOKING_COLUMNS: &str = "id, user_id, vehicle_id, route_id, seat_number, travel_date, price, \
     status, booking_expiry, qr_verification_link, created_at, updated_at";

fn into_bookings(rows: Vec<BookingRow>) -> RepoResult<Vec<Booking>> {
    rows.into_iter().map(Booking::try_from).collect()
}

#[async_trait]
impl BookingRepository for PgBookingRepository {
    async fn insert(&self, booking: &Booking) -> RepoResult<()> {
        sqlx::query(
            r#"
            INSERT INTO bookings (id, user_id, vehicle_id, route_id, seat_number, travel_date, price,
                                  status, booking_expiry, qr_verification_link, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(booking.id)
        .bind(&booking.user_id)
        .bind(booking.vehicle_id)
        .bind(booking.route_id)
        .bind(booking.seat_number as i32)
        .bind(booking.travel_date)
        .bind(booking.price)
        .bind(booking.status.as_str())
        .bind(booking.booking_expiry)
        .bind(&booking.qr_verification_link)
        .bind(booking.created_at)
        .bind(booking.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> RepoResult<Option<Booking>> {
        let row = sqlx::query_as::<_, BookingRow>(&format!(
            "SELECT {} FROM bookings WHERE id = $1",
            BOOKING_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Booking::try_from).transpose()
    }

    async fn delete(&self, id: Uuid) -> RepoResult<()> {
        sqlx::query("DELETE FROM bookings WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn transition(
        &self,
        id: Uuid,
        from: BookingStatus,
        to: BookingStatus,
        at: DateTime<Utc>,
    ) -> RepoResult<bool> {
        let result = sqlx::query(
            "UPDATE bookings SET status = $3, updated_at = $4 WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_qr_link(&self, id: Uuid, link: &str) -> RepoResult<()> {
        sqlx::query("UPDATE bookings SET qr_verification_link = $2 WHERE id = $1")
            .bind(id)
            .bind(link)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn confirmed_seats(&self, vehicle_id: Uuid, travel_date: NaiveDate) -> RepoResult<Vec<u32>> {
        let seats: Vec<i32> = sqlx::query_scalar(
            r#"
            SELECT seat_number FROM bookings
            WHERE vehicle_id = $1 AND travel_date = $2 AND status = 'confirmed'
            ORDER BY seat_number
            "#,
        )
        .bind(vehicle_id)
        .bind(travel_date)
        .fetch_all(&self.pool)
        .await?;
        Ok(seats.into_iter().map(|s| s as u32).collect())
    }

    async fn list_for_user(&self, user_id: &str, status: BookingStatus) -> RepoResult<Vec<Booking>> {
        let rows = sqlx::query_as::<_, BookingRow>(&format!(
            "SELECT {} FROM bookings WHERE user_id = $1 AND status = $2 ORDER BY created_at",
            BOOKING_COLUMNS
        ))
        .bind(user_id)
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        into_bookings(rows)
    }

    async fn list_overdue(&self, now: DateTime<Utc>) -> RepoResult<Vec<Booking>> {
        let rows = sqlx::query_as::<_, BookingRow>(&format!(
            "SELECT {} FROM bookings WHERE status = 'pending' AND booking_expiry <= $1",
            BOOKING_COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        into_bookings(rows)
    }

    async fn record_reconciliation(&self, case: &ReconciliationCase) -> RepoResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_reconciliations
                (id, booking_id, user_id, amount, transaction_reference, booking_expiry, detected_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(case.id)
        .bind(case.booking_id)
        .bind(&case.user_id)
        .bind(case.amount)
        .bind(&case.transaction_reference)
        .bind(case.booking_expiry)
        .bind(case.detected_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_reconciliations(&self) -> RepoResult<Vec<ReconciliationCase>> {
        let rows = sqlx::query_as::<_, ReconciliationRow>(
            r#"
            SELECT id, booking_id, user_id, amount, transaction_reference, booking_expiry, detected_at
            FROM payment_reconciliations
            ORDER BY detected_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ReconciliationCase::from).collect())
    }
}

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::models::{
    BookedSeat, Booking, BookingStatus, Occupancy, ReconciliationCase, Route, SeatHold, SeatKey,
    SeatSlot, Vehicle,
};
use crate::ReservationResult;

pub type RepoResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Result of a compare-and-set acquire on a seat key.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquireOutcome {
    Acquired(SeatHold),
    /// The caller already owns a live hold; nothing was written.
    AlreadyHeld(SeatHold),
    HeldByOther(SeatHold),
    Booked(BookedSeat),
}

/// Result of turning a live hold into a pending booking.
#[derive(Debug, Clone, PartialEq)]
pub enum PromoteOutcome {
    Promoted(SeatHold),
    /// Promoted earlier by the same holder; carries the existing booking id.
    AlreadyPromoted(SeatHold),
    /// No live hold on the key (never acquired, released, or lapsed).
    Missing,
    HeldByOther(SeatHold),
    Booked(BookedSeat),
}

/// Per-seat slot storage. Every method is a single atomic step on one key;
/// implementations must never split a compare from its write.
#[async_trait]
pub trait SeatLockStore: Send + Sync {
    async fn get(&self, key: &SeatKey) -> RepoResult<Option<SeatSlot>>;

    /// Writes `hold` if the key is free, expired, or already ours.
    async fn try_acquire(&self, hold: SeatHold, now: DateTime<Utc>) -> RepoResult<AcquireOutcome>;

    async fn promote(
        &self,
        key: &SeatKey,
        holder: &str,
        booking_id: Uuid,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepoResult<PromoteOutcome>;

    /// Turns the live hold tagged with `booking_id` into a permanent booked
    /// slot. True if the slot is (now) booked under that id.
    async fn mark_booked(
        &self,
        key: &SeatKey,
        booking_id: Uuid,
        now: DateTime<Utc>,
    ) -> RepoResult<bool>;

    /// Drops an unpromoted hold owned by `holder`.
    async fn release_hold(&self, key: &SeatKey, holder: &str) -> RepoResult<bool>;

    /// Drops whatever slot is tagged with `booking_id`, held or booked.
    async fn release_booking(&self, key: &SeatKey, booking_id: Uuid) -> RepoResult<bool>;

    /// Every slot on a vehicle for a travel date, expired ones included.
    async fn list(&self, vehicle_id: Uuid, travel_date: NaiveDate) -> RepoResult<Vec<SeatSlot>>;

    /// Physically removes expired holds and returns their keys.
    async fn evict_expired(&self, now: DateTime<Utc>) -> RepoResult<Vec<SeatKey>>;
}

#[async_trait]
pub trait BookingRepository: Send + Sync {
    async fn insert(&self, booking: &Booking) -> RepoResult<()>;

    async fn get(&self, id: Uuid) -> RepoResult<Option<Booking>>;

    async fn delete(&self, id: Uuid) -> RepoResult<()>;

    /// Compare-and-set on status. False if the booking was not in `from`.
    async fn transition(
        &self,
        id: Uuid,
        from: BookingStatus,
        to: BookingStatus,
        at: DateTime<Utc>,
    ) -> RepoResult<bool>;

    async fn set_qr_link(&self, id: Uuid, link: &str) -> RepoResult<()>;

    async fn confirmed_seats(&self, vehicle_id: Uuid, travel_date: NaiveDate) -> RepoResult<Vec<u32>>;

    async fn list_for_user(&self, user_id: &str, status: BookingStatus) -> RepoResult<Vec<Booking>>;

    /// Pending bookings whose expiry is at or before `now`.
    async fn list_overdue(&self, now: DateTime<Utc>) -> RepoResult<Vec<Booking>>;

    async fn record_reconciliation(&self, case: &ReconciliationCase) -> RepoResult<()>;

    async fn list_reconciliations(&self) -> RepoResult<Vec<ReconciliationCase>>;
}

/// Read-only route and vehicle data; administered elsewhere.
#[async_trait]
pub trait CatalogRepository: Send + Sync {
    async fn list_routes(&self) -> RepoResult<Vec<Route>>;

    async fn get_route(&self, id: Uuid) -> RepoResult<Option<Route>>;

    async fn list_vehicles(&self, route_id: Uuid) -> RepoResult<Vec<Vehicle>>;

    async fn get_vehicle(&self, id: Uuid) -> RepoResult<Option<Vehicle>>;
}

/// Seat counts the inventory needs without knowing how locks are kept.
#[async_trait]
pub trait SeatOccupancy: Send + Sync {
    /// Confirmed seats plus live holds, the latter excluding `caller`'s own.
    async fn occupancy(
        &self,
        vehicle_id: Uuid,
        travel_date: NaiveDate,
        caller: Option<&str>,
    ) -> ReservationResult<Occupancy>;
}

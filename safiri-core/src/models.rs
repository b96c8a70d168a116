use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Default lifetime of a seat hold.
pub const DEFAULT_HOLD_TTL_SECONDS: i64 = 900;
/// Grace period a pending booking has to get paid.
pub const DEFAULT_BOOKING_HOLD_SECONDS: i64 = 900;
pub const CURRENCY: &str = "KES";

// ============================================================================
// Catalog
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub id: Uuid,
    pub origin: String,
    pub destination: String,
    pub pickup_point: String,
    pub dropping_point: String,
    pub distance_km: f64,
    pub estimated_duration_minutes: u32,
    pub base_price: i32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VehicleStatus {
    Active,
    Maintenance,
    Full,
    Cancelled,
}

impl VehicleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleStatus::Active => "active",
            VehicleStatus::Maintenance => "maintenance",
            VehicleStatus::Full => "full",
            VehicleStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for VehicleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(VehicleStatus::Active),
            "maintenance" => Ok(VehicleStatus::Maintenance),
            "full" => Ok(VehicleStatus::Full),
            "cancelled" => Ok(VehicleStatus::Cancelled),
            other => Err(format!("unknown vehicle status: {}", other)),
        }
    }
}

/// One scheduled vehicle (matatu) on a route.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Vehicle {
    pub id: Uuid,
    pub route_id: Uuid,
    pub registration_number: String,
    pub total_seats: u32,
    pub departure_time: NaiveTime,
    pub current_price: Option<i32>,
    pub status: VehicleStatus,
    pub seat_layout: Vec<u32>,
}

impl Vehicle {
    /// Seats numbered 1..=total_seats.
    pub fn default_layout(total_seats: u32) -> Vec<u32> {
        (1..=total_seats).collect()
    }

    pub fn has_seat(&self, seat_number: u32) -> bool {
        self.seat_layout.contains(&seat_number)
    }

    pub fn is_bookable(&self) -> bool {
        self.status == VehicleStatus::Active
    }
}

// ============================================================================
// Seat slots
// ============================================================================

/// The contended resource: one seat on one vehicle on one travel date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatKey {
    pub vehicle_id: Uuid,
    pub travel_date: NaiveDate,
    pub seat_number: u32,
}

impl SeatKey {
    pub fn new(vehicle_id: Uuid, travel_date: NaiveDate, seat_number: u32) -> Self {
        Self {
            vehicle_id,
            travel_date,
            seat_number,
        }
    }

    /// Midnight UTC after the travel date. A confirmed seat stops mattering
    /// to the lock store from here on.
    pub fn travel_day_end(&self) -> DateTime<Utc> {
        let next_day = self.travel_date.succ_opt().unwrap_or(self.travel_date);
        next_day.and_time(NaiveTime::MIN).and_utc()
    }
}

impl fmt::Display for SeatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.vehicle_id, self.travel_date, self.seat_number)
    }
}

/// A time-bounded claim on a seat. Once promoted, `booking_id` names the
/// pending booking and `expires_at` follows the booking expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatHold {
    #[serde(flatten)]
    pub key: SeatKey,
    pub holder_user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub booking_id: Option<Uuid>,
}

impl SeatHold {
    pub fn new(key: SeatKey, holder_user_id: &str, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            key,
            holder_user_id: holder_user_id.to_string(),
            created_at: now,
            expires_at: now + ttl,
            booking_id: None,
        }
    }

    /// A hold is live strictly before its expiry instant.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn is_promoted(&self) -> bool {
        self.booking_id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookedSeat {
    pub key: SeatKey,
    pub booking_id: Uuid,
    pub user_id: String,
}

/// Contents of a single seat key in the lock store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum SeatSlot {
    Held(SeatHold),
    Booked(BookedSeat),
}

impl SeatSlot {
    pub fn key(&self) -> &SeatKey {
        match self {
            SeatSlot::Held(hold) => &hold.key,
            SeatSlot::Booked(seat) => &seat.key,
        }
    }

    pub fn owner(&self) -> &str {
        match self {
            SeatSlot::Held(hold) => &hold.holder_user_id,
            SeatSlot::Booked(seat) => &seat.user_id,
        }
    }

    /// Expired holds are inert; booked seats last until their travel day is over.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        match self {
            SeatSlot::Held(hold) => hold.is_live(now),
            SeatSlot::Booked(seat) => now < seat.key.travel_day_end(),
        }
    }
}

/// Seat usage on one vehicle for one travel date.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Occupancy {
    pub confirmed: u32,
    pub held: u32,
}

// ============================================================================
// Bookings
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Expired,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Expired => "expired",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "expired" => Ok(BookingStatus::Expired),
            "cancelled" => Ok(BookingStatus::Cancelled),
            other => Err(format!("unknown booking status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub id: Uuid,
    pub user_id: String,
    pub vehicle_id: Uuid,
    pub route_id: Uuid,
    pub seat_number: u32,
    pub travel_date: NaiveDate,
    /// Frozen at creation.
    pub price: i32,
    pub status: BookingStatus,
    pub booking_expiry: DateTime<Utc>,
    pub qr_verification_link: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn seat_key(&self) -> SeatKey {
        SeatKey::new(self.vehicle_id, self.travel_date, self.seat_number)
    }

    /// Pending and past its expiry, whether or not anyone has noticed yet.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == BookingStatus::Pending && now >= self.booking_expiry
    }
}

/// Input to `BookingLedger::create_booking`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub vehicle_id: Uuid,
    pub route_id: Uuid,
    pub seat_number: u32,
    pub travel_date: NaiveDate,
    pub user_id: String,
    pub price: i32,
}

impl NewBooking {
    pub fn seat_key(&self) -> SeatKey {
        SeatKey::new(self.vehicle_id, self.travel_date, self.seat_number)
    }
}

/// A payment that succeeded after its booking expired. Settled out of band
/// (refund), never by confirming the booking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationCase {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub user_id: String,
    pub amount: i32,
    pub transaction_reference: Option<String>,
    pub booking_expiry: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
}

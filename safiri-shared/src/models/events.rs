use chrono::NaiveDate;
use uuid::Uuid;

/// What happened to a seat slot.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeatEventKind {
    Held,
    Released,
    Pending,
    Booked,
    Expired,
}

/// Broadcast whenever a seat changes hands. Consumers treat it as a hint to
/// re-query availability, never as the source of truth.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SeatEvent {
    pub vehicle_id: Uuid,
    pub travel_date: NaiveDate,
    pub seat_number: u32,
    pub kind: SeatEventKind,
    pub booking_id: Option<Uuid>,
    pub occurred_at: i64,
}

impl SeatEvent {
    pub fn new(
        vehicle_id: Uuid,
        travel_date: NaiveDate,
        seat_number: u32,
        kind: SeatEventKind,
        occurred_at: i64,
    ) -> Self {
        Self {
            vehicle_id,
            travel_date,
            seat_number,
            kind,
            booking_id: None,
            occurred_at,
        }
    }

    pub fn with_booking(mut self, booking_id: Uuid) -> Self {
        self.booking_id = Some(booking_id);
        self
    }
}

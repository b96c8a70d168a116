pub mod clock;
pub mod models;
pub mod payment;
pub mod repository;

pub use clock::{Clock, ManualClock, SystemClock};
pub use models::{
    BookedSeat, Booking, BookingStatus, NewBooking, Occupancy, ReconciliationCase, Route,
    SeatHold, SeatKey, SeatSlot, Vehicle, VehicleStatus,
};

use uuid::Uuid;

/// Why a charge did not go through. All of these are recoverable: the
/// payer may retry until the booking expires.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PaymentFailure {
    #[error("Payment declined: {0}")]
    Declined(String),
    #[error("Payment gateway timed out")]
    Timeout,
    #[error("Payment gateway error: {0}")]
    Gateway(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ReservationError {
    #[error("Seat {seat_number} is no longer available, choose another seat")]
    SeatUnavailable { seat_number: u32 },

    #[error("Seat {seat_number} is already booked")]
    SeatAlreadyBooked { seat_number: u32 },

    #[error("Your hold on seat {seat_number} expired, please restart seat selection")]
    HoldExpired { seat_number: u32 },

    #[error(transparent)]
    PaymentFailed(#[from] PaymentFailure),

    #[error("Booking {0} has expired")]
    BookingExpired(Uuid),

    #[error("Payment for booking {booking_id} arrived after the booking expired and needs reconciliation")]
    ReconciliationRequired {
        booking_id: Uuid,
        transaction_reference: Option<String>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Vehicle unavailable: {0}")]
    VehicleUnavailable(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl ReservationError {
    /// Conflicts and payment failures are ordinary outcomes the caller is
    /// expected to react to; everything else is a bug or an outage.
    pub fn is_expected(&self) -> bool {
        !matches!(self, ReservationError::Storage(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ReservationError::PaymentFailed(_))
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for ReservationError {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        ReservationError::Storage(err.to_string())
    }
}

pub type ReservationResult<T> = Result<T, ReservationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_facing_messages_distinguish_conflict_from_expiry() {
        let taken = ReservationError::SeatUnavailable { seat_number: 5 };
        let lapsed = ReservationError::HoldExpired { seat_number: 5 };

        assert!(taken.to_string().contains("choose another seat"));
        assert!(lapsed.to_string().contains("restart seat selection"));
    }

    #[test]
    fn test_payment_failures_are_retryable() {
        let err: ReservationError = PaymentFailure::Timeout.into();
        assert!(err.is_retryable());
        assert!(err.is_expected());

        let storage: ReservationError =
            Box::<dyn std::error::Error + Send + Sync>::from("connection reset").into();
        assert!(!storage.is_expected());
        assert!(!ReservationError::BookingExpired(Uuid::new_v4()).is_retryable());
    }
}

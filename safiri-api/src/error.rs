use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use safiri_core::{PaymentFailure, ReservationError};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Reservation(#[from] ReservationError),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthenticated(String),
}

impl AppError {
    /// Status and machine-readable code. Clients branch on the code: a
    /// taken seat means "choose another", a lapsed hold means "start over".
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            AppError::Unauthenticated(_) => (StatusCode::UNAUTHORIZED, "UNAUTHENTICATED"),
            AppError::Reservation(err) => match err {
                ReservationError::SeatUnavailable { .. } => (StatusCode::CONFLICT, "SEAT_UNAVAILABLE"),
                ReservationError::SeatAlreadyBooked { .. } => {
                    (StatusCode::CONFLICT, "SEAT_ALREADY_BOOKED")
                }
                ReservationError::HoldExpired { .. } => (StatusCode::GONE, "HOLD_EXPIRED"),
                ReservationError::BookingExpired(_) => (StatusCode::GONE, "BOOKING_EXPIRED"),
                ReservationError::PaymentFailed(PaymentFailure::Declined(_)) => {
                    (StatusCode::PAYMENT_REQUIRED, "PAYMENT_DECLINED")
                }
                ReservationError::PaymentFailed(PaymentFailure::Timeout) => {
                    (StatusCode::GATEWAY_TIMEOUT, "PAYMENT_TIMEOUT")
                }
                ReservationError::PaymentFailed(PaymentFailure::Gateway(_)) => {
                    (StatusCode::BAD_GATEWAY, "PAYMENT_GATEWAY_ERROR")
                }
                ReservationError::ReconciliationRequired { .. } => {
                    (StatusCode::CONFLICT, "PAYMENT_RECONCILIATION_REQUIRED")
                }
                ReservationError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                ReservationError::Unauthorized(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
                ReservationError::InvalidState(_) => (StatusCode::CONFLICT, "INVALID_STATE"),
                ReservationError::VehicleUnavailable(_) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "VEHICLE_UNAVAILABLE")
                }
                ReservationError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_FAILED"),
                ReservationError::Storage(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
                }
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = if status.is_server_error() && !matches!(
            self,
            AppError::Reservation(ReservationError::PaymentFailed(_))
        ) {
            tracing::error!("Internal Server Error: {}", self);
            "Internal Server Error".to_string()
        } else {
            self.to_string()
        };

        let mut body = json!({
            "error": message,
            "code": code,
        });
        if let AppError::Reservation(ReservationError::ReconciliationRequired {
            booking_id,
            transaction_reference,
        }) = &self
        {
            body["bookingId"] = json!(booking_id);
            body["transactionReference"] = json!(transaction_reference);
        }

        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_conflict_and_expiry_are_distinguishable() {
        let taken = AppError::from(ReservationError::SeatUnavailable { seat_number: 5 });
        let lapsed = AppError::from(ReservationError::HoldExpired { seat_number: 5 });
        assert_eq!(taken.status_and_code(), (StatusCode::CONFLICT, "SEAT_UNAVAILABLE"));
        assert_eq!(lapsed.status_and_code(), (StatusCode::GONE, "HOLD_EXPIRED"));
    }

    #[test]
    fn test_payment_failures_map_to_gateway_statuses() {
        let declined = AppError::from(ReservationError::from(PaymentFailure::Declined("no".into())));
        let timeout = AppError::from(ReservationError::from(PaymentFailure::Timeout));
        assert_eq!(declined.status_and_code().0, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(timeout.status_and_code().0, StatusCode::GATEWAY_TIMEOUT);

        let late = AppError::from(ReservationError::ReconciliationRequired {
            booking_id: Uuid::new_v4(),
            transaction_reference: Some("MP123".into()),
        });
        assert_eq!(late.status_and_code().1, "PAYMENT_RECONCILIATION_REQUIRED");
    }
}

use axum::{extract::State, middleware, routing::post, Json, Router};
use safiri_booking::{PaymentReceipt, SettleRequest};
use safiri_core::ReservationError;
use safiri_shared::Masked;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::metrics::outcome_label;
use crate::middleware::{payment_circuit_breaker, Caller};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmPaymentRequest {
    pub booking_id: Uuid,
    pub amount: i32,
    /// M-Pesa number to charge; the gateway may prompt for it otherwise.
    pub phone_number: Option<Masked<String>>,
}

pub fn routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/payments/confirm", post(confirm_payment))
        .route_layer(middleware::from_fn_with_state(state, payment_circuit_breaker))
}

pub(crate) fn record_payment(state: &AppState, result: Result<&PaymentReceipt, &ReservationError>) {
    let outcome = match result {
        Ok(receipt) if receipt.already_confirmed => "already_confirmed",
        Ok(_) => "confirmed",
        Err(e) => outcome_label(e),
    };
    state.metrics.payments_total.with_label_values(&[outcome]).inc();
}

/// POST /payments/confirm
/// Charges the payer and confirms the booking. Safe to retry: a booking
/// that is already confirmed returns its receipt without a second charge,
/// and a retry while the first charge is still running gets a 409.
async fn confirm_payment(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Json(req): Json<ConfirmPaymentRequest>,
) -> ApiResult<Json<PaymentReceipt>> {
    let result = state
        .payments
        .settle(SettleRequest {
            booking_id: req.booking_id,
            user_id,
            amount: req.amount,
            phone_number: req.phone_number,
        })
        .await;
    record_payment(&state, result.as_ref());

    Ok(Json(result?))
}

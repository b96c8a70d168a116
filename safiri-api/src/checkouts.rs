use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use safiri_booking::{Checkout, PaymentReceipt};
use safiri_shared::Masked;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::metrics::outcome_label;
use crate::middleware::{payment_circuit_breaker, Caller};
use crate::payments::record_payment;
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartCheckoutRequest {
    pub route_id: Uuid,
    pub travel_date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectVehicleRequest {
    pub vehicle_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectSeatRequest {
    pub seat_number: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutPaymentRequest {
    pub amount: i32,
    pub phone_number: Option<Masked<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutPaymentResponse {
    pub checkout: Checkout,
    pub receipt: PaymentReceipt,
}

// ============================================================================
// Routes
// ============================================================================

pub fn routes(state: AppState) -> Router<AppState> {
    let payment = Router::new()
        .route("/checkouts/{id}/payment", post(pay))
        .route_layer(middleware::from_fn_with_state(state, payment_circuit_breaker));

    Router::new()
        .route("/checkouts", post(start))
        .route("/checkouts/{id}", get(get_checkout))
        .route("/checkouts/{id}/vehicle", post(select_vehicle))
        .route("/checkouts/{id}/seat", post(hold_seat))
        .route("/checkouts/{id}/booking", post(create_booking))
        .route("/checkouts/{id}/cancel", post(cancel))
        .merge(payment)
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /checkouts
async fn start(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Json(req): Json<StartCheckoutRequest>,
) -> ApiResult<(StatusCode, Json<Checkout>)> {
    let checkout = state
        .workflow
        .start(&user_id, req.route_id, req.travel_date)
        .await?;
    Ok((StatusCode::CREATED, Json(checkout)))
}

/// GET /checkouts/{id}
async fn get_checkout(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Checkout>> {
    Ok(Json(state.workflow.get(id, &user_id).await?))
}

/// POST /checkouts/{id}/vehicle
async fn select_vehicle(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(id): Path<Uuid>,
    Json(req): Json<SelectVehicleRequest>,
) -> ApiResult<Json<Checkout>> {
    Ok(Json(
        state.workflow.select_vehicle(id, &user_id, req.vehicle_id).await?,
    ))
}

/// POST /checkouts/{id}/seat
async fn hold_seat(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(id): Path<Uuid>,
    Json(req): Json<SelectSeatRequest>,
) -> ApiResult<Json<Checkout>> {
    let result = state.workflow.hold_seat(id, &user_id, req.seat_number).await;
    let outcome = match &result {
        Ok(_) => "acquired",
        Err(e) => outcome_label(e),
    };
    state.metrics.holds_total.with_label_values(&[outcome]).inc();
    Ok(Json(result?))
}

/// POST /checkouts/{id}/booking
async fn create_booking(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Checkout>> {
    let result = state.workflow.create_booking(id, &user_id).await;
    let outcome = match &result {
        Ok(_) => "pending",
        Err(e) => outcome_label(e),
    };
    state.metrics.bookings_total.with_label_values(&[outcome]).inc();
    Ok(Json(result?))
}

/// POST /checkouts/{id}/payment
async fn pay(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(id): Path<Uuid>,
    Json(req): Json<CheckoutPaymentRequest>,
) -> ApiResult<Json<CheckoutPaymentResponse>> {
    let result = state
        .workflow
        .pay(id, &user_id, req.amount, req.phone_number)
        .await;
    record_payment(&state, result.as_ref().map(|(_, receipt)| receipt));
    let (checkout, receipt) = result?;
    Ok(Json(CheckoutPaymentResponse { checkout, receipt }))
}

/// POST /checkouts/{id}/cancel
async fn cancel(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Checkout>> {
    Ok(Json(state.workflow.cancel(id, &user_id).await?))
}

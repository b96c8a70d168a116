use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use safiri_catalog::{check_quote, QuoteCheck};
use safiri_core::models::{Booking, NewBooking};
use safiri_core::ReservationError;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::metrics::outcome_label;
use crate::middleware::Caller;
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityQuery {
    pub vehicle_id: Uuid,
    pub seat_number: u32,
    pub travel_date: NaiveDate,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityResponse {
    pub vehicle_id: Uuid,
    pub seat_number: u32,
    pub travel_date: NaiveDate,
    pub available: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookedSeatsResponse {
    pub vehicle_id: Uuid,
    pub travel_date: NaiveDate,
    pub booked_seats: Vec<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookSeatRequest {
    pub vehicle_id: Uuid,
    pub route_id: Uuid,
    pub seat_number: u32,
    pub travel_date: NaiveDate,
    /// What the client displayed. The server computes the fare itself.
    pub price: Option<i32>,
}

// ============================================================================
// Routes
// ============================================================================

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/bookings/check-availability", get(check_availability))
        .route("/bookings/booked-seats/{vehicle_id}/{date}", get(booked_seats))
        .route("/bookings/temporary/{vehicle_id}", get(temporary_bookings))
        .route("/bookings/book", post(book_seat))
        .route("/bookings/{id}", get(get_booking))
        .route("/bookings/{id}/cancel", post(cancel_booking))
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /bookings/check-availability?vehicleId&seatNumber&travelDate
async fn check_availability(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Query(query): Query<AvailabilityQuery>,
) -> ApiResult<Json<AvailabilityResponse>> {
    let available = state
        .locks
        .check_availability(
            query.vehicle_id,
            query.seat_number,
            query.travel_date,
            Some(&user_id),
        )
        .await?;

    Ok(Json(AvailabilityResponse {
        vehicle_id: query.vehicle_id,
        seat_number: query.seat_number,
        travel_date: query.travel_date,
        available,
    }))
}

/// GET /bookings/booked-seats/{vehicleId}/{date}
/// Confirmed seats only; holds and pending bookings are not listed.
async fn booked_seats(
    State(state): State<AppState>,
    Path((vehicle_id, travel_date)): Path<(Uuid, NaiveDate)>,
) -> ApiResult<Json<BookedSeatsResponse>> {
    let booked_seats = state.ledger.get_booked_seats(vehicle_id, travel_date).await?;
    Ok(Json(BookedSeatsResponse {
        vehicle_id,
        travel_date,
        booked_seats,
    }))
}

/// GET /bookings/temporary/{vehicleId}
/// The caller's unpaid bookings on this vehicle that are still payable.
async fn temporary_bookings(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(vehicle_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Booking>>> {
    let pending = state
        .ledger
        .get_user_temporary_bookings(&user_id)
        .await?
        .into_iter()
        .filter(|b| b.vehicle_id == vehicle_id)
        .collect();
    Ok(Json(pending))
}

/// POST /bookings/book
/// Holds the seat (idempotent for its holder) and turns the hold into a
/// pending booking at the frozen fare.
async fn book_seat(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Json(req): Json<BookSeatRequest>,
) -> ApiResult<(StatusCode, Json<Booking>)> {
    let result = book(&state, &user_id, req).await;
    let outcome = match &result {
        Ok(_) => "pending",
        Err(e) => outcome_label(e),
    };
    state.metrics.bookings_total.with_label_values(&[outcome]).inc();

    Ok((StatusCode::CREATED, Json(result?)))
}

async fn book(
    state: &AppState,
    user_id: &str,
    req: BookSeatRequest,
) -> Result<Booking, ReservationError> {
    let selection = state
        .inventory
        .select_seat(req.vehicle_id, req.seat_number, req.travel_date)
        .await?;
    if selection.vehicle.route_id != req.route_id {
        return Err(ReservationError::Validation(format!(
            "vehicle {} does not serve route {}",
            req.vehicle_id, req.route_id
        )));
    }
    if let QuoteCheck::Mismatch { quoted, fare } = check_quote(req.price, selection.fare) {
        warn!(
            "Client quoted {} for seat {} on {}, booking at {}",
            quoted, req.seat_number, selection.vehicle.registration_number, fare
        );
    }

    state
        .locks
        .acquire_hold(req.vehicle_id, req.seat_number, req.travel_date, user_id, None)
        .await?;
    let booking = state
        .ledger
        .create_booking(NewBooking {
            vehicle_id: req.vehicle_id,
            route_id: req.route_id,
            seat_number: req.seat_number,
            travel_date: req.travel_date,
            user_id: user_id.to_string(),
            price: selection.fare,
        })
        .await?;
    info!("Booking {} created by {}", booking.id, user_id);
    Ok(booking)
}

/// GET /bookings/{id}
async fn get_booking(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(booking_id): Path<Uuid>,
) -> ApiResult<Json<Booking>> {
    let booking = state.ledger.get_booking(booking_id).await?;
    if booking.user_id != user_id {
        return Err(ReservationError::Unauthorized(format!(
            "booking {} belongs to another user",
            booking_id
        ))
        .into());
    }
    Ok(Json(booking))
}

/// POST /bookings/{id}/cancel
async fn cancel_booking(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(booking_id): Path<Uuid>,
) -> ApiResult<Json<Booking>> {
    Ok(Json(state.ledger.cancel_booking(booking_id, &user_id).await?))
}

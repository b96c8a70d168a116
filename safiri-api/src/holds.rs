use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use futures_util::{Stream, StreamExt};
use safiri_booking::HoldOutcome;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::metrics::outcome_label;
use crate::middleware::Caller;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatHoldRequest {
    pub vehicle_id: Uuid,
    pub seat_number: u32,
    pub travel_date: NaiveDate,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatHoldResponse {
    pub vehicle_id: Uuid,
    pub seat_number: u32,
    pub travel_date: NaiveDate,
    pub status: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub released: bool,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/bookings/hold", post(create_seat_hold).delete(release_seat_hold))
        .route("/vehicles/{id}/seats/stream", get(seat_stream))
}

/// POST /bookings/hold
async fn create_seat_hold(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Json(req): Json<SeatHoldRequest>,
) -> ApiResult<Json<SeatHoldResponse>> {
    let result = async {
        state
            .inventory
            .select_seat(req.vehicle_id, req.seat_number, req.travel_date)
            .await?;
        state
            .locks
            .acquire_hold(req.vehicle_id, req.seat_number, req.travel_date, &user_id, None)
            .await
    }
    .await;

    let outcome = match &result {
        Ok(HoldOutcome::Acquired(_)) => "acquired",
        Ok(HoldOutcome::AlreadyHeldByCaller(_)) => "already_held",
        Err(e) => outcome_label(e),
    };
    state.metrics.holds_total.with_label_values(&[outcome]).inc();

    let status = match &result {
        Ok(HoldOutcome::AlreadyHeldByCaller(_)) => "ALREADY_HELD",
        _ => "HELD",
    };
    let hold = result?.into_hold();
    Ok(Json(SeatHoldResponse {
        vehicle_id: req.vehicle_id,
        seat_number: req.seat_number,
        travel_date: req.travel_date,
        status: status.to_string(),
        expires_at: hold.expires_at,
    }))
}

/// DELETE /bookings/hold?vehicleId&seatNumber&travelDate
/// Called when the rider navigates away. Releasing a hold that already
/// lapsed, or someone else's, is a no-op.
async fn release_seat_hold(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Query(req): Query<SeatHoldRequest>,
) -> ApiResult<Json<ReleaseResponse>> {
    let released = state
        .locks
        .release_hold(req.vehicle_id, req.travel_date, req.seat_number, &user_id)
        .await?;
    Ok(Json(ReleaseResponse { released }))
}

/// GET /vehicles/{id}/seats/stream
/// Server-sent seat changes for one vehicle. Advisory: clients re-query
/// availability on each event instead of trusting the payload.
async fn seat_stream(
    State(state): State<AppState>,
    Caller(_user_id): Caller,
    Path(vehicle_id): Path<Uuid>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.locks.subscribe();

    let stream = BroadcastStream::new(rx).filter_map(move |result| async move {
        match result {
            Ok(event) if event.vehicle_id == vehicle_id => Event::default()
                .event("seat")
                .json_data(&event)
                .ok()
                .map(Ok),
            // Other vehicles, or a lagging receiver that skipped events.
            _ => None,
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

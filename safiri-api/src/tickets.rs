use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use safiri_booking::{Ticket, TicketVerification};
use safiri_core::ReservationError;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::middleware::Caller;
use crate::state::AppState;

/// Needs a rider token.
pub fn routes() -> Router<AppState> {
    Router::new().route("/bookings/{id}/ticket", get(get_ticket))
}

/// Scanned by conductors; the signed token is the credential.
pub fn public_routes() -> Router<AppState> {
    Router::new().route("/tickets/verify/{token}", get(verify_ticket))
}

/// GET /bookings/{id}/ticket
async fn get_ticket(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(booking_id): Path<Uuid>,
) -> ApiResult<Json<Ticket>> {
    let booking = state.ledger.get_booking(booking_id).await?;
    if booking.user_id != user_id {
        return Err(ReservationError::Unauthorized(format!(
            "booking {} belongs to another user",
            booking_id
        ))
        .into());
    }
    Ok(Json(state.tickets.issue_ticket(booking_id).await?))
}

/// GET /tickets/verify/{token}
async fn verify_ticket(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> ApiResult<Json<TicketVerification>> {
    Ok(Json(state.tickets.verify(&token).await?))
}

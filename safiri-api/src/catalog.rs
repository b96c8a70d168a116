use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use safiri_catalog::VehicleAvailability;
use safiri_core::models::Route;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::middleware::MaybeCaller;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TravelDateQuery {
    pub travel_date: Option<NaiveDate>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/routes", get(list_routes))
        .route("/routes/{id}", get(get_route))
        .route("/routes/{id}/vehicles", get(list_vehicles))
        .route("/vehicles/{id}", get(get_vehicle))
}

/// GET /routes
async fn list_routes(State(state): State<AppState>) -> ApiResult<Json<Vec<Route>>> {
    Ok(Json(state.routes.list_routes().await?))
}

/// GET /routes/{id}
async fn get_route(
    State(state): State<AppState>,
    Path(route_id): Path<Uuid>,
) -> ApiResult<Json<Route>> {
    Ok(Json(state.routes.get_route(route_id).await?))
}

/// GET /routes/{id}/vehicles?travelDate=YYYY-MM-DD
/// Seat counts leave out the caller's own holds when a token is sent.
async fn list_vehicles(
    State(state): State<AppState>,
    Path(route_id): Path<Uuid>,
    Query(query): Query<TravelDateQuery>,
    caller: MaybeCaller,
) -> ApiResult<Json<Vec<VehicleAvailability>>> {
    let vehicles = state
        .inventory
        .list_vehicles(route_id, query.travel_date, caller.as_deref())
        .await?;
    Ok(Json(vehicles))
}

/// GET /vehicles/{id}?travelDate=YYYY-MM-DD
async fn get_vehicle(
    State(state): State<AppState>,
    Path(vehicle_id): Path<Uuid>,
    Query(query): Query<TravelDateQuery>,
    caller: MaybeCaller,
) -> ApiResult<Json<VehicleAvailability>> {
    let travel_date = query.travel_date.unwrap_or_else(|| state.clock.today());
    let vehicle = state
        .inventory
        .vehicle_availability(vehicle_id, travel_date, caller.as_deref())
        .await?;
    Ok(Json(vehicle))
}

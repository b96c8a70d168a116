use chrono::NaiveDate;
use safiri_core::clock::Clock;
use safiri_core::models::{Route, Vehicle};
use safiri_core::repository::{CatalogRepository, SeatOccupancy};
use safiri_core::{ReservationError, ReservationResult};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::pricing::frozen_fare;

/// A vehicle as listed to a rider: seat counts are for one travel date and
/// exclude the rider's own holds.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VehicleAvailability {
    #[serde(flatten)]
    pub vehicle: Vehicle,
    pub travel_date: NaiveDate,
    pub available_seats: u32,
    pub fare: i32,
}

/// A seat request that passed validation, with everything needed to book it.
#[derive(Debug, Clone, PartialEq)]
pub struct SeatSelection {
    pub vehicle: Vehicle,
    pub route: Route,
    pub fare: i32,
}

/// Per-trip vehicle metadata and seat availability.
#[derive(Clone)]
pub struct VehicleInventory {
    repo: Arc<dyn CatalogRepository>,
    occupancy: Arc<dyn SeatOccupancy>,
    clock: Arc<dyn Clock>,
}

impl VehicleInventory {
    pub fn new(
        repo: Arc<dyn CatalogRepository>,
        occupancy: Arc<dyn SeatOccupancy>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            occupancy,
            clock,
        }
    }

    /// Vehicles on a route with `available_seats` for `travel_date`
    /// (today when not given).
    pub async fn list_vehicles(
        &self,
        route_id: Uuid,
        travel_date: Option<NaiveDate>,
        caller: Option<&str>,
    ) -> ReservationResult<Vec<VehicleAvailability>> {
        let route = self
            .repo
            .get_route(route_id)
            .await?
            .ok_or_else(|| ReservationError::NotFound(format!("route {}", route_id)))?;
        let travel_date = travel_date.unwrap_or_else(|| self.clock.today());

        let vehicles = self.repo.list_vehicles(route_id).await?;
        let mut listed = Vec::with_capacity(vehicles.len());
        for vehicle in vehicles {
            listed.push(self.annotate(vehicle, &route, travel_date, caller).await?);
        }
        Ok(listed)
    }

    pub async fn get_vehicle(&self, id: Uuid) -> ReservationResult<Vehicle> {
        self.repo
            .get_vehicle(id)
            .await?
            .ok_or_else(|| ReservationError::NotFound(format!("vehicle {}", id)))
    }

    pub async fn vehicle_availability(
        &self,
        id: Uuid,
        travel_date: NaiveDate,
        caller: Option<&str>,
    ) -> ReservationResult<VehicleAvailability> {
        let vehicle = self.get_vehicle(id).await?;
        let route = self.route_of(&vehicle).await?;
        self.annotate(vehicle, &route, travel_date, caller).await
    }

    /// Checks that a seat can be requested at all: the vehicle runs, the
    /// seat exists in its layout and the date is not in the past.
    pub async fn select_seat(
        &self,
        vehicle_id: Uuid,
        seat_number: u32,
        travel_date: NaiveDate,
    ) -> ReservationResult<SeatSelection> {
        let vehicle = self.get_vehicle(vehicle_id).await?;
        if !vehicle.is_bookable() {
            return Err(ReservationError::VehicleUnavailable(format!(
                "{} is {}",
                vehicle.registration_number,
                vehicle.status.as_str()
            )));
        }
        if !vehicle.has_seat(seat_number) {
            return Err(ReservationError::Validation(format!(
                "seat {} does not exist on {}",
                seat_number, vehicle.registration_number
            )));
        }
        if travel_date < self.clock.today() {
            return Err(ReservationError::Validation(format!(
                "travel date {} is in the past",
                travel_date
            )));
        }

        let route = self.route_of(&vehicle).await?;
        let fare = frozen_fare(&vehicle, &route);
        Ok(SeatSelection {
            vehicle,
            route,
            fare,
        })
    }

    async fn route_of(&self, vehicle: &Vehicle) -> ReservationResult<Route> {
        self.repo.get_route(vehicle.route_id).await?.ok_or_else(|| {
            ReservationError::NotFound(format!(
                "route {} of vehicle {}",
                vehicle.route_id, vehicle.id
            ))
        })
    }

    async fn annotate(
        &self,
        vehicle: Vehicle,
        route: &Route,
        travel_date: NaiveDate,
        caller: Option<&str>,
    ) -> ReservationResult<VehicleAvailability> {
        let occupancy = self
            .occupancy
            .occupancy(vehicle.id, travel_date, caller)
            .await?;
        let available_seats = vehicle
            .total_seats
            .saturating_sub(occupancy.confirmed)
            .saturating_sub(occupancy.held);
        debug!(
            "vehicle {} on {}: {} confirmed, {} held, {} available",
            vehicle.registration_number,
            travel_date,
            occupancy.confirmed,
            occupancy.held,
            available_seats
        );

        let fare = frozen_fare(&vehicle, route);
        Ok(VehicleAvailability {
            vehicle,
            travel_date,
            available_seats,
            fare,
        })
    }
}

use async_trait::async_trait;
use chrono::NaiveTime;
use safiri_core::models::{Route, Vehicle, VehicleStatus};
use safiri_core::repository::{CatalogRepository, RepoResult};
use serde::Deserialize;
use sqlx::PgPool;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

/// Routes and vehicles loaded once at startup.
#[derive(Debug, Default, Clone)]
pub struct InMemoryCatalogRepository {
    routes: Vec<Route>,
    vehicles: Vec<Vehicle>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogSeed {
    routes: Vec<Route>,
    vehicles: Vec<VehicleSeed>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VehicleSeed {
    id: Uuid,
    route_id: Uuid,
    registration_number: String,
    total_seats: u32,
    departure_time: NaiveTime,
    #[serde(default)]
    current_price: Option<i32>,
    #[serde(default = "default_status")]
    status: VehicleStatus,
    #[serde(default)]
    seat_layout: Option<Vec<u32>>,
}

fn default_status() -> VehicleStatus {
    VehicleStatus::Active
}

impl From<VehicleSeed> for Vehicle {
    fn from(seed: VehicleSeed) -> Self {
        let seat_layout = seed
            .seat_layout
            .unwrap_or_else(|| Vehicle::default_layout(seed.total_seats));
        Vehicle {
            id: seed.id,
            route_id: seed.route_id,
            registration_number: seed.registration_number,
            total_seats: seed.total_seats,
            departure_time: seed.departure_time,
            current_price: seed.current_price,
            status: seed.status,
            seat_layout,
        }
    }
}

impl InMemoryCatalogRepository {
    pub fn new(routes: Vec<Route>, vehicles: Vec<Vehicle>) -> Self {
        Self { routes, vehicles }
    }

    pub fn from_json(raw: &str) -> RepoResult<Self> {
        let seed: CatalogSeed = serde_json::from_str(raw)?;
        for vehicle in &seed.vehicles {
            if !seed.routes.iter().any(|r| r.id == vehicle.route_id) {
                return Err(format!(
                    "vehicle {} references unknown route {}",
                    vehicle.registration_number, vehicle.route_id
                )
                .into());
            }
        }
        Ok(Self {
            routes: seed.routes,
            vehicles: seed.vehicles.into_iter().map(Vehicle::from).collect(),
        })
    }

    pub fn from_seed_file(path: impl AsRef<Path>) -> RepoResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("reading catalog seed {}: {}", path.display(), e))?;
        let catalog = Self::from_json(&raw)?;
        info!(
            "Loaded catalog seed: {} routes, {} vehicles",
            catalog.routes.len(),
            catalog.vehicles.len()
        );
        Ok(catalog)
    }
}

#[async_trait]
impl CatalogRepository for InMemoryCatalogRepository {
    async fn list_routes(&self) -> RepoResult<Vec<Route>> {
        Ok(self.routes.clone())
    }

    async fn get_route(&self, id: Uuid) -> RepoResult<Option<Route>> {
        Ok(self.routes.iter().find(|r| r.id == id).cloned())
    }

    async fn list_vehicles(&self, route_id: Uuid) -> RepoResult<Vec<Vehicle>> {
        let mut vehicles: Vec<Vehicle> = self
            .vehicles
            .iter()
            .filter(|v| v.route_id == route_id)
            .cloned()
            .collect();
        vehicles.sort_by_key(|v| v.departure_time);
        Ok(vehicles)
    }

    async fn get_vehicle(&self, id: Uuid) -> RepoResult<Option<Vehicle>> {
        Ok(self.vehicles.iter().find(|v| v.id == id).cloned())
    }
}

pub struct PgCatalogRepository {
    pool: PgPool,
}

impl PgCatalogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct RouteRow {
    id: Uuid,
    origin: String,
    destination: String,
    pickup_point: String,
    dropping_point: String,
    distance_km: f64,
    estimated_duration_minutes: i32,
    base_price: i32,
}

impl From<RouteRow> for Route {
    fn from(row: RouteRow) -> Self {
        Route {
            id: row.id,
            origin: row.origin,
            destination: row.destination,
            pickup_point: row.pickup_point,
            dropping_point: row.dropping_point,
            distance_km: row.distance_km,
            estimated_duration_minutes: row.estimated_duration_minutes.max(0) as u32,
            base_price: row.base_price,
        }
    }
}

#[derive(sqlx::FromRow)]
struct VehicleRow {
    id: Uuid,
    route_id: Uuid,
    registration_number: String,
    total_seats: i32,
    departure_time: NaiveTime,
    current_price: Option<i32>,
    status: String,
    seat_layout: Option<Vec<i32>>,
}

impl TryFrom<VehicleRow> for Vehicle {
    type Error = Box<dyn std::error::Error + Send + Sync>;

    fn try_from(row: VehicleRow) -> Result<Self, Self::Error> {
        let total_seats = u32::try_from(row.total_seats)?;
        let seat_layout = match row.seat_layout {
            Some(layout) if !layout.is_empty() => layout
                .into_iter()
                .map(u32::try_from)
                .collect::<Result<Vec<_>, _>>()?,
            _ => Vehicle::default_layout(total_seats),
        };
        Ok(Vehicle {
            id: row.id,
            route_id: row.route_id,
            registration_number: row.registration_number,
            total_seats,
            departure_time: row.departure_time,
            current_price: row.current_price,
            status: row.status.parse::<VehicleStatus>()?,
            seat_layout,
        })
    }
}

const ROUTE_COLUMNS: &str = "id, origin, destination, pickup_point, dropping_point, distance_km, \
     estimated_duration_minutes, base_price";
const VEHICLE_COLUMNS: &str = "id, route_id, registration_number, total_seats, departure_time, \
     current_price, status, seat_layout";

#[async_trait]
impl CatalogRepository for PgCatalogRepository {
    async fn list_routes(&self) -> RepoResult<Vec<Route>> {
        let rows = sqlx::query_as::<_, RouteRow>(&format!(
            "SELECT {} FROM routes ORDER BY origin, destination",
            ROUTE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Route::from).collect())
    }

    async fn get_route(&self, id: Uuid) -> RepoResult<Option<Route>> {
        let row = sqlx::query_as::<_, RouteRow>(&format!(
            "SELECT {} FROM routes WHERE id = $1",
            ROUTE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Route::from))
    }

    async fn list_vehicles(&self, route_id: Uuid) -> RepoResult<Vec<Vehicle>> {
        let rows = sqlx::query_as::<_, VehicleRow>(&format!(
            "SELECT {} FROM vehicles WHERE route_id = $1 ORDER BY departure_time",
            VEHICLE_COLUMNS
        ))
        .bind(route_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Vehicle::try_from).collect()
    }

    async fn get_vehicle(&self, id: Uuid) -> RepoResult<Option<Vehicle>> {
        let row = sqlx::query_as::<_, VehicleRow>(&format!(
            "SELECT {} FROM vehicles WHERE id = $1",
            VEHICLE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Vehicle::try_from).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: &str = r#"{
        "routes": [{
            "id": "7a1c0b1e-0000-4000-8000-000000000001",
            "origin": "Moi University",
            "destination": "Eldoret Town",
            "pickupPoint": "Main Gate",
            "droppingPoint": "Zion Mall",
            "distanceKm": 35.5,
            "estimatedDurationMinutes": 50,
            "basePrice": 300
        }],
        "vehicles": [
            {
                "id": "7a1c0b1e-0000-4000-8000-0000000000a2",
                "routeId": "7a1c0b1e-0000-4000-8000-000000000001",
                "registrationNumber": "KDA 221B",
                "totalSeats": 14,
                "departureTime": "09:30:00",
                "currentPrice": 350
            },
            {
                "id": "7a1c0b1e-0000-4000-8000-0000000000a1",
                "routeId": "7a1c0b1e-0000-4000-8000-000000000001",
                "registrationNumber": "KCB 101A",
                "totalSeats": 14,
                "departureTime": "07:00:00",
                "status": "maintenance",
                "seatLayout": [1, 2, 3, 4]
            }
        ]
    }"#;

    #[tokio::test]
    async fn test_seed_fills_defaults_and_orders_by_departure() {
        let repo = InMemoryCatalogRepository::from_json(SEED).unwrap();
        let route_id = Uuid::parse_str("7a1c0b1e-0000-4000-8000-000000000001").unwrap();

        let vehicles = repo.list_vehicles(route_id).await.unwrap();
        assert_eq!(vehicles.len(), 2);
        assert_eq!(vehicles[0].registration_number, "KCB 101A");
        assert_eq!(vehicles[0].status, VehicleStatus::Maintenance);
        assert_eq!(vehicles[0].seat_layout, vec![1, 2, 3, 4]);
        assert_eq!(vehicles[1].status, VehicleStatus::Active);
        assert_eq!(vehicles[1].seat_layout.len(), 14);

        assert!(repo.get_route(route_id).await.unwrap().is_some());
        assert!(repo.list_vehicles(Uuid::new_v4()).await.unwrap().is_empty());
    }

    #[test]
    fn test_seed_rejects_orphan_vehicle() {
        let orphan = SEED.replacen(
            "\"routeId\": \"7a1c0b1e-0000-4000-8000-000000000001\"",
            "\"routeId\": \"7a1c0b1e-0000-4000-8000-00000000ffff\"",
            1,
        );
        assert_ne!(orphan, SEED);
        assert!(InMemoryCatalogRepository::from_json(&orphan).is_err());
    }
}

use safiri_core::models::Route;
use safiri_core::repository::CatalogRepository;
use safiri_core::{ReservationError, ReservationResult};
use std::sync::Arc;
use uuid::Uuid;

/// Read-only route lookup.
#[derive(Clone)]
pub struct RouteCatalog {
    repo: Arc<dyn CatalogRepository>,
}

impl RouteCatalog {
    pub fn new(repo: Arc<dyn CatalogRepository>) -> Self {
        Self { repo }
    }

    pub async fn list_routes(&self) -> ReservationResult<Vec<Route>> {
        Ok(self.repo.list_routes().await?)
    }

    pub async fn get_route(&self, id: Uuid) -> ReservationResult<Route> {
        self.repo
            .get_route(id)
            .await?
            .ok_or_else(|| ReservationError::NotFound(format!("route {}", id)))
    }
}

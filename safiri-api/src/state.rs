use anyhow::Context;
use safiri_booking::{
    BookingLedger, HttpPaymentGateway, MockPaymentGateway, PaymentOrchestrator,
    ReservationWorkflow, SeatLockManager, TicketIssuer,
};
use safiri_catalog::{RouteCatalog, VehicleInventory};
use safiri_core::clock::Clock;
use safiri_core::payment::PaymentGateway;
use safiri_core::repository::{BookingRepository, CatalogRepository, SeatLockStore};
use safiri_store::app_config::Config;
use safiri_store::{
    DbClient, InMemoryBookingRepository, InMemoryCatalogRepository, InMemorySeatLockStore,
    PgBookingRepository, PgCatalogRepository, RedisSeatLockStore,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::metrics::Metrics;
use crate::middleware::ResiliencyState;

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: String,
}

/// Storage behind the services.
pub struct Backends {
    pub seat_locks: Arc<dyn SeatLockStore>,
    pub bookings: Arc<dyn BookingRepository>,
    pub catalog: Arc<dyn CatalogRepository>,
}

impl Backends {
    pub fn in_memory(catalog: InMemoryCatalogRepository) -> Self {
        Self {
            seat_locks: Arc::new(InMemorySeatLockStore::new()),
            bookings: Arc::new(InMemoryBookingRepository::new()),
            catalog: Arc::new(catalog),
        }
    }

    /// Redis when configured, Postgres when configured, memory otherwise.
    pub async fn connect(config: &Config) -> anyhow::Result<Self> {
        let seat_locks: Arc<dyn SeatLockStore> = match &config.redis {
            Some(redis) => {
                let store = RedisSeatLockStore::new(&redis.url)
                    .await
                    .context("Failed to connect to Redis")?;
                info!("Seat holds stored in Redis");
                Arc::new(store)
            }
            None => {
                warn!("No redis configured, seat holds live in process memory");
                Arc::new(InMemorySeatLockStore::new())
            }
        };

        let (bookings, catalog): (Arc<dyn BookingRepository>, Arc<dyn CatalogRepository>) =
            match &config.database {
                Some(database) => {
                    let db = DbClient::new(&database.url)
                        .await
                        .context("Failed to connect to Postgres")?;
                    db.migrate().await.context("Failed to run migrations")?;
                    (
                        Arc::new(PgBookingRepository::new(db.pool.clone())),
                        Arc::new(PgCatalogRepository::new(db.pool)),
                    )
                }
                None => {
                    warn!("No database configured, bookings live in process memory");
                    let catalog = match &config.catalog.seed_path {
                        Some(path) => InMemoryCatalogRepository::from_seed_file(path)
                            .map_err(|e| anyhow::anyhow!("Failed to load catalog seed {}: {}", path, e))?,
                        None => InMemoryCatalogRepository::new(Vec::new(), Vec::new()),
                    };
                    (Arc::new(InMemoryBookingRepository::new()), Arc::new(catalog))
                }
            };

        Ok(Self {
            seat_locks,
            bookings,
            catalog,
        })
    }
}

pub fn payment_gateway(config: &Config) -> Arc<dyn PaymentGateway> {
    match &config.payments.gateway_url {
        Some(url) => {
            info!("Payments go to {}", url);
            Arc::new(HttpPaymentGateway::new(url.clone()))
        }
        None => {
            warn!("No payment gateway configured, using the mock gateway");
            Arc::new(MockPaymentGateway::new())
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub routes: RouteCatalog,
    pub inventory: VehicleInventory,
    pub locks: Arc<SeatLockManager>,
    pub ledger: Arc<BookingLedger>,
    pub payments: Arc<PaymentOrchestrator>,
    pub workflow: Arc<ReservationWorkflow>,
    pub tickets: Arc<TicketIssuer>,
    pub clock: Arc<dyn Clock>,
    pub auth: AuthConfig,
    pub resiliency: Arc<ResiliencyState>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(
        config: &Config,
        backends: Backends,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let rules = &config.business_rules;

        let locks = Arc::new(SeatLockManager::new(
            backends.seat_locks,
            backends.bookings.clone(),
            clock.clone(),
            chrono::Duration::seconds(rules.seat_hold_seconds as i64),
        ));
        let ledger = Arc::new(BookingLedger::new(
            locks.clone(),
            backends.bookings,
            clock.clone(),
            chrono::Duration::seconds(rules.booking_hold_seconds as i64),
        ));
        let payments = Arc::new(PaymentOrchestrator::new(
            gateway,
            ledger.clone(),
            clock.clone(),
            config.payments.currency.clone(),
            Duration::from_secs(rules.payment_timeout_seconds),
        ));
        let routes = RouteCatalog::new(backends.catalog.clone());
        let inventory = VehicleInventory::new(backends.catalog, locks.clone(), clock.clone());
        let workflow = Arc::new(ReservationWorkflow::new(
            routes.clone(),
            inventory.clone(),
            ledger.clone(),
            payments.clone(),
            clock.clone(),
        ));
        let tickets = Arc::new(TicketIssuer::new(
            ledger.clone(),
            clock.clone(),
            &config.tickets.signing_secret,
            &config.server.public_base_url,
            chrono::Duration::hours(rules.ticket_validity_hours),
        ));
        let metrics = Arc::new(Metrics::new().context("Failed to register metrics")?);

        Ok(Self {
            routes,
            inventory,
            locks,
            ledger,
            payments,
            workflow,
            tickets,
            clock,
            auth: AuthConfig {
                secret: config.auth.jwt_secret.clone(),
            },
            resiliency: Arc::new(ResiliencyState::default()),
            metrics,
        })
    }
}

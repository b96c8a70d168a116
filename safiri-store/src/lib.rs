pub mod app_config;
pub mod booking_repo;
pub mod catalog_repo;
pub mod database;
pub mod lock_store;
pub mod redis_repo;

pub use booking_repo::{InMemoryBookingRepository, PgBookingRepository};
pub use catalog_repo::{InMemoryCatalogRepository, PgCatalogRepository};
pub use database::DbClient;
pub use lock_store::InMemorySeatLockStore;
pub use redis_repo::RedisSeatLockStore;

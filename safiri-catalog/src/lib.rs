pub mod catalog;
pub mod inventory;
pub mod pricing;

pub use catalog::RouteCatalog;
pub use inventory::{SeatSelection, VehicleInventory, VehicleAvailability};
pub use pricing::{check_quote, frozen_fare, QuoteCheck};

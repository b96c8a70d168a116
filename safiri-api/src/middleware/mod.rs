pub mod auth;
pub mod resiliency;

pub use auth::{optional_auth, require_auth, Caller, Claims, MaybeCaller};
pub use resiliency::{payment_circuit_breaker, CircuitBreaker, ResiliencyState};

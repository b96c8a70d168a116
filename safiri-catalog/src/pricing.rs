use safiri_core::models::{Route, Vehicle};

/// The fare a booking is frozen at: the vehicle's current price when it has
/// one, otherwise the route's base price.
pub fn frozen_fare(vehicle: &Vehicle, route: &Route) -> i32 {
    vehicle.current_price.unwrap_or(route.base_price)
}

/// Compares a client-quoted price against the server fare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteCheck {
    Matches,
    NotQuoted,
    Mismatch { quoted: i32, fare: i32 },
}

pub fn check_quote(quoted: Option<i32>, fare: i32) -> QuoteCheck {
    match quoted {
        None => QuoteCheck::NotQuoted,
        Some(q) if q == fare => QuoteCheck::Matches,
        Some(q) => QuoteCheck::Mismatch { quoted: q, fare },
    }
}

//! Checkout sessions: Route → Vehicle → Seat → Payment → Ticket as an
//! explicit state machine with guarded transitions.
//!
//! Sessions live on the server. Every step re-checks the deadline that
//! applies to the current state (an idle limit before a seat is held, the
//! hold expiry while it is held, the booking expiry afterwards) and forces
//! `Expired` once it has passed.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use dashmap::DashMap;
use safiri_catalog::{RouteCatalog, VehicleInventory};
use safiri_core::clock::Clock;
use safiri_core::models::{BookingStatus, NewBooking};
use safiri_core::{ReservationError, ReservationResult};
use safiri_shared::Masked;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::ledger::BookingLedger;
use crate::locks::SeatLockManager;
use crate::payment::{PaymentOrchestrator, PaymentReceipt, SettleRequest};

/// How long finished sessions stay readable.
const TERMINAL_RETENTION_MINUTES: i64 = 60;

/// Sessions that have not reached a seat hold lapse after this long idle.
const IDLE_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckoutState {
    RouteSelected,
    VehicleSelected,
    SeatHeld,
    BookingPending,
    PaymentProcessing,
    Confirmed,
    Expired,
    Cancelled,
}

impl CheckoutState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CheckoutState::Confirmed | CheckoutState::Expired | CheckoutState::Cancelled
        )
    }
}

impl fmt::Display for CheckoutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CheckoutState::RouteSelected => "ROUTE_SELECTED",
            CheckoutState::VehicleSelected => "VEHICLE_SELECTED",
            CheckoutState::SeatHeld => "SEAT_HELD",
            CheckoutState::BookingPending => "BOOKING_PENDING",
            CheckoutState::PaymentProcessing => "PAYMENT_PROCESSING",
            CheckoutState::Confirmed => "CONFIRMED",
            CheckoutState::Expired => "EXPIRED",
            CheckoutState::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Checkout {
    pub id: Uuid,
    pub user_id: String,
    pub state: CheckoutState,
    pub route_id: Uuid,
    pub travel_date: NaiveDate,
    pub vehicle_id: Option<Uuid>,
    pub seat_number: Option<u32>,
    pub fare: Option<i32>,
    pub hold_expires_at: Option<DateTime<Utc>>,
    pub booking_id: Option<Uuid>,
    pub booking_expiry: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Checkout {
    /// The instant after which this session can no longer progress.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        match self.state {
            CheckoutState::RouteSelected | CheckoutState::VehicleSelected => {
                Some(self.updated_at + Duration::minutes(IDLE_MINUTES))
            }
            CheckoutState::SeatHeld => self.hold_expires_at,
            CheckoutState::BookingPending | CheckoutState::PaymentProcessing => self.booking_expiry,
            _ => None,
        }
    }

    fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }

    fn move_to(&mut self, state: CheckoutState, now: DateTime<Utc>) {
        self.state = state;
        self.updated_at = now;
    }

    fn require(&self, allowed: &[CheckoutState], action: &str) -> ReservationResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ReservationError::InvalidState(format!(
                "cannot {} while checkout is {}",
                action, self.state
            )))
        }
    }
}

type Session = Arc<Mutex<Checkout>>;

/// Drives checkout sessions through the reservation pipeline.
pub struct ReservationWorkflow {
    routes: RouteCatalog,
    inventory: VehicleInventory,
    locks: Arc<SeatLockManager>,
    ledger: Arc<BookingLedger>,
    payments: Arc<PaymentOrchestrator>,
    clock: Arc<dyn Clock>,
    sessions: DashMap<Uuid, Session>,
}

impl ReservationWorkflow {
    pub fn new(
        routes: RouteCatalog,
        inventory: VehicleInventory,
        ledger: Arc<BookingLedger>,
        payments: Arc<PaymentOrchestrator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            routes,
            inventory,
            locks: ledger.locks().clone(),
            ledger,
            payments,
            clock,
            sessions: DashMap::new(),
        }
    }

    fn session(&self, id: Uuid) -> ReservationResult<Session> {
        let session = self
            .sessions
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ReservationError::NotFound(format!("checkout {}", id)))?;
        Ok(session)
    }

    fn check_owner(checkout: &Checkout, user_id: &str) -> ReservationResult<()> {
        if checkout.user_id == user_id {
            Ok(())
        } else {
            Err(ReservationError::Unauthorized(format!(
                "checkout {} belongs to another user",
                checkout.id
            )))
        }
    }

    /// Applies a passed deadline: the session becomes `Expired` and a
    /// pending booking is expired in the ledger. Returns true if it fired.
    async fn enforce_deadline(&self, checkout: &mut Checkout) -> ReservationResult<bool> {
        let now = self.clock.now();
        if !checkout.is_overdue(now) {
            return Ok(false);
        }

        if let Some(booking_id) = checkout.booking_id {
            match self.ledger.expire_booking(booking_id).await {
                Ok(_) => {}
                // Paid just in time; the ledger has the final word.
                Err(ReservationError::InvalidState(_)) => {
                    let booking = self.ledger.get_booking(booking_id).await?;
                    if booking.status == BookingStatus::Confirmed {
                        checkout.move_to(CheckoutState::Confirmed, now);
                        return Ok(false);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        info!("Checkout {} expired in {}", checkout.id, checkout.state);
        checkout.move_to(CheckoutState::Expired, now);
        Ok(true)
    }

    pub async fn start(
        &self,
        user_id: &str,
        route_id: Uuid,
        travel_date: Option<NaiveDate>,
    ) -> ReservationResult<Checkout> {
        self.routes.get_route(route_id).await?;
        let today = self.clock.today();
        let travel_date = travel_date.unwrap_or(today);
        if travel_date < today {
            return Err(ReservationError::Validation(format!(
                "travel date {} is in the past",
                travel_date
            )));
        }

        let now = self.clock.now();
        let checkout = Checkout {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            state: CheckoutState::RouteSelected,
            route_id,
            travel_date,
            vehicle_id: None,
            seat_number: None,
            fare: None,
            hold_expires_at: None,
            booking_id: None,
            booking_expiry: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.sessions
            .insert(checkout.id, Arc::new(Mutex::new(checkout.clone())));
        Ok(checkout)
    }

    pub async fn get(&self, id: Uuid, user_id: &str) -> ReservationResult<Checkout> {
        let session = self.session(id)?;
        let mut checkout = session.lock().await;
        Self::check_owner(&checkout, user_id)?;
        self.enforce_deadline(&mut checkout).await?;
        Ok(checkout.clone())
    }

    /// RouteSelected → VehicleSelected. The vehicle must run on the chosen
    /// route, be active and have a free seat for the travel date.
    pub async fn select_vehicle(
        &self,
        id: Uuid,
        user_id: &str,
        vehicle_id: Uuid,
    ) -> ReservationResult<Checkout> {
        let session = self.session(id)?;
        let mut checkout = session.lock().await;
        Self::check_owner(&checkout, user_id)?;
        self.enforce_deadline(&mut checkout).await?;
        checkout.require(
            &[CheckoutState::RouteSelected, CheckoutState::VehicleSelected],
            "select a vehicle",
        )?;

        let listed = self
            .inventory
            .vehicle_availability(vehicle_id, checkout.travel_date, Some(user_id))
            .await?;
        if listed.vehicle.route_id != checkout.route_id {
            return Err(ReservationError::Validation(format!(
                "vehicle {} does not serve route {}",
                vehicle_id, checkout.route_id
            )));
        }
        if !listed.vehicle.is_bookable() || listed.available_seats == 0 {
            return Err(ReservationError::VehicleUnavailable(format!(
                "{} has no seats for {}",
                listed.vehicle.registration_number, checkout.travel_date
            )));
        }

        let now = self.clock.now();
        checkout.vehicle_id = Some(vehicle_id);
        checkout.fare = Some(listed.fare);
        checkout.last_error = None;
        checkout.move_to(CheckoutState::VehicleSelected, now);
        Ok(checkout.clone())
    }

    /// VehicleSelected → SeatHeld. Choosing another seat while one is held
    /// releases the previous hold once the new one is secured.
    pub async fn hold_seat(
        &self,
        id: Uuid,
        user_id: &str,
        seat_number: u32,
    ) -> ReservationResult<Checkout> {
        let session = self.session(id)?;
        let mut checkout = session.lock().await;
        Self::check_owner(&checkout, user_id)?;
        let had_hold = checkout.state == CheckoutState::SeatHeld;
        if self.enforce_deadline(&mut checkout).await? && had_hold {
            return Err(ReservationError::HoldExpired {
                seat_number: checkout.seat_number.unwrap_or(seat_number),
            });
        }
        checkout.require(
            &[CheckoutState::VehicleSelected, CheckoutState::SeatHeld],
            "hold a seat",
        )?;
        let vehicle_id = checkout
            .vehicle_id
            .ok_or_else(|| ReservationError::InvalidState("no vehicle selected".to_string()))?;

        let selection = self
            .inventory
            .select_seat(vehicle_id, seat_number, checkout.travel_date)
            .await?;
        let hold = self
            .locks
            .acquire_hold(vehicle_id, seat_number, checkout.travel_date, user_id, None)
            .await?
            .into_hold();

        if let Some(previous) = checkout.seat_number.filter(|s| *s != seat_number) {
            if checkout.state == CheckoutState::SeatHeld {
                self.locks
                    .release_hold(vehicle_id, checkout.travel_date, previous, user_id)
                    .await?;
            }
        }

        let now = self.clock.now();
        checkout.seat_number = Some(seat_number);
        checkout.fare = Some(selection.fare);
        checkout.hold_expires_at = Some(hold.expires_at);
        checkout.last_error = None;
        checkout.move_to(CheckoutState::SeatHeld, now);
        Ok(checkout.clone())
    }

    /// SeatHeld → BookingPending.
    pub async fn create_booking(&self, id: Uuid, user_id: &str) -> ReservationResult<Checkout> {
        let session = self.session(id)?;
        let mut checkout = session.lock().await;
        Self::check_owner(&checkout, user_id)?;
        let seat_number = checkout.seat_number.unwrap_or_default();
        if self.enforce_deadline(&mut checkout).await? {
            return Err(ReservationError::HoldExpired { seat_number });
        }
        checkout.require(&[CheckoutState::SeatHeld], "create a booking")?;

        let (vehicle_id, fare) = match (checkout.vehicle_id, checkout.fare) {
            (Some(v), Some(f)) => (v, f),
            _ => {
                return Err(ReservationError::InvalidState(
                    "checkout has no vehicle or fare".to_string(),
                ))
            }
        };

        let request = NewBooking {
            vehicle_id,
            route_id: checkout.route_id,
            seat_number,
            travel_date: checkout.travel_date,
            user_id: user_id.to_string(),
            price: fare,
        };
        let now = self.clock.now();
        match self.ledger.create_booking(request).await {
            Ok(booking) => {
                checkout.booking_id = Some(booking.id);
                checkout.booking_expiry = Some(booking.booking_expiry);
                checkout.fare = Some(booking.price);
                checkout.last_error = None;
                let next = if booking.status == BookingStatus::Confirmed {
                    CheckoutState::Confirmed
                } else {
                    CheckoutState::BookingPending
                };
                checkout.move_to(next, now);
                Ok(checkout.clone())
            }
            Err(e @ ReservationError::HoldExpired { .. }) => {
                checkout.last_error = Some(e.to_string());
                checkout.move_to(CheckoutState::Expired, now);
                Err(e)
            }
            Err(e @ ReservationError::SeatUnavailable { .. })
            | Err(e @ ReservationError::SeatAlreadyBooked { .. }) => {
                // Back to seat selection.
                checkout.seat_number = None;
                checkout.hold_expires_at = None;
                checkout.last_error = Some(e.to_string());
                checkout.move_to(CheckoutState::VehicleSelected, now);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// BookingPending → PaymentProcessing → Confirmed, or back to
    /// BookingPending on a failed charge. The session lock is released while
    /// the gateway call is in flight.
    pub async fn pay(
        &self,
        id: Uuid,
        user_id: &str,
        amount: i32,
        phone_number: Option<Masked<String>>,
    ) -> ReservationResult<(Checkout, PaymentReceipt)> {
        let session = self.session(id)?;
        let booking_id = {
            let mut checkout = session.lock().await;
            Self::check_owner(&checkout, user_id)?;
            if self.enforce_deadline(&mut checkout).await? {
                let booking_id = checkout.booking_id.unwrap_or_default();
                return Err(ReservationError::BookingExpired(booking_id));
            }
            checkout.require(&[CheckoutState::BookingPending], "pay")?;
            let booking_id = checkout
                .booking_id
                .ok_or_else(|| ReservationError::InvalidState("no booking to pay".to_string()))?;
            let now = self.clock.now();
            checkout.move_to(CheckoutState::PaymentProcessing, now);
            booking_id
        };

        let outcome = self
            .payments
            .settle(SettleRequest {
                booking_id,
                user_id: user_id.to_string(),
                amount,
                phone_number,
            })
            .await;

        let mut checkout = session.lock().await;
        let now = self.clock.now();
        match outcome {
            Ok(receipt) => {
                checkout.last_error = None;
                checkout.move_to(CheckoutState::Confirmed, now);
                info!("Checkout {} confirmed booking {}", checkout.id, booking_id);
                Ok((checkout.clone(), receipt))
            }
            Err(e @ ReservationError::BookingExpired(_))
            | Err(e @ ReservationError::ReconciliationRequired { .. }) => {
                checkout.last_error = Some(e.to_string());
                checkout.move_to(CheckoutState::Expired, now);
                Err(e)
            }
            Err(e) => {
                warn!("Checkout {} payment attempt failed: {}", checkout.id, e);
                checkout.last_error = Some(e.to_string());
                // A sweep may already have expired the session mid-flight.
                if checkout.state == CheckoutState::PaymentProcessing {
                    checkout.move_to(CheckoutState::BookingPending, now);
                    self.enforce_deadline(&mut checkout).await?;
                }
                Err(e)
            }
        }
    }

    /// Abandons the session, releasing whatever it holds.
    pub async fn cancel(&self, id: Uuid, user_id: &str) -> ReservationResult<Checkout> {
        let session = self.session(id)?;
        let mut checkout = session.lock().await;
        Self::check_owner(&checkout, user_id)?;
        if checkout.state == CheckoutState::Cancelled {
            return Ok(checkout.clone());
        }
        if self.enforce_deadline(&mut checkout).await? {
            return Ok(checkout.clone());
        }
        checkout.require(
            &[
                CheckoutState::RouteSelected,
                CheckoutState::VehicleSelected,
                CheckoutState::SeatHeld,
                CheckoutState::BookingPending,
            ],
            "cancel",
        )?;

        match checkout.state {
            CheckoutState::SeatHeld => {
                if let (Some(vehicle_id), Some(seat)) = (checkout.vehicle_id, checkout.seat_number) {
                    self.locks
                        .release_hold(vehicle_id, checkout.travel_date, seat, user_id)
                        .await?;
                }
            }
            CheckoutState::BookingPending => {
                if let Some(booking_id) = checkout.booking_id {
                    self.ledger.cancel_booking(booking_id, user_id).await?;
                }
            }
            _ => {}
        }

        let now = self.clock.now();
        checkout.move_to(CheckoutState::Cancelled, now);
        info!("Checkout {} cancelled", checkout.id);
        Ok(checkout.clone())
    }

    /// Forces every overdue session to `Expired`, idle ones included, and
    /// forgets sessions that finished more than an hour ago. Returns how many
    /// sessions expired.
    pub async fn expire_overdue(&self) -> ReservationResult<usize> {
        let now = self.clock.now();
        let retention = Duration::minutes(TERMINAL_RETENTION_MINUTES);
        let sessions: Vec<(Uuid, Session)> = self
            .sessions
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        let mut expired = 0;
        let mut finished = Vec::new();
        for (id, session) in sessions {
            // Busy sessions are checked again on their next step or sweep.
            let Ok(mut checkout) = session.try_lock() else {
                continue;
            };
            if self.enforce_deadline(&mut checkout).await? {
                expired += 1;
            }
            if checkout.state.is_terminal() && now - checkout.updated_at >= retention {
                finished.push(id);
            }
        }
        for id in finished {
            self.sessions.remove(&id);
        }
        Ok(expired)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }
}

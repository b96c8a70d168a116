use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use safiri_core::clock::Clock;
use safiri_core::models::{Occupancy, SeatHold, SeatKey, SeatSlot};
use safiri_core::repository::{AcquireOutcome, BookingRepository, SeatLockStore, SeatOccupancy};
use safiri_core::{ReservationError, ReservationResult};
use safiri_shared::{SeatEvent, SeatEventKind};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

const EVENT_BUFFER: usize = 256;

/// Result of a successful `acquire_hold`.
#[derive(Debug, Clone, PartialEq)]
pub enum HoldOutcome {
    Acquired(SeatHold),
    /// The caller already had a live hold on the seat; it is returned as is.
    AlreadyHeldByCaller(SeatHold),
}

impl HoldOutcome {
    pub fn hold(&self) -> &SeatHold {
        match self {
            HoldOutcome::Acquired(hold) | HoldOutcome::AlreadyHeldByCaller(hold) => hold,
        }
    }

    pub fn into_hold(self) -> SeatHold {
        match self {
            HoldOutcome::Acquired(hold) | HoldOutcome::AlreadyHeldByCaller(hold) => hold,
        }
    }
}

/// Gatekeeper for seat holds. Every mutation is one atomic store step on a
/// single seat key; losers fail immediately.
pub struct SeatLockManager {
    store: Arc<dyn SeatLockStore>,
    bookings: Arc<dyn BookingRepository>,
    clock: Arc<dyn Clock>,
    hold_ttl: Duration,
    events: broadcast::Sender<SeatEvent>,
}

impl SeatLockManager {
    pub fn new(
        store: Arc<dyn SeatLockStore>,
        bookings: Arc<dyn BookingRepository>,
        clock: Arc<dyn Clock>,
        hold_ttl: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            store,
            bookings,
            clock,
            hold_ttl,
            events,
        }
    }

    pub fn hold_ttl(&self) -> Duration {
        self.hold_ttl
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SeatEvent> {
        self.events.subscribe()
    }

    pub(crate) fn store(&self) -> &Arc<dyn SeatLockStore> {
        &self.store
    }

    pub(crate) fn publish(&self, key: &SeatKey, kind: SeatEventKind, booking_id: Option<Uuid>) {
        let mut event = SeatEvent::new(
            key.vehicle_id,
            key.travel_date,
            key.seat_number,
            kind,
            self.clock.now().timestamp_millis(),
        );
        if let Some(id) = booking_id {
            event = event.with_booking(id);
        }
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn is_confirmed(&self, key: &SeatKey) -> ReservationResult<bool> {
        let seats = self
            .bookings
            .confirmed_seats(key.vehicle_id, key.travel_date)
            .await?;
        Ok(seats.contains(&key.seat_number))
    }

    /// True iff no confirmed booking exists and no live hold belongs to
    /// someone other than `caller_id`.
    pub async fn check_availability(
        &self,
        vehicle_id: Uuid,
        seat_number: u32,
        travel_date: NaiveDate,
        caller_id: Option<&str>,
    ) -> ReservationResult<bool> {
        let key = SeatKey::new(vehicle_id, travel_date, seat_number);
        let now = self.clock.now();

        let available = match self.store.get(&key).await? {
            None => true,
            Some(SeatSlot::Booked(_)) => false,
            Some(SeatSlot::Held(hold)) if !hold.is_live(now) => true,
            Some(SeatSlot::Held(hold)) => Some(hold.holder_user_id.as_str()) == caller_id,
        };
        if !available {
            return Ok(false);
        }
        Ok(!self.is_confirmed(&key).await?)
    }

    pub async fn acquire_hold(
        &self,
        vehicle_id: Uuid,
        seat_number: u32,
        travel_date: NaiveDate,
        caller_id: &str,
        ttl: Option<Duration>,
    ) -> ReservationResult<HoldOutcome> {
        let key = SeatKey::new(vehicle_id, travel_date, seat_number);
        if self.is_confirmed(&key).await? {
            return Err(ReservationError::SeatUnavailable { seat_number });
        }

        let now = self.clock.now();
        let hold = SeatHold::new(key, caller_id, now, ttl.unwrap_or(self.hold_ttl));
        match self.store.try_acquire(hold, now).await? {
            AcquireOutcome::Acquired(hold) => {
                info!("Seat hold acquired: {} by {}", key, caller_id);
                self.publish(&key, SeatEventKind::Held, None);
                Ok(HoldOutcome::Acquired(hold))
            }
            AcquireOutcome::AlreadyHeld(hold) => Ok(HoldOutcome::AlreadyHeldByCaller(hold)),
            AcquireOutcome::HeldByOther(_) | AcquireOutcome::Booked(_) => {
                debug!("Seat hold refused: {} for {}", key, caller_id);
                Err(ReservationError::SeatUnavailable { seat_number })
            }
        }
    }

    /// Drops the caller's plain hold. Expired holds, other users' holds and
    /// holds already promoted into a booking are left alone.
    pub async fn release_hold(
        &self,
        vehicle_id: Uuid,
        travel_date: NaiveDate,
        seat_number: u32,
        caller_id: &str,
    ) -> ReservationResult<bool> {
        let key = SeatKey::new(vehicle_id, travel_date, seat_number);
        let released = self.store.release_hold(&key, caller_id).await?;
        if released {
            info!("Seat hold released: {} by {}", key, caller_id);
            self.publish(&key, SeatEventKind::Released, None);
        }
        Ok(released)
    }

    /// Physically removes expired holds and booked seats whose travel day
    /// is over.
    pub async fn evict_expired(&self) -> ReservationResult<Vec<SeatKey>> {
        let evicted = self.store.evict_expired(self.clock.now()).await?;
        for key in &evicted {
            self.publish(key, SeatEventKind::Expired, None);
        }
        Ok(evicted)
    }
}

#[async_trait]
impl SeatOccupancy for SeatLockManager {
    async fn occupancy(
        &self,
        vehicle_id: Uuid,
        travel_date: NaiveDate,
        caller: Option<&str>,
    ) -> ReservationResult<Occupancy> {
        let now = self.clock.now();
        let slots = self.store.list(vehicle_id, travel_date).await?;

        let mut confirmed: BTreeSet<u32> = self
            .bookings
            .confirmed_seats(vehicle_id, travel_date)
            .await?
            .into_iter()
            .collect();
        let mut held = BTreeSet::new();
        for slot in slots {
            match slot {
                SeatSlot::Booked(seat) => {
                    confirmed.insert(seat.key.seat_number);
                }
                SeatSlot::Held(hold) if hold.is_live(now) => {
                    if Some(hold.holder_user_id.as_str()) != caller {
                        held.insert(hold.key.seat_number);
                    }
                }
                SeatSlot::Held(_) => {}
            }
        }

        Ok(Occupancy {
            confirmed: confirmed.len() as u32,
            held: held.difference(&confirmed).count() as u32,
        })
    }
}

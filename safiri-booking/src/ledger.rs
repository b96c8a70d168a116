use chrono::{Duration, NaiveDate};
use safiri_core::clock::Clock;
use safiri_core::models::{Booking, BookingStatus, NewBooking, ReconciliationCase, SeatKey};
use safiri_core::repository::{BookingRepository, PromoteOutcome};
use safiri_core::{ReservationError, ReservationResult};
use safiri_shared::SeatEventKind;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::locks::SeatLockManager;

/// Durable booking records, kept consistent with the seat lock store.
///
/// A pending booking owns its seat through the promoted hold, so it expires
/// exactly when the hold does. Confirmation turns the hold into a permanent
/// booked slot before the row is marked confirmed.
pub struct BookingLedger {
    locks: Arc<SeatLockManager>,
    repo: Arc<dyn BookingRepository>,
    clock: Arc<dyn Clock>,
    booking_hold: Duration,
}

impl BookingLedger {
    pub fn new(
        locks: Arc<SeatLockManager>,
        repo: Arc<dyn BookingRepository>,
        clock: Arc<dyn Clock>,
        booking_hold: Duration,
    ) -> Self {
        Self {
            locks,
            repo,
            clock,
            booking_hold,
        }
    }

    pub fn locks(&self) -> &Arc<SeatLockManager> {
        &self.locks
    }

    /// Turns the caller's live hold into a pending booking.
    ///
    /// Repeating the call for the same seat returns the booking created the
    /// first time.
    pub async fn create_booking(&self, request: NewBooking) -> ReservationResult<Booking> {
        let key = request.seat_key();
        let seat_number = request.seat_number;

        let confirmed = self
            .repo
            .confirmed_seats(key.vehicle_id, key.travel_date)
            .await?;
        if confirmed.contains(&seat_number) {
            return self.existing_for(&key, &request.user_id).await;
        }

        let now = self.clock.now();
        let booking = Booking {
            id: Uuid::new_v4(),
            user_id: request.user_id.clone(),
            vehicle_id: request.vehicle_id,
            route_id: request.route_id,
            seat_number,
            travel_date: request.travel_date,
            price: request.price,
            status: BookingStatus::Pending,
            booking_expiry: now + self.booking_hold,
            qr_verification_link: None,
            created_at: now,
            updated_at: now,
        };
        self.repo.insert(&booking).await?;

        let outcome = self
            .locks
            .store()
            .promote(&key, &request.user_id, booking.id, booking.booking_expiry, now)
            .await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                self.discard(booking.id).await;
                return Err(e.into());
            }
        };

        match outcome {
            PromoteOutcome::Promoted(_) => {
                info!(
                    "Booking {} pending for {} until {}",
                    booking.id, key, booking.booking_expiry
                );
                self.locks
                    .publish(&key, SeatEventKind::Pending, Some(booking.id));
                Ok(booking)
            }
            PromoteOutcome::AlreadyPromoted(hold) => {
                self.discard(booking.id).await;
                let existing = hold
                    .booking_id
                    .ok_or_else(|| ReservationError::Storage(format!("promoted hold on {} has no booking", key)))?;
                self.get_booking(existing).await
            }
            PromoteOutcome::Booked(seat) => {
                self.discard(booking.id).await;
                if seat.user_id == request.user_id {
                    self.get_booking(seat.booking_id).await
                } else {
                    Err(ReservationError::SeatAlreadyBooked { seat_number })
                }
            }
            PromoteOutcome::HeldByOther(_) => {
                self.discard(booking.id).await;
                Err(ReservationError::SeatUnavailable { seat_number })
            }
            PromoteOutcome::Missing => {
                self.discard(booking.id).await;
                Err(ReservationError::HoldExpired { seat_number })
            }
        }
    }

    /// The caller's own confirmed booking on a seat, if that is what blocks it.
    async fn existing_for(&self, key: &SeatKey, user_id: &str) -> ReservationResult<Booking> {
        let mine = self
            .repo
            .list_for_user(user_id, BookingStatus::Confirmed)
            .await?
            .into_iter()
            .find(|b| b.seat_key() == *key);
        mine.ok_or(ReservationError::SeatAlreadyBooked {
            seat_number: key.seat_number,
        })
    }

    async fn discard(&self, booking_id: Uuid) {
        if let Err(e) = self.repo.delete(booking_id).await {
            error!("Failed to discard unpromoted booking {}: {}", booking_id, e);
        }
    }

    pub async fn get_booking(&self, id: Uuid) -> ReservationResult<Booking> {
        self.repo
            .get(id)
            .await?
            .ok_or_else(|| ReservationError::NotFound(format!("booking {}", id)))
    }

    /// Confirmed seats only.
    pub async fn get_booked_seats(
        &self,
        vehicle_id: Uuid,
        travel_date: NaiveDate,
    ) -> ReservationResult<Vec<u32>> {
        Ok(self.repo.confirmed_seats(vehicle_id, travel_date).await?)
    }

    /// The user's pending bookings that have not yet run out.
    pub async fn get_user_temporary_bookings(&self, user_id: &str) -> ReservationResult<Vec<Booking>> {
        let now = self.clock.now();
        let pending = self.repo.list_for_user(user_id, BookingStatus::Pending).await?;
        Ok(pending.into_iter().filter(|b| !b.is_overdue(now)).collect())
    }

    pub async fn confirm_booking(&self, id: Uuid) -> ReservationResult<Booking> {
        let booking = self.get_booking(id).await?;
        match booking.status {
            BookingStatus::Confirmed => return Ok(booking),
            BookingStatus::Expired => return Err(ReservationError::BookingExpired(id)),
            BookingStatus::Cancelled => {
                return Err(ReservationError::InvalidState(format!(
                    "booking {} was cancelled",
                    id
                )))
            }
            BookingStatus::Pending => {}
        }

        let now = self.clock.now();
        if booking.is_overdue(now) {
            self.expire_booking(id).await?;
            return Err(ReservationError::BookingExpired(id));
        }

        let key = booking.seat_key();
        if !self.locks.store().mark_booked(&key, id, now).await? {
            warn!("Booking {} lost its seat {} before confirmation", id, key);
            return Err(ReservationError::BookingExpired(id));
        }

        if !self
            .repo
            .transition(id, BookingStatus::Pending, BookingStatus::Confirmed, now)
            .await?
        {
            // Someone expired or cancelled it between our read and write.
            let current = self.get_booking(id).await?;
            if current.status == BookingStatus::Confirmed {
                return Ok(current);
            }
            self.locks.store().release_booking(&key, id).await?;
            return Err(ReservationError::BookingExpired(id));
        }

        info!("Booking {} confirmed for {}", id, key);
        self.locks.publish(&key, SeatEventKind::Booked, Some(id));
        self.get_booking(id).await
    }

    /// Moves an overdue pending booking to `expired` and frees its seat.
    /// Repeating the call on an expired booking is harmless.
    pub async fn expire_booking(&self, id: Uuid) -> ReservationResult<Booking> {
        let booking = self.get_booking(id).await?;
        match booking.status {
            BookingStatus::Expired => return Ok(booking),
            BookingStatus::Pending => {}
            other => {
                return Err(ReservationError::InvalidState(format!(
                    "booking {} is {} and cannot expire",
                    id, other
                )))
            }
        }

        let now = self.clock.now();
        if !booking.is_overdue(now) {
            return Err(ReservationError::InvalidState(format!(
                "booking {} is still payable until {}",
                id, booking.booking_expiry
            )));
        }

        if self
            .repo
            .transition(id, BookingStatus::Pending, BookingStatus::Expired, now)
            .await?
        {
            let key = booking.seat_key();
            self.locks.store().release_booking(&key, id).await?;
            info!("Booking {} expired, seat {} returned", id, key);
            self.locks.publish(&key, SeatEventKind::Expired, Some(id));
        }
        self.get_booking(id).await
    }

    /// Abandons the owner's pending booking and frees the seat at once.
    pub async fn cancel_booking(&self, id: Uuid, user_id: &str) -> ReservationResult<Booking> {
        let booking = self.get_booking(id).await?;
        if booking.user_id != user_id {
            return Err(ReservationError::Unauthorized(format!(
                "booking {} belongs to another user",
                id
            )));
        }
        match booking.status {
            BookingStatus::Cancelled => return Ok(booking),
            BookingStatus::Expired => return Err(ReservationError::BookingExpired(id)),
            BookingStatus::Confirmed => {
                return Err(ReservationError::InvalidState(format!(
                    "booking {} is already paid",
                    id
                )))
            }
            BookingStatus::Pending => {}
        }

        let now = self.clock.now();
        if booking.is_overdue(now) {
            self.expire_booking(id).await?;
            return Err(ReservationError::BookingExpired(id));
        }

        if !self
            .repo
            .transition(id, BookingStatus::Pending, BookingStatus::Cancelled, now)
            .await?
        {
            let current = self.get_booking(id).await?;
            return match current.status {
                BookingStatus::Cancelled => Ok(current),
                BookingStatus::Expired => Err(ReservationError::BookingExpired(id)),
                other => Err(ReservationError::InvalidState(format!(
                    "booking {} is {}",
                    id, other
                ))),
            };
        }

        let key = booking.seat_key();
        self.locks.store().release_booking(&key, id).await?;
        info!("Booking {} cancelled by {}", id, user_id);
        self.locks.publish(&key, SeatEventKind::Released, Some(id));
        self.get_booking(id).await
    }

    /// Expires every pending booking past its deadline. Returns their ids.
    pub async fn expire_overdue(&self) -> ReservationResult<Vec<Uuid>> {
        let overdue = self.repo.list_overdue(self.clock.now()).await?;
        let mut expired = Vec::with_capacity(overdue.len());
        for booking in overdue {
            match self.expire_booking(booking.id).await {
                Ok(b) if b.status == BookingStatus::Expired => expired.push(b.id),
                Ok(_) => {}
                // Confirmed in the meantime.
                Err(ReservationError::InvalidState(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(expired)
    }

    pub async fn attach_qr_link(&self, id: Uuid, link: &str) -> ReservationResult<()> {
        Ok(self.repo.set_qr_link(id, link).await?)
    }

    /// Records a payment that cleared after its booking expired.
    pub async fn record_reconciliation(
        &self,
        booking: &Booking,
        transaction_reference: Option<String>,
    ) -> ReservationResult<ReconciliationCase> {
        let case = ReconciliationCase {
            id: Uuid::new_v4(),
            booking_id: booking.id,
            user_id: booking.user_id.clone(),
            amount: booking.price,
            transaction_reference,
            booking_expiry: booking.booking_expiry,
            detected_at: self.clock.now(),
        };
        self.repo.record_reconciliation(&case).await?;
        warn!(
            "Late payment on booking {} recorded for reconciliation ({})",
            booking.id, case.id
        );
        Ok(case)
    }

    pub async fn reconciliations(&self) -> ReservationResult<Vec<ReconciliationCase>> {
        Ok(self.repo.list_reconciliations().await?)
    }
}

use chrono::{Duration, NaiveDate};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use safiri_core::clock::Clock;
use safiri_core::models::{Booking, BookingStatus};
use safiri_core::{ReservationError, ReservationResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::ledger::BookingLedger;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub booking_id: Uuid,
    pub qr_verification_link: String,
}

/// What a conductor's scanner learns from a valid QR code.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TicketVerification {
    pub booking_id: Uuid,
    pub vehicle_id: Uuid,
    pub route_id: Uuid,
    pub seat_number: u32,
    pub travel_date: NaiveDate,
    pub status: BookingStatus,
}

#[derive(Debug, Serialize, Deserialize)]
struct TicketClaims {
    sub: Uuid,
    vid: Uuid,
    seat: u32,
    date: NaiveDate,
    iat: i64,
    exp: i64,
}

/// Produces verifiable confirmations for paid bookings.
pub struct TicketIssuer {
    ledger: Arc<BookingLedger>,
    clock: Arc<dyn Clock>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    public_base_url: String,
    validity: Duration,
}

impl TicketIssuer {
    pub fn new(
        ledger: Arc<BookingLedger>,
        clock: Arc<dyn Clock>,
        signing_secret: &str,
        public_base_url: &str,
        validity: Duration,
    ) -> Self {
        Self {
            ledger,
            clock,
            encoding_key: EncodingKey::from_secret(signing_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(signing_secret.as_bytes()),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            validity,
        }
    }

    /// Returns the ticket of a confirmed booking, minting its link on first use.
    pub async fn issue_ticket(&self, booking_id: Uuid) -> ReservationResult<Ticket> {
        let booking = self.ledger.get_booking(booking_id).await?;
        if booking.status != BookingStatus::Confirmed {
            return Err(ReservationError::InvalidState(format!(
                "booking {} is {}, tickets are issued for confirmed bookings only",
                booking_id, booking.status
            )));
        }

        if let Some(link) = booking.qr_verification_link {
            return Ok(Ticket {
                booking_id,
                qr_verification_link: link,
            });
        }

        let token = self.sign(&booking)?;
        let link = format!("{}/tickets/verify/{}", self.public_base_url, token);
        self.ledger.attach_qr_link(booking_id, &link).await?;
        info!("Ticket issued for booking {}", booking_id);

        Ok(Ticket {
            booking_id,
            qr_verification_link: link,
        })
    }

    fn sign(&self, booking: &Booking) -> ReservationResult<String> {
        let now = self.clock.now();
        // Valid through the end of the travel day, plus the grace window.
        let end_of_travel_day = booking
            .travel_date
            .succ_opt()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
            .unwrap_or(now);
        let claims = TicketClaims {
            sub: booking.id,
            vid: booking.vehicle_id,
            seat: booking.seat_number,
            date: booking.travel_date,
            iat: now.timestamp(),
            exp: (end_of_travel_day.max(now) + self.validity).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| ReservationError::Storage(format!("ticket signing failed: {}", e)))
    }

    /// Checks a scanned token and that the booking behind it still stands.
    pub async fn verify(&self, token: &str) -> ReservationResult<TicketVerification> {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is judged against the service clock below.
        validation.validate_exp = false;

        let claims = decode::<TicketClaims>(token, &self.decoding_key, &validation)
            .map_err(|_| ReservationError::Unauthorized("invalid ticket".to_string()))?
            .claims;
        if self.clock.now().timestamp() >= claims.exp {
            return Err(ReservationError::Unauthorized("ticket has expired".to_string()));
        }

        let booking = self.ledger.get_booking(claims.sub).await?;
        if booking.vehicle_id != claims.vid
            || booking.seat_number != claims.seat
            || booking.travel_date != claims.date
        {
            return Err(ReservationError::Unauthorized(
                "ticket does not match booking".to_string(),
            ));
        }
        if booking.status != BookingStatus::Confirmed {
            return Err(ReservationError::InvalidState(format!(
                "booking {} is {}",
                booking.id, booking.status
            )));
        }

        Ok(TicketVerification {
            booking_id: booking.id,
            vehicle_id: booking.vehicle_id,
            route_id: booking.route_id,
            seat_number: booking.seat_number,
            travel_date: booking.travel_date,
            status: booking.status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::SeatLockManager;
    use chrono::{TimeZone, Utc};
    use safiri_core::clock::ManualClock;
    use safiri_core::models::NewBooking;
    use safiri_store::{InMemoryBookingRepository, InMemorySeatLockStore};

    struct Fixture {
        clock: Arc<ManualClock>,
        ledger: Arc<BookingLedger>,
        tickets: TicketIssuer,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 8, 4, 6, 0, 0).unwrap(),
        ));
        let repo = Arc::new(InMemoryBookingRepository::new());
        let locks = Arc::new(SeatLockManager::new(
            Arc::new(InMemorySeatLockStore::new()),
            repo.clone(),
            clock.clone(),
            Duration::seconds(900),
        ));
        let ledger = Arc::new(BookingLedger::new(
            locks,
            repo,
            clock.clone(),
            Duration::minutes(15),
        ));
        let tickets = TicketIssuer::new(
            ledger.clone(),
            clock.clone(),
            "ticket-secret",
            "https://safiri.example/",
            Duration::hours(6),
        );
        Fixture {
            clock,
            ledger,
            tickets,
        }
    }

    async fn pending_booking(f: &Fixture) -> Booking {
        let date = NaiveDate::from_ymd_opt(2025, 8, 4).unwrap();
        let vehicle_id = Uuid::from_u128(5);
        f.ledger
            .locks()
            .acquire_hold(vehicle_id, 2, date, "alice", None)
            .await
            .unwrap();
        f.ledger
            .create_booking(NewBooking {
                vehicle_id,
                route_id: Uuid::from_u128(1),
                seat_number: 2,
                travel_date: date,
                user_id: "alice".to_string(),
                price: 300,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_ticket_requires_confirmed_booking() {
        let f = fixture();
        let booking = pending_booking(&f).await;
        assert!(matches!(
            f.tickets.issue_ticket(booking.id).await,
            Err(ReservationError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_issue_is_idempotent_and_verifiable() {
        let f = fixture();
        let booking = pending_booking(&f).await;
        f.ledger.confirm_booking(booking.id).await.unwrap();

        let ticket = f.tickets.issue_ticket(booking.id).await.unwrap();
        assert!(ticket
            .qr_verification_link
            .starts_with("https://safiri.example/tickets/verify/"));
        let again = f.tickets.issue_ticket(booking.id).await.unwrap();
        assert_eq!(again, ticket);

        let stored = f.ledger.get_booking(booking.id).await.unwrap();
        assert_eq!(stored.qr_verification_link.as_deref(), Some(ticket.qr_verification_link.as_str()));

        let token = ticket.qr_verification_link.rsplit('/').next().unwrap();
        let verified = f.tickets.verify(token).await.unwrap();
        assert_eq!(verified.booking_id, booking.id);
        assert_eq!(verified.seat_number, 2);
    }

    #[tokio::test]
    async fn test_verify_rejects_tampering_and_stale_tickets() {
        let f = fixture();
        let booking = pending_booking(&f).await;
        f.ledger.confirm_booking(booking.id).await.unwrap();
        let ticket = f.tickets.issue_ticket(booking.id).await.unwrap();
        let token = ticket.qr_verification_link.rsplit('/').next().unwrap().to_string();

        let mut forged = token.clone();
        forged.push('x');
        assert!(matches!(
            f.tickets.verify(&forged).await,
            Err(ReservationError::Unauthorized(_))
        ));

        // End of the travel day plus six hours.
        f.clock.advance(Duration::hours(24));
        assert!(matches!(
            f.tickets.verify(&token).await,
            Err(ReservationError::Unauthorized(_))
        ));
    }
}

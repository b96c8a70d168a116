use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use safiri_core::clock::Clock;
use safiri_core::models::{Booking, BookingStatus};
use safiri_core::payment::{PaymentGateway, PaymentRequest, PaymentResult, PaymentStatus};
use safiri_core::{PaymentFailure, ReservationError, ReservationResult};
use safiri_shared::Masked;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::ledger::BookingLedger;

type GatewayResult = Result<PaymentResult, Box<dyn std::error::Error + Send + Sync>>;

/// Payment for one pending booking, as submitted by its owner.
#[derive(Debug, Clone)]
pub struct SettleRequest {
    pub booking_id: Uuid,
    pub user_id: String,
    pub amount: i32,
    pub phone_number: Option<Masked<String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentReceipt {
    pub booking: Booking,
    pub amount: i32,
    pub currency: String,
    pub transaction_reference: Option<String>,
    /// True when the booking had been confirmed by an earlier payment.
    pub already_confirmed: bool,
}

/// Charges the gateway for a pending booking and confirms it.
///
/// No seat lock is held while the gateway call is in flight; the booking's
/// expiry is checked again when the answer comes back. At most one charge
/// per booking is in flight at a time.
pub struct PaymentOrchestrator {
    gateway: Arc<dyn PaymentGateway>,
    ledger: Arc<BookingLedger>,
    clock: Arc<dyn Clock>,
    currency: String,
    timeout: Duration,
    in_flight: DashMap<Uuid, ()>,
}

/// Marks a booking as being charged; dropping it clears the mark.
struct InFlight<'a> {
    payments: &'a DashMap<Uuid, ()>,
    booking_id: Uuid,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.payments.remove(&self.booking_id);
    }
}

impl PaymentOrchestrator {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        ledger: Arc<BookingLedger>,
        clock: Arc<dyn Clock>,
        currency: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            ledger,
            clock,
            currency: currency.into(),
            timeout,
            in_flight: DashMap::new(),
        }
    }

    fn claim(&self, booking_id: Uuid) -> ReservationResult<InFlight<'_>> {
        match self.in_flight.entry(booking_id) {
            Entry::Occupied(_) => Err(ReservationError::InvalidState(format!(
                "payment for booking {} is already in progress",
                booking_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(InFlight {
                    payments: &self.in_flight,
                    booking_id,
                })
            }
        }
    }

    pub async fn settle(&self, request: SettleRequest) -> ReservationResult<PaymentReceipt> {
        // Claimed before the status read, so a second caller either sees the
        // claim or, once it is gone, the confirmed booking.
        let _in_flight = self.claim(request.booking_id)?;
        let booking = self.ledger.get_booking(request.booking_id).await?;
        if booking.user_id != request.user_id {
            return Err(ReservationError::Unauthorized(format!(
                "booking {} belongs to another user",
                booking.id
            )));
        }
        if request.amount != booking.price {
            return Err(ReservationError::Validation(format!(
                "amount {} does not match booking price {}",
                request.amount, booking.price
            )));
        }

        match booking.status {
            BookingStatus::Confirmed => {
                return Ok(self.receipt(booking, None, true));
            }
            BookingStatus::Expired => return Err(ReservationError::BookingExpired(booking.id)),
            BookingStatus::Cancelled => {
                return Err(ReservationError::InvalidState(format!(
                    "booking {} was cancelled",
                    booking.id
                )))
            }
            BookingStatus::Pending => {}
        }
        if booking.is_overdue(self.clock.now()) {
            self.ledger.expire_booking(booking.id).await?;
            return Err(ReservationError::BookingExpired(booking.id));
        }

        let charge = PaymentRequest {
            booking_id: booking.id,
            amount: booking.price,
            currency: self.currency.clone(),
            phone_number: request.phone_number,
            reference: booking.id.simple().to_string(),
        };
        let result = self.charge(&charge).await?;

        match self.ledger.confirm_booking(booking.id).await {
            Ok(confirmed) => {
                info!(
                    "Payment settled for booking {} ({:?})",
                    booking.id, result.transaction_reference
                );
                Ok(self.receipt(confirmed, result.transaction_reference, false))
            }
            // Money moved but the seat is gone: expired, or cancelled mid-flight.
            Err(ReservationError::BookingExpired(_)) | Err(ReservationError::InvalidState(_)) => {
                let case = self
                    .ledger
                    .record_reconciliation(&booking, result.transaction_reference.clone())
                    .await?;
                Err(ReservationError::ReconciliationRequired {
                    booking_id: case.booking_id,
                    transaction_reference: case.transaction_reference,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn charge(&self, request: &PaymentRequest) -> ReservationResult<PaymentResult> {
        let outcome = tokio::time::timeout(self.timeout, self.gateway.charge(request)).await;
        match outcome {
            Err(_) => {
                warn!("Payment gateway timed out for booking {}", request.booking_id);
                Err(PaymentFailure::Timeout.into())
            }
            Ok(Err(e)) => {
                warn!("Payment gateway error for booking {}: {}", request.booking_id, e);
                Err(PaymentFailure::Gateway(e.to_string()).into())
            }
            Ok(Ok(result)) => match result.status {
                PaymentStatus::Succeeded => Ok(result),
                PaymentStatus::Declined => {
                    let reason = result
                        .message
                        .unwrap_or_else(|| "declined by payer".to_string());
                    info!("Payment declined for booking {}: {}", request.booking_id, reason);
                    Err(PaymentFailure::Declined(reason).into())
                }
            },
        }
    }

    fn receipt(
        &self,
        booking: Booking,
        transaction_reference: Option<String>,
        already_confirmed: bool,
    ) -> PaymentReceipt {
        PaymentReceipt {
            amount: booking.price,
            currency: self.currency.clone(),
            booking,
            transaction_reference,
            already_confirmed,
        }
    }
}

/// What the mock gateway does with a charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    Succeed,
    Decline(String),
    /// Transport-level failure.
    Fail(String),
    /// Never answers.
    Hang,
}

/// Gateway stand-in for development and tests. Outcomes are consumed in
/// order from the script; once it is empty every charge gets `fallback`.
pub struct MockPaymentGateway {
    script: Mutex<VecDeque<MockOutcome>>,
    fallback: MockOutcome,
    latency: Duration,
    charges: AtomicUsize,
}

impl MockPaymentGateway {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: MockOutcome::Succeed,
            latency: Duration::ZERO,
            charges: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_fallback(mut self, fallback: MockOutcome) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn push(&self, outcome: MockOutcome) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(outcome);
    }

    pub fn charges(&self) -> usize {
        self.charges.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> MockOutcome {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

impl Default for MockPaymentGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn charge(&self, request: &PaymentRequest) -> GatewayResult {
        let n = self.charges.fetch_add(1, Ordering::SeqCst);
        let outcome = self.next_outcome();
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match outcome {
            MockOutcome::Succeed => Ok(PaymentResult::succeeded(format!(
                "MOCK{}{}",
                &request.reference[..8.min(request.reference.len())],
                n
            ))),
            MockOutcome::Decline(reason) => Ok(PaymentResult::declined(reason)),
            MockOutcome::Fail(reason) => Err(reason.into()),
            MockOutcome::Hang => {
                std::future::pending::<()>().await;
                Err("unreachable".into())
            }
        }
    }
}

/// Posts charges as JSON to an external payment service and expects a
/// `PaymentResult` back.
#[derive(Clone)]
pub struct HttpPaymentGateway {
    http_client: reqwest::Client,
    charge_url: String,
}

impl HttpPaymentGateway {
    pub fn new(charge_url: impl Into<String>) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            charge_url: charge_url.into(),
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn charge(&self, request: &PaymentRequest) -> GatewayResult {
        let response = self
            .http_client
            .post(&self.charge_url)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::PAYMENT_REQUIRED {
            let body = response.text().await.unwrap_or_default();
            return Ok(PaymentResult::declined(body));
        }
        if !status.is_success() {
            return Err(format!("payment service answered {}", status).into());
        }
        Ok(response.json::<PaymentResult>().await?)
    }
}

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use safiri_booking::SweepReport;
use safiri_core::{PaymentFailure, ReservationError};

/// Reservation counters, exposed in the Prometheus text format at `/metrics`.
pub struct Metrics {
    registry: Registry,
    pub holds_total: IntCounterVec,
    pub bookings_total: IntCounterVec,
    pub payments_total: IntCounterVec,
    pub sweeper_evictions_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let holds_total = IntCounterVec::new(
            Opts::new("safiri_holds_total", "Seat hold attempts by outcome"),
            &["outcome"],
        )?;
        let bookings_total = IntCounterVec::new(
            Opts::new("safiri_bookings_total", "Booking attempts by outcome"),
            &["outcome"],
        )?;
        let payments_total = IntCounterVec::new(
            Opts::new("safiri_payments_total", "Payment attempts by outcome"),
            &["outcome"],
        )?;
        let sweeper_evictions_total = IntCounterVec::new(
            Opts::new(
                "safiri_sweeper_evictions_total",
                "Records expired by the background sweeper",
            ),
            &["kind"],
        )?;

        registry.register(Box::new(holds_total.clone()))?;
        registry.register(Box::new(bookings_total.clone()))?;
        registry.register(Box::new(payments_total.clone()))?;
        registry.register(Box::new(sweeper_evictions_total.clone()))?;

        Ok(Self {
            registry,
            holds_total,
            bookings_total,
            payments_total,
            sweeper_evictions_total,
        })
    }

    pub fn record_sweep(&self, report: &SweepReport) {
        self.sweeper_evictions_total
            .with_label_values(&["hold"])
            .inc_by(report.holds_evicted as u64);
        self.sweeper_evictions_total
            .with_label_values(&["booking"])
            .inc_by(report.bookings_expired as u64);
        self.sweeper_evictions_total
            .with_label_values(&["checkout"])
            .inc_by(report.checkouts_expired as u64);
    }

    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Label for a failed operation.
pub fn outcome_label(err: &ReservationError) -> &'static str {
    match err {
        ReservationError::SeatUnavailable { .. } | ReservationError::SeatAlreadyBooked { .. } => {
            "conflict"
        }
        ReservationError::HoldExpired { .. } | ReservationError::BookingExpired(_) => "expired",
        ReservationError::PaymentFailed(PaymentFailure::Declined(_)) => "declined",
        ReservationError::PaymentFailed(PaymentFailure::Timeout) => "timeout",
        ReservationError::PaymentFailed(PaymentFailure::Gateway(_)) => "gateway_error",
        ReservationError::ReconciliationRequired { .. } => "reconciliation",
        ReservationError::Storage(_) => "error",
        _ => "rejected",
    }
}

//! Background expiry of lapsed holds, overdue bookings and stale checkouts.
//!
//! Correctness never depends on the sweeper: every read path already treats
//! an expired hold as absent. The sweeper only reclaims storage and emits
//! the `Expired` events subscribers wait for.

use safiri_core::ReservationResult;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::ledger::BookingLedger;
use crate::locks::SeatLockManager;
use crate::workflow::ReservationWorkflow;

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub holds_evicted: usize,
    pub bookings_expired: usize,
    pub checkouts_expired: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.holds_evicted == 0 && self.bookings_expired == 0 && self.checkouts_expired == 0
    }
}

pub struct ExpirySweeper {
    locks: Arc<SeatLockManager>,
    ledger: Arc<BookingLedger>,
    workflow: Option<Arc<ReservationWorkflow>>,
    every: Duration,
}

impl ExpirySweeper {
    pub fn new(ledger: Arc<BookingLedger>, every: Duration) -> Self {
        Self {
            locks: ledger.locks().clone(),
            ledger,
            workflow: None,
            every,
        }
    }

    pub fn with_workflow(mut self, workflow: Arc<ReservationWorkflow>) -> Self {
        self.workflow = Some(workflow);
        self
    }

    /// One pass. Bookings go first so their seats are released before the
    /// hold eviction runs.
    pub async fn sweep_once(&self) -> ReservationResult<SweepReport> {
        let bookings_expired = self.ledger.expire_overdue().await?.len();
        let holds_evicted = self.locks.evict_expired().await?.len();
        let checkouts_expired = match &self.workflow {
            Some(workflow) => workflow.expire_overdue().await?,
            None => 0,
        };

        Ok(SweepReport {
            holds_evicted,
            bookings_expired,
            checkouts_expired,
        })
    }

    /// Runs `sweep_once` on a fixed interval until `shutdown` turns true.
    /// A failed pass is logged and retried on the next tick.
    pub fn start<F>(self: Arc<Self>, mut shutdown: watch::Receiver<bool>, on_sweep: F) -> JoinHandle<()>
    where
        F: Fn(&SweepReport) + Send + Sync + 'static,
    {
        tokio::spawn(async move {
            info!("Expiry sweeper started, every {:?}", self.every);
            let mut ticker = interval(self.every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Expiry sweeper stopped");
                            return;
                        }
                        continue;
                    }
                }

                match self.sweep_once().await {
                    Ok(report) => {
                        if !report.is_empty() {
                            debug!("Sweep: {:?}", report);
                        }
                        on_sweep(&report);
                    }
                    Err(e) => error!("Expiry sweep failed: {}", e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use safiri_core::clock::ManualClock;
    use safiri_core::models::{BookingStatus, NewBooking};
    use safiri_shared::SeatEventKind;
    use safiri_store::{InMemoryBookingRepository, InMemorySeatLockStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn ledger(clock: Arc<ManualClock>) -> Arc<BookingLedger> {
        let repo = Arc::new(InMemoryBookingRepository::new());
        let locks = Arc::new(SeatLockManager::new(
            Arc::new(InMemorySeatLockStore::new()),
            repo.clone(),
            clock.clone(),
            chrono::Duration::seconds(900),
        ));
        Arc::new(BookingLedger::new(locks, repo, clock, chrono::Duration::seconds(900)))
    }

    #[tokio::test]
    async fn test_sweep_expires_bookings_and_evicts_holds() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 2, 6, 0, 0).unwrap(),
        ));
        let ledger = ledger(clock.clone());
        let locks = ledger.locks().clone();
        let date = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        let vehicle_id = Uuid::from_u128(9);

        locks.acquire_hold(vehicle_id, 1, date, "alice", None).await.unwrap();
        locks.acquire_hold(vehicle_id, 2, date, "bob", None).await.unwrap();
        let booking = ledger
            .create_booking(NewBooking {
                vehicle_id,
                route_id: Uuid::from_u128(1),
                seat_number: 2,
                travel_date: date,
                user_id: "bob".to_string(),
                price: 300,
            })
            .await
            .unwrap();

        let sweeper = ExpirySweeper::new(ledger.clone(), Duration::from_secs(30));
        assert!(sweeper.sweep_once().await.unwrap().is_empty());

        let mut events = locks.subscribe();
        clock.advance(chrono::Duration::seconds(900));
        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.bookings_expired, 1);
        assert_eq!(report.holds_evicted, 1);
        assert_eq!(
            ledger.get_booking(booking.id).await.unwrap().status,
            BookingStatus::Expired
        );

        let first = events.recv().await.unwrap();
        assert_eq!(first.kind, SeatEventKind::Expired);
        assert_eq!(first.booking_id, Some(booking.id));
        assert!(locks.check_availability(vehicle_id, 1, date, Some("carol")).await.unwrap());
        assert!(locks.check_availability(vehicle_id, 2, date, Some("carol")).await.unwrap());
    }

    #[tokio::test]
    async fn test_loop_stops_on_shutdown() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 2, 6, 0, 0).unwrap(),
        ));
        let sweeper = Arc::new(ExpirySweeper::new(ledger(clock), Duration::from_millis(10)));
        let (tx, rx) = watch::channel(false);
        let passes = Arc::new(AtomicUsize::new(0));
        let counter = passes.clone();

        let handle = sweeper.start(rx, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(passes.load(Ordering::SeqCst) >= 1);
    }
}

use chrono::{Duration, NaiveDate, TimeZone, Utc};
use safiri_booking::{
    BookingLedger, CheckoutState, ExpirySweeper, MockOutcome, MockPaymentGateway,
    PaymentOrchestrator, ReservationWorkflow, SeatLockManager, SettleRequest, TicketIssuer,
};
use safiri_catalog::{RouteCatalog, VehicleInventory};
use safiri_core::clock::{Clock, ManualClock};
use safiri_core::models::{BookingStatus, NewBooking};
use safiri_core::{PaymentFailure, ReservationError};
use safiri_store::{InMemoryBookingRepository, InMemoryCatalogRepository, InMemorySeatLockStore};
use std::sync::Arc;
use uuid::Uuid;

const SEED: &str = r#"{
  "routes": [
    {
      "id": "00000000-0000-0000-0000-000000000001",
      "origin": "Moi University",
      "destination": "Eldoret Town",
      "pickupPoint": "Main Gate Stage",
      "droppingPoint": "Eldoret Main Stage",
      "distanceKm": 35.0,
      "estimatedDurationMinutes": 50,
      "basePrice": 300
    }
  ],
  "vehicles": [
    {
      "id": "00000000-0000-0000-0000-000000000101",
      "routeId": "00000000-0000-0000-0000-000000000001",
      "registrationNumber": "KCA 123A",
      "totalSeats": 14,
      "departureTime": "07:00:00",
      "currentPrice": null
    },
    {
      "id": "00000000-0000-0000-0000-000000000102",
      "routeId": "00000000-0000-0000-0000-000000000001",
      "registrationNumber": "KBZ 789C",
      "totalSeats": 14,
      "departureTime": "09:00:00",
      "currentPrice": 350,
      "status": "maintenance"
    }
  ]
}"#;

fn route_id() -> Uuid {
    Uuid::from_u128(1)
}

fn matatu() -> Uuid {
    Uuid::from_u128(0x101)
}

fn in_maintenance() -> Uuid {
    Uuid::from_u128(0x102)
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 9, 1).unwrap()
}

struct System {
    clock: Arc<ManualClock>,
    locks: Arc<SeatLockManager>,
    ledger: Arc<BookingLedger>,
    gateway: Arc<MockPaymentGateway>,
    payments: Arc<PaymentOrchestrator>,
    inventory: Arc<VehicleInventory>,
    tickets: TicketIssuer,
    workflow: Arc<ReservationWorkflow>,
}

fn system_with(gateway: MockPaymentGateway, payment_timeout: std::time::Duration) -> System {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 9, 1, 5, 30, 0).unwrap(),
    ));
    let catalog = Arc::new(InMemoryCatalogRepository::from_json(SEED).unwrap());
    let bookings = Arc::new(InMemoryBookingRepository::new());
    let locks = Arc::new(SeatLockManager::new(
        Arc::new(InMemorySeatLockStore::new()),
        bookings.clone(),
        clock.clone(),
        Duration::seconds(900),
    ));
    let ledger = Arc::new(BookingLedger::new(
        locks.clone(),
        bookings,
        clock.clone(),
        Duration::seconds(900),
    ));
    let gateway = Arc::new(gateway);
    let payments = Arc::new(PaymentOrchestrator::new(
        gateway.clone(),
        ledger.clone(),
        clock.clone(),
        "KES",
        payment_timeout,
    ));
    let inventory = Arc::new(VehicleInventory::new(
        catalog.clone(),
        locks.clone(),
        clock.clone(),
    ));
    let tickets = TicketIssuer::new(
        ledger.clone(),
        clock.clone(),
        "scenario-secret",
        "http://localhost:8080",
        Duration::hours(72),
    );
    let workflow = Arc::new(ReservationWorkflow::new(
        RouteCatalog::new(catalog.clone()),
        VehicleInventory::new(catalog, locks.clone(), clock.clone()),
        ledger.clone(),
        payments.clone(),
        clock.clone(),
    ));

    System {
        clock,
        locks,
        ledger,
        gateway,
        payments,
        inventory,
        tickets,
        workflow,
    }
}

fn system() -> System {
    system_with(MockPaymentGateway::new(), std::time::Duration::from_secs(5))
}

fn new_booking(user: &str, seat: u32) -> NewBooking {
    NewBooking {
        vehicle_id: matatu(),
        route_id: route_id(),
        seat_number: seat,
        travel_date: today(),
        user_id: user.to_string(),
        price: 300,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_hundred_buyers_one_seat() {
    let sys = system();
    let mut tasks = Vec::new();
    for i in 0..100 {
        let locks = sys.locks.clone();
        tasks.push(tokio::spawn(async move {
            locks
                .acquire_hold(matatu(), 7, today(), &format!("student-{}", i), None)
                .await
        }));
    }

    let mut winners = 0;
    let mut refused = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => winners += 1,
            Err(ReservationError::SeatUnavailable { seat_number: 7 }) => refused += 1,
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(refused, 99);
}

#[tokio::test]
async fn test_hold_lapses_at_exactly_its_ttl() {
    let sys = system();
    sys.locks
        .acquire_hold(matatu(), 3, today(), "alice", None)
        .await
        .unwrap();

    sys.clock.advance(Duration::seconds(899));
    assert!(sys.locks.acquire_hold(matatu(), 3, today(), "bob", None).await.is_err());

    sys.clock.advance(Duration::seconds(1));
    assert!(sys.locks.acquire_hold(matatu(), 3, today(), "bob", None).await.is_ok());

    // Alice's hold is gone, so she can no longer book it.
    let err = sys.ledger.create_booking(new_booking("alice", 3)).await.unwrap_err();
    assert!(matches!(err, ReservationError::SeatUnavailable { .. }));
}

#[tokio::test]
async fn test_repeated_create_returns_same_booking() {
    let sys = system();
    sys.locks
        .acquire_hold(matatu(), 4, today(), "alice", None)
        .await
        .unwrap();

    let first = sys.ledger.create_booking(new_booking("alice", 4)).await.unwrap();
    let second = sys.ledger.create_booking(new_booking("alice", 4)).await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(
        sys.ledger.get_user_temporary_bookings("alice").await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_fare_falls_back_to_route_base_price() {
    let sys = system();
    let listed = sys
        .inventory
        .list_vehicles(route_id(), None, None)
        .await
        .unwrap();
    let by_id = |id: Uuid| listed.iter().find(|v| v.vehicle.id == id).unwrap();

    assert_eq!(by_id(matatu()).fare, 300);
    assert_eq!(by_id(matatu()).available_seats, 14);
    assert_eq!(by_id(in_maintenance()).fare, 350);

    let err = sys.inventory.select_seat(in_maintenance(), 1, today()).await.unwrap_err();
    assert!(matches!(err, ReservationError::VehicleUnavailable(_)));
}

#[tokio::test]
async fn test_seat_five_end_to_end() {
    let sys = system();
    sys.locks
        .acquire_hold(matatu(), 5, today(), "student-a", None)
        .await
        .unwrap();

    let listed = sys
        .inventory
        .vehicle_availability(matatu(), today(), Some("student-b"))
        .await
        .unwrap();
    assert_eq!(listed.available_seats, 13);

    let booking = sys.ledger.create_booking(new_booking("student-a", 5)).await.unwrap();
    assert_eq!(booking.status, BookingStatus::Pending);
    assert_eq!(booking.booking_expiry, sys.clock.now() + Duration::seconds(900));

    sys.clock.advance(Duration::minutes(5));
    let receipt = sys
        .payments
        .settle(SettleRequest {
            booking_id: booking.id,
            user_id: "student-a".to_string(),
            amount: 300,
            phone_number: None,
        })
        .await
        .unwrap();
    assert_eq!(receipt.booking.status, BookingStatus::Confirmed);
    assert!(receipt.transaction_reference.is_some());

    assert_eq!(sys.ledger.get_booked_seats(matatu(), today()).await.unwrap(), vec![5]);
    let err = sys
        .locks
        .acquire_hold(matatu(), 5, today(), "student-b", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ReservationError::SeatUnavailable { seat_number: 5 }));

    // Long after any hold would have lapsed, the seat stays booked.
    sys.clock.advance(Duration::hours(2));
    assert!(!sys
        .locks
        .check_availability(matatu(), 5, today(), Some("student-b"))
        .await
        .unwrap());

    let ticket = sys.tickets.issue_ticket(booking.id).await.unwrap();
    let token = ticket.qr_verification_link.rsplit('/').next().unwrap();
    assert_eq!(sys.tickets.verify(token).await.unwrap().seat_number, 5);
}

#[tokio::test]
async fn test_payment_landing_after_expiry_needs_reconciliation() {
    let sys = system_with(
        MockPaymentGateway::new().with_latency(std::time::Duration::from_millis(200)),
        std::time::Duration::from_secs(5),
    );
    sys.locks
        .acquire_hold(matatu(), 6, today(), "alice", None)
        .await
        .unwrap();
    let booking = sys.ledger.create_booking(new_booking("alice", 6)).await.unwrap();

    let payments = sys.payments.clone();
    let booking_id = booking.id;
    let settle = tokio::spawn(async move {
        payments
            .settle(SettleRequest {
                booking_id,
                user_id: "alice".to_string(),
                amount: 300,
                phone_number: None,
            })
            .await
    });

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    sys.clock.advance(Duration::seconds(901));

    let err = settle.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        ReservationError::ReconciliationRequired { booking_id: id, .. } if id == booking.id
    ));
    assert_eq!(
        sys.ledger.get_booking(booking.id).await.unwrap().status,
        BookingStatus::Expired
    );
    let cases = sys.ledger.reconciliations().await.unwrap();
    assert_eq!(cases.len(), 1);
    assert_eq!(cases[0].amount, 300);

    // The seat went back to the pool.
    assert!(sys
        .locks
        .acquire_hold(matatu(), 6, today(), "bob", None)
        .await
        .is_ok());
}

#[tokio::test]
async fn test_gateway_timeout_leaves_booking_payable() {
    let sys = system_with(
        MockPaymentGateway::new().with_fallback(MockOutcome::Hang),
        std::time::Duration::from_millis(50),
    );
    sys.locks
        .acquire_hold(matatu(), 9, today(), "alice", None)
        .await
        .unwrap();
    let booking = sys.ledger.create_booking(new_booking("alice", 9)).await.unwrap();

    let request = SettleRequest {
        booking_id: booking.id,
        user_id: "alice".to_string(),
        amount: 300,
        phone_number: None,
    };
    let err = sys.payments.settle(request.clone()).await.unwrap_err();
    assert!(matches!(
        err,
        ReservationError::PaymentFailed(PaymentFailure::Timeout)
    ));
    assert_eq!(
        sys.ledger.get_booking(booking.id).await.unwrap().status,
        BookingStatus::Pending
    );

    sys.gateway.push(MockOutcome::Succeed);
    let receipt = sys.payments.settle(request).await.unwrap();
    assert_eq!(receipt.booking.status, BookingStatus::Confirmed);
}

#[tokio::test]
async fn test_concurrent_settles_charge_once() {
    let sys = system_with(
        MockPaymentGateway::new().with_latency(std::time::Duration::from_millis(100)),
        std::time::Duration::from_secs(5),
    );
    sys.locks
        .acquire_hold(matatu(), 13, today(), "alice", None)
        .await
        .unwrap();
    let booking = sys.ledger.create_booking(new_booking("alice", 13)).await.unwrap();
    let request = SettleRequest {
        booking_id: booking.id,
        user_id: "alice".to_string(),
        amount: 300,
        phone_number: None,
    };

    let (a, b) = tokio::join!(
        sys.payments.settle(request.clone()),
        sys.payments.settle(request.clone())
    );
    assert_eq!(sys.gateway.charges(), 1);

    let (receipt, refused) = match (a, b) {
        (Ok(receipt), Err(e)) | (Err(e), Ok(receipt)) => (receipt, e),
        other => panic!("expected one charge and one refusal, got {:?}", other),
    };
    assert!(!receipt.already_confirmed);
    assert_eq!(receipt.booking.status, BookingStatus::Confirmed);
    assert!(matches!(refused, ReservationError::InvalidState(_)));

    // Once the first charge is done a retry gets the receipt back for free.
    let again = sys.payments.settle(request).await.unwrap();
    assert!(again.already_confirmed);
    assert_eq!(sys.gateway.charges(), 1);
}

#[tokio::test]
async fn test_wrong_amount_is_rejected_before_charging() {
    let sys = system();
    sys.locks
        .acquire_hold(matatu(), 10, today(), "alice", None)
        .await
        .unwrap();
    let booking = sys.ledger.create_booking(new_booking("alice", 10)).await.unwrap();

    let err = sys
        .payments
        .settle(SettleRequest {
            booking_id: booking.id,
            user_id: "alice".to_string(),
            amount: 250,
            phone_number: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ReservationError::Validation(_)));
    assert_eq!(sys.gateway.charges(), 0);
}

#[tokio::test]
async fn test_checkout_happy_path() {
    let sys = system();
    let checkout = sys.workflow.start("alice", route_id(), None).await.unwrap();
    assert_eq!(checkout.state, CheckoutState::RouteSelected);
    assert_eq!(checkout.travel_date, today());

    let checkout = sys
        .workflow
        .select_vehicle(checkout.id, "alice", matatu())
        .await
        .unwrap();
    assert_eq!(checkout.state, CheckoutState::VehicleSelected);
    assert_eq!(checkout.fare, Some(300));

    let checkout = sys.workflow.hold_seat(checkout.id, "alice", 2).await.unwrap();
    assert_eq!(checkout.state, CheckoutState::SeatHeld);

    // Switching seats frees the first one.
    let checkout = sys.workflow.hold_seat(checkout.id, "alice", 3).await.unwrap();
    assert_eq!(checkout.seat_number, Some(3));
    assert!(sys
        .locks
        .check_availability(matatu(), 2, today(), Some("bob"))
        .await
        .unwrap());

    let checkout = sys.workflow.create_booking(checkout.id, "alice").await.unwrap();
    assert_eq!(checkout.state, CheckoutState::BookingPending);

    let (checkout, receipt) = sys
        .workflow
        .pay(checkout.id, "alice", 300, None)
        .await
        .unwrap();
    assert_eq!(checkout.state, CheckoutState::Confirmed);
    assert_eq!(Some(receipt.booking.id), checkout.booking_id);

    let err = sys.workflow.cancel(checkout.id, "alice").await.unwrap_err();
    assert!(matches!(err, ReservationError::InvalidState(_)));
}

#[tokio::test]
async fn test_checkout_guards_and_expiry() {
    let sys = system();
    let checkout = sys.workflow.start("alice", route_id(), None).await.unwrap();

    // Steps cannot be skipped.
    let err = sys.workflow.hold_seat(checkout.id, "alice", 1).await.unwrap_err();
    assert!(matches!(err, ReservationError::InvalidState(_)));
    let err = sys.workflow.select_vehicle(checkout.id, "alice", in_maintenance()).await.unwrap_err();
    assert!(matches!(err, ReservationError::VehicleUnavailable(_)));
    let err = sys.workflow.get(checkout.id, "mallory").await.unwrap_err();
    assert!(matches!(err, ReservationError::Unauthorized(_)));

    sys.workflow.select_vehicle(checkout.id, "alice", matatu()).await.unwrap();
    sys.workflow.hold_seat(checkout.id, "alice", 1).await.unwrap();

    sys.clock.advance(Duration::seconds(900));
    let err = sys.workflow.create_booking(checkout.id, "alice").await.unwrap_err();
    assert!(matches!(err, ReservationError::HoldExpired { seat_number: 1 }));
    assert_eq!(
        sys.workflow.get(checkout.id, "alice").await.unwrap().state,
        CheckoutState::Expired
    );
}

#[tokio::test]
async fn test_checkout_declined_payment_can_retry() {
    let sys = system();
    sys.gateway.push(MockOutcome::Decline("insufficient funds".to_string()));

    let checkout = sys.workflow.start("alice", route_id(), Some(today())).await.unwrap();
    sys.workflow.select_vehicle(checkout.id, "alice", matatu()).await.unwrap();
    sys.workflow.hold_seat(checkout.id, "alice", 11).await.unwrap();
    sys.workflow.create_booking(checkout.id, "alice").await.unwrap();

    let err = sys.workflow.pay(checkout.id, "alice", 300, None).await.unwrap_err();
    assert!(matches!(
        err,
        ReservationError::PaymentFailed(PaymentFailure::Declined(_))
    ));
    let after = sys.workflow.get(checkout.id, "alice").await.unwrap();
    assert_eq!(after.state, CheckoutState::BookingPending);
    assert!(after.last_error.is_some());

    let (done, _) = sys.workflow.pay(checkout.id, "alice", 300, None).await.unwrap();
    assert_eq!(done.state, CheckoutState::Confirmed);
}

#[tokio::test]
async fn test_checkout_cancel_releases_booking() {
    let sys = system();
    let checkout = sys.workflow.start("alice", route_id(), None).await.unwrap();
    sys.workflow.select_vehicle(checkout.id, "alice", matatu()).await.unwrap();
    sys.workflow.hold_seat(checkout.id, "alice", 12).await.unwrap();
    let pending = sys.workflow.create_booking(checkout.id, "alice").await.unwrap();

    let cancelled = sys.workflow.cancel(checkout.id, "alice").await.unwrap();
    assert_eq!(cancelled.state, CheckoutState::Cancelled);
    let booking = sys.ledger.get_booking(pending.booking_id.unwrap()).await.unwrap();
    assert_eq!(booking.status, BookingStatus::Cancelled);
    assert!(sys
        .locks
        .check_availability(matatu(), 12, today(), Some("bob"))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_idle_checkouts_expire_and_are_pruned() {
    let sys = system();
    for _ in 0..50 {
        sys.workflow.start("alice", route_id(), None).await.unwrap();
    }
    let picked = sys.workflow.start("bob", route_id(), None).await.unwrap();
    sys.workflow.select_vehicle(picked.id, "bob", matatu()).await.unwrap();
    assert_eq!(sys.workflow.active_sessions(), 51);

    sys.clock.advance(Duration::minutes(29));
    assert_eq!(sys.workflow.expire_overdue().await.unwrap(), 0);

    sys.clock.advance(Duration::minutes(1));
    assert_eq!(sys.workflow.expire_overdue().await.unwrap(), 51);
    assert_eq!(
        sys.workflow.get(picked.id, "bob").await.unwrap().state,
        CheckoutState::Expired
    );
    let err = sys.workflow.hold_seat(picked.id, "bob", 4).await.unwrap_err();
    assert!(matches!(err, ReservationError::InvalidState(_)));

    sys.clock.advance(Duration::minutes(60));
    sys.workflow.expire_overdue().await.unwrap();
    assert_eq!(sys.workflow.active_sessions(), 0);
}

#[tokio::test]
async fn test_sweep_expires_checkout_while_payment_is_in_flight() {
    let sys = system_with(
        MockPaymentGateway::new().with_latency(std::time::Duration::from_millis(200)),
        std::time::Duration::from_secs(5),
    );
    let sweeper = ExpirySweeper::new(sys.ledger.clone(), std::time::Duration::from_secs(60))
        .with_workflow(sys.workflow.clone());

    let checkout = sys.workflow.start("alice", route_id(), None).await.unwrap();
    sys.workflow.select_vehicle(checkout.id, "alice", matatu()).await.unwrap();
    sys.workflow.hold_seat(checkout.id, "alice", 7).await.unwrap();
    let pending = sys.workflow.create_booking(checkout.id, "alice").await.unwrap();
    let booking_id = pending.booking_id.unwrap();

    let workflow = sys.workflow.clone();
    let id = checkout.id;
    let paying = tokio::spawn(async move { workflow.pay(id, "alice", 300, None).await });

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(
        sys.workflow.get(checkout.id, "alice").await.unwrap().state,
        CheckoutState::PaymentProcessing
    );

    sys.clock.advance(Duration::seconds(901));
    let report = sweeper.sweep_once().await.unwrap();
    assert_eq!(report.bookings_expired, 1);
    assert_eq!(report.checkouts_expired, 1);
    assert_eq!(
        sys.workflow.get(checkout.id, "alice").await.unwrap().state,
        CheckoutState::Expired
    );

    // The gateway still answers with success; the money needs reconciling.
    let err = paying.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        ReservationError::ReconciliationRequired { booking_id: b, .. } if b == booking_id
    ));
    assert_eq!(sys.gateway.charges(), 1);
    let after = sys.workflow.get(checkout.id, "alice").await.unwrap();
    assert_eq!(after.state, CheckoutState::Expired);
    assert!(after.last_error.is_some());
    assert_eq!(
        sys.ledger.get_booking(booking_id).await.unwrap().status,
        BookingStatus::Expired
    );
    assert_eq!(sys.ledger.reconciliations().await.unwrap().len(), 1);
}

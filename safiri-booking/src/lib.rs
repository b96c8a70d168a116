pub mod ledger;
pub mod locks;
pub mod payment;
pub mod sweeper;
pub mod ticket;
pub mod workflow;

pub use ledger::BookingLedger;
pub use locks::{HoldOutcome, SeatLockManager};
pub use payment::{
    HttpPaymentGateway, MockOutcome, MockPaymentGateway, PaymentOrchestrator, PaymentReceipt,
    SettleRequest,
};
pub use sweeper::{ExpirySweeper, SweepReport};
pub use ticket::{Ticket, TicketIssuer, TicketVerification};
pub use workflow::{Checkout, CheckoutState, ReservationWorkflow};

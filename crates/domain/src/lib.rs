//! Entities of the order fulfillment saga.
//!
//! - [`Order`] with its [`OrderStatus`] state machine and event timeline
//! - inventory [`Product`]s, [`Reservation`]s and [`StockMovement`]s
//! - payment [`Transaction`]s

pub mod error;
pub mod inventory;
pub mod order;
pub mod payment;

pub use error::OrderError;
pub use inventory::{
    MovementKind, Product, Reservation, ReservationOutcome, ReservationRejection,
    ReservationStatus, ReservedLine, StockMovement, StockRequest,
};
pub use order::{
    CustomerInfo, NewOrder, NewOrderLine, Order, OrderEventRecord, OrderEventType, OrderLine,
    OrderStatus, OrderSummary,
};
pub use payment::{Transaction, TransactionStatus};

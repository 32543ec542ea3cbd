//! Choreographed order fulfillment saga.
//!
//! Participants react to events on the message fabric; none of them owns
//! the whole workflow:
//!
//! 1. [`OrderSagaCoordinator`] accepts an order and emits `OrderCreated`
//! 2. its validation consumer moves the order to `VALIDATING` and requests
//!    a reservation
//! 3. [`InventoryReservationCoordinator`] reserves every line or none
//! 4. the coordinator moves the order to `RESERVED` and requests payment
//! 5. [`PaymentProcessor`] charges, then confirms or releases the stock
//! 6. the coordinator moves the order to `CONFIRMED` or `REJECTED`
//!
//! Every consumer is wrapped in an [`IdempotentHandler`] so redelivered
//! messages are acknowledged without being processed twice.

pub mod coordinator;
pub mod error;
pub mod events;
pub mod handler;
pub mod inventory;
pub mod notification;
pub mod payment;
pub mod runtime;
pub mod topology;

pub use coordinator::{
    CreateOrderOutcome, OrderSagaCoordinator, OrderTimeline, SagaEventHandler, ValidationHandler,
};
pub use error::{Result, SagaError};
pub use events::{DecodedEvent, SagaEvent};
pub use handler::IdempotentHandler;
pub use inventory::{InventoryHandler, InventoryReservationCoordinator};
pub use notification::{
    InMemoryNotifier, LoggingNotifier, Notification, NotificationHandler, Notifier,
};
pub use payment::{
    GatewayOutcome, PAYMENT_DECLINED, PaymentGateway, PaymentHandler, PaymentProcessor,
    RandomGateway, ScriptedGateway, gateway_reference,
};
pub use runtime::{RuntimeConfig, SagaDependencies, SagaRuntime};

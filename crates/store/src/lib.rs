//! Persistence for the order saga.
//!
//! Three repositories back the saga participants: orders with their
//! append-only event timeline, inventory (products, reservations, stock
//! movements) and payment transactions. Each has an in-memory and a
//! PostgreSQL implementation.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod repository;

pub use error::{Result, StoreError};
pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use repository::{InventoryRepository, OrderRepository, PaymentRepository, SagaStore};

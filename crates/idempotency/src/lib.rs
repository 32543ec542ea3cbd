//! Idempotency guard for the order saga.
//!
//! Client-submitted operations are deduplicated by idempotency key
//! (`idempotency:<key>`, result stored for 24 hours by default) and consumed
//! messages by message id (`msg:<id>`).

pub mod error;
pub mod guard;
pub mod store;

pub use error::{IdempotencyError, Result};
pub use guard::{IdempotencyCheck, IdempotencyConfig, IdempotencyGuard};
pub use store::{InMemoryKeyValueStore, KeyValueStore};

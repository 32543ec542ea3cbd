//! Saga error types.

use common::OrderId;
use domain::OrderError;
use messaging::MessagingError;
use store::StoreError;
use thiserror::Error;

/// Errors surfaced by saga participants.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The intake request was malformed.
    #[error("Validation failed: {0}")]
    Validation(#[from] OrderError),

    /// The request is not allowed in the order's current state.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// A request with the same idempotency key is still running.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The durable publish path failed.
    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;

impl From<SagaError> for messaging::HandlerError {
    fn from(err: SagaError) -> Self {
        messaging::HandlerError::new(err.to_string())
    }
}

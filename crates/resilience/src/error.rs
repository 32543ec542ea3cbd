use std::time::Duration;

use thiserror::Error;

/// Failure of a call made through the resilience layer.
#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    /// The dependency's breaker is open (or its half-open trial is taken).
    #[error("Circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    #[error("Operation timed out after {after:?}")]
    Timeout { after: Duration },

    /// The operation itself failed.
    #[error("{0}")]
    Operation(E),
}

impl<E> ResilienceError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen { .. })
    }

    /// Returns the operation's own error, if that is what failed.
    pub fn into_operation(self) -> Option<E> {
        match self {
            ResilienceError::Operation(err) => Some(err),
            _ => None,
        }
    }
}

/// Classifies errors for [`retry_with_backoff`](crate::retry_with_backoff).
pub trait Retryable {
    /// False for errors that will fail identically on every attempt.
    fn is_retryable(&self) -> bool {
        true
    }
}

impl<E: Retryable> Retryable for ResilienceError<E> {
    fn is_retryable(&self) -> bool {
        match self {
            ResilienceError::CircuitOpen { .. } => false,
            ResilienceError::Timeout { .. } => true,
            ResilienceError::Operation(err) => err.is_retryable(),
        }
    }
}

/// Client-error statuses that are never retried: bad request,
/// unauthorized and not found.
pub fn is_client_error_status(status: u16) -> bool {
    matches!(status, 400 | 401 | 404)
}

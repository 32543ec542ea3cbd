use thiserror::Error;

/// Errors raised by the key/value store behind the guard.
#[derive(Debug, Error)]
pub enum IdempotencyError {
    /// The key/value store cannot be reached.
    #[error("Idempotency store unavailable")]
    Unavailable,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, IdempotencyError>;

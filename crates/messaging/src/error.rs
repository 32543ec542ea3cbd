use thiserror::Error;

/// Errors raised by the message fabric.
#[derive(Debug, Error)]
pub enum MessagingError {
    /// The fabric cannot be reached (connection lost).
    #[error("Message broker unavailable")]
    Unavailable,

    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// A redeclaration disagrees with the existing declaration.
    #[error("Topology conflict: {0}")]
    TopologyConflict(String),

    /// The outbox holding messages for an unavailable fabric is full.
    #[error("Outbox full ({capacity} messages pending)")]
    OutboxFull { capacity: usize },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

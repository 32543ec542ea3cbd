//! Analytics error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalyticsError {
    /// The record payload did not look like an order event.
    #[error("Malformed analytics record: {0}")]
    Malformed(String),

    #[error("Payload deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AnalyticsError>;

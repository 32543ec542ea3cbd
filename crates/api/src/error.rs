//! API error types with HTTP response mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use saga::SagaError;
use serde_json::json;
use thiserror::Error;

use crate::middleware::current_correlation_id;

/// API-level error type that maps to HTTP responses.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error(transparent)]
    Saga(#[from] SagaError),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::NotFound(_) | ApiError::Saga(SagaError::OrderNotFound(_)) => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::Saga(SagaError::Validation(_)) => {
                (StatusCode::BAD_REQUEST, "validation_error")
            }
            ApiError::Saga(SagaError::InvalidOperation(_)) => {
                (StatusCode::BAD_REQUEST, "invalid_operation")
            }
            ApiError::Saga(SagaError::Conflict(_)) => (StatusCode::CONFLICT, "conflict"),
            ApiError::Saga(SagaError::Messaging(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
            ApiError::Saga(_) | ApiError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = json!({
            "error": code,
            "message": self.to_string(),
            "correlation_id": current_correlation_id(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use common::OrderId;
    use domain::OrderError;

    use super::*;

    #[test]
    fn test_saga_errors_map_to_statuses() {
        let cases = [
            (SagaError::Validation(OrderError::NoItems), StatusCode::BAD_REQUEST),
            (
                SagaError::InvalidOperation("already confirmed".to_string()),
                StatusCode::BAD_REQUEST,
            ),
            (SagaError::OrderNotFound(OrderId::new()), StatusCode::NOT_FOUND),
            (
                SagaError::Conflict("key-1 in flight".to_string()),
                StatusCode::CONFLICT,
            ),
            (
                SagaError::Messaging(messaging::MessagingError::Unavailable),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status_and_code().0, expected);
        }
    }

    #[test]
    fn test_message_is_the_error_text() {
        let err = ApiError::from(SagaError::Validation(OrderError::NoItems));
        assert_eq!(err.to_string(), "Validation failed: Order must contain at least one item");
    }
}

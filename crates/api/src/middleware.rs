//! Request middleware: correlation ids and authentication.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use common::CorrelationId;
use serde_json::json;

use crate::auth::{AuthError, Authenticator};

/// Header carrying the saga trace key in and out of the service.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

tokio::task_local! {
    static CORRELATION_ID: CorrelationId;
}

/// The correlation id of the request being served, if any.
pub fn current_correlation_id() -> Option<CorrelationId> {
    CORRELATION_ID.try_with(|id| *id).ok()
}

/// Adopts the caller's `X-Correlation-ID` or mints one, exposes it to
/// handlers as an extension and echoes it on the response.
pub async fn correlation_id(mut req: Request, next: Next) -> Response {
    let correlation_id = req
        .headers()
        .get(CORRELATION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.parse::<CorrelationId>().ok())
        .unwrap_or_default();
    req.extensions_mut().insert(correlation_id);

    let mut response = CORRELATION_ID.scope(correlation_id, next.run(req)).await;
    if let Ok(value) = HeaderValue::from_str(&correlation_id.to_string()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(CORRELATION_ID_HEADER), value);
    }
    response
}

/// Rejects requests without acceptable bearer credentials.
pub async fn authenticate(
    State(auth): State<Arc<Authenticator>>,
    mut req: Request,
    next: Next,
) -> Response {
    if !auth.is_required() {
        return next.run(req).await;
    }

    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    match auth.authenticate(header).await {
        Ok(credentials) => {
            req.extensions_mut().insert(credentials);
            next.run(req).await
        }
        Err(err) => unauthorized(&err),
    }
}

fn unauthorized(err: &AuthError) -> Response {
    metrics::counter!("auth_rejections_total").increment(1);
    let body = json!({
        "error": "unauthorized",
        "message": err.to_string(),
        "correlation_id": current_correlation_id(),
    });
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}

//! Health check endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use resilience::{CircuitSnapshot, CircuitState};
use serde::Serialize;

use crate::AppState;

/// Body of `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub service: &'static str,
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
    pub checks: HealthChecks,
}

/// Per-dependency results behind the overall status.
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub message_fabric: ComponentHealth,
    pub idempotency_store: ComponentHealth,
    pub outbox: OutboxHealth,
    pub circuit_breakers: BreakerHealth,
}

/// A dependency that is either reachable or not.
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    /// `healthy` or `unhealthy`.
    pub status: &'static str,
}

impl ComponentHealth {
    fn from_flag(healthy: bool) -> Self {
        Self {
            status: if healthy { "healthy" } else { "unhealthy" },
        }
    }

    fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Debug, Serialize)]
pub struct OutboxHealth {
    /// Messages parked while the broker was unreachable.
    pub pending: usize,
}

/// Breaker summary. Open breakers are reported but do not degrade health.
#[derive(Debug, Serialize)]
pub struct BreakerHealth {
    pub total: usize,
    /// Names of the breakers currently open.
    pub open: Vec<String>,
}

/// Body of `GET /health/circuit-breakers`.
#[derive(Debug, Serialize)]
pub struct CircuitBreakersResponse {
    pub circuit_breakers: Vec<CircuitSnapshot>,
}

/// GET /health
///
/// `503` with status `degraded` when the fabric or the idempotency store is
/// down, or any breaker is open. Parked outbox messages are reported but do
/// not degrade the service on their own.
pub async fn check<S>(State(state): State<Arc<AppState<S>>>) -> (StatusCode, Json<HealthResponse>) {
    let message_fabric = ComponentHealth::from_flag(state.broker.is_available());
    let idempotency_store = ComponentHealth::from_flag(state.guard.is_healthy().await);
    let breakers = state.breakers.status().await;
    let open: Vec<String> = breakers
        .iter()
        .filter(|b| b.state == CircuitState::Open)
        .map(|b| b.name.clone())
        .collect();

    let healthy = message_fabric.is_healthy() && idempotency_store.is_healthy() && open.is_empty();
    let (code, status) = if healthy {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    let response = HealthResponse {
        service: "order-saga",
        status,
        timestamp: Utc::now(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        checks: HealthChecks {
            message_fabric,
            idempotency_store,
            outbox: OutboxHealth {
                pending: state.publisher.pending().await,
            },
            circuit_breakers: BreakerHealth {
                total: breakers.len(),
                open,
            },
        },
    };
    (code, Json(response))
}

/// GET /health/circuit-breakers
pub async fn circuit_breakers<S>(
    State(state): State<Arc<AppState<S>>>,
) -> Json<CircuitBreakersResponse> {
    Json(CircuitBreakersResponse {
        circuit_breakers: state.breakers.status().await,
    })
}

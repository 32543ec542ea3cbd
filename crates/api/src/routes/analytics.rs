//! Real-time analytics dashboard feed.

use std::sync::Arc;

use analytics::RealtimeSnapshot;
use axum::Json;
use axum::extract::State;

use crate::AppState;

/// GET /analytics/realtime
pub async fn realtime<S>(State(state): State<Arc<AppState<S>>>) -> Json<RealtimeSnapshot> {
    Json(state.realtime.snapshot().await)
}

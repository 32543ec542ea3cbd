//! Real-time dashboard counters.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CorrelationId, Money, OrderId};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::Result;
use crate::event::AnalyticsEvent;
use crate::projection::{Projection, ProjectionPosition};

/// How many events the recent-events feed keeps.
pub const RECENT_EVENTS_LIMIT: usize = 50;

/// One entry of the recent-events feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentEvent {
    pub event_type: String,
    pub order_id: Option<OrderId>,
    pub correlation_id: Option<CorrelationId>,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time copy of the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RealtimeSnapshot {
    pub orders_created: u64,
    pub orders_confirmed: u64,
    pub orders_rejected: u64,
    pub orders_cancelled: u64,
    /// Sum of confirmed order totals.
    pub total_revenue: Money,
    /// Newest first.
    pub recent_events: Vec<RecentEvent>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug)]
struct State {
    orders_created: u64,
    orders_confirmed: u64,
    orders_rejected: u64,
    orders_cancelled: u64,
    total_revenue: Money,
    recent_events: VecDeque<RecentEvent>,
    last_updated: DateTime<Utc>,
}

impl State {
    fn new() -> Self {
        Self {
            orders_created: 0,
            orders_confirmed: 0,
            orders_rejected: 0,
            orders_cancelled: 0,
            total_revenue: Money::zero(),
            recent_events: VecDeque::with_capacity(RECENT_EVENTS_LIMIT),
            last_updated: Utc::now(),
        }
    }
}

/// Order counters, confirmed revenue and a feed of recent events.
///
/// Every event lands in the feed, including types the counters ignore.
#[derive(Clone)]
pub struct RealtimeMetrics {
    state: Arc<RwLock<State>>,
    position: Arc<RwLock<ProjectionPosition>>,
}

impl RealtimeMetrics {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::new())),
            position: Arc::new(RwLock::new(ProjectionPosition::zero())),
        }
    }

    pub async fn snapshot(&self) -> RealtimeSnapshot {
        let state = self.state.read().await;
        RealtimeSnapshot {
            orders_created: state.orders_created,
            orders_confirmed: state.orders_confirmed,
            orders_rejected: state.orders_rejected,
            orders_cancelled: state.orders_cancelled,
            total_revenue: state.total_revenue,
            recent_events: state.recent_events.iter().cloned().collect(),
            last_updated: state.last_updated,
        }
    }
}

impl Default for RealtimeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Projection for RealtimeMetrics {
    fn name(&self) -> &'static str {
        "RealtimeMetrics"
    }

    async fn handle(&self, event: &AnalyticsEvent) -> Result<()> {
        let mut state = self.state.write().await;

        match event.event_type.as_str() {
            "OrderCreated" => state.orders_created += 1,
            "OrderConfirmed" => {
                state.orders_confirmed += 1;
                state.total_revenue += event.amount.unwrap_or_default();
            }
            "OrderRejected" => state.orders_rejected += 1,
            "OrderCancelled" => state.orders_cancelled += 1,
            _ => {}
        }

        state.recent_events.push_front(RecentEvent {
            event_type: event.event_type.clone(),
            order_id: event.order_id,
            correlation_id: event.correlation_id,
            timestamp: event.timestamp,
        });
        state.recent_events.truncate(RECENT_EVENTS_LIMIT);
        state.last_updated = Utc::now();

        let mut pos = self.position.write().await;
        *pos = pos.advance();

        Ok(())
    }

    async fn position(&self) -> ProjectionPosition {
        *self.position.read().await
    }

    async fn reset(&self) -> Result<()> {
        *self.state.write().await = State::new();
        *self.position.write().await = ProjectionPosition::zero();
        Ok(())
    }
}

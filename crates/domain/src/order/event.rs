//! Append-only order event log entries.

use chrono::{DateTime, Utc};
use common::{CorrelationId, OrderId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kinds of entries written to an order's timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderEventType {
    OrderCreated,
    OrderValidating,
    InventoryReserved,
    PaymentCompleted,
    PaymentFailed,
    OrderConfirmed,
    OrderRejected,
    OrderCancelled,
}

impl OrderEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderEventType::OrderCreated => "OrderCreated",
            OrderEventType::OrderValidating => "OrderValidating",
            OrderEventType::InventoryReserved => "InventoryReserved",
            OrderEventType::PaymentCompleted => "PaymentCompleted",
            OrderEventType::PaymentFailed => "PaymentFailed",
            OrderEventType::OrderConfirmed => "OrderConfirmed",
            OrderEventType::OrderRejected => "OrderRejected",
            OrderEventType::OrderCancelled => "OrderCancelled",
        }
    }
}

impl std::fmt::Display for OrderEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OrderCreated" => Ok(OrderEventType::OrderCreated),
            "OrderValidating" => Ok(OrderEventType::OrderValidating),
            "InventoryReserved" => Ok(OrderEventType::InventoryReserved),
            "PaymentCompleted" => Ok(OrderEventType::PaymentCompleted),
            "PaymentFailed" => Ok(OrderEventType::PaymentFailed),
            "OrderConfirmed" => Ok(OrderEventType::OrderConfirmed),
            "OrderRejected" => Ok(OrderEventType::OrderRejected),
            "OrderCancelled" => Ok(OrderEventType::OrderCancelled),
            other => Err(format!("unknown order event type: {other}")),
        }
    }
}

/// A write-once entry in an order's audit timeline.
///
/// The payload is a point-in-time snapshot; records are never updated or
/// deleted once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEventRecord {
    pub id: Uuid,
    pub order_id: OrderId,
    pub correlation_id: CorrelationId,
    pub event_type: OrderEventType,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl OrderEventRecord {
    pub fn new(
        order_id: OrderId,
        correlation_id: CorrelationId,
        event_type: OrderEventType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            correlation_id,
            event_type,
            payload,
            created_at: Utc::now(),
        }
    }
}

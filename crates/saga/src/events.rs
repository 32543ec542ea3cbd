//! Saga events carried on the message fabric.
//!
//! Every event travels as the JSON payload of a [`Message`], adjacently
//! tagged as `{"type": "<EventType>", "data": {...}}`. The message itself
//! carries the message id, correlation id and emission timestamp.

use chrono::{DateTime, Utc};
use common::{CorrelationId, CustomerId, Money, OrderId};
use domain::{OrderLine, OrderStatus, ReservedLine, StockRequest};
use messaging::Message;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::topology::routing;

/// Events exchanged between saga participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaEvent {
    /// An order was accepted at intake.
    OrderCreated(OrderCreatedData),

    /// The coordinator asks inventory to hold stock.
    ReserveInventory(ReserveInventoryData),

    /// Every line of the order is held.
    InventoryReserved(InventoryReservedData),

    /// Nothing was held; the order cannot proceed.
    InventoryFailed(RejectionData),

    /// The coordinator asks for the order total to be charged.
    ProcessPayment(ProcessPaymentData),

    PaymentCompleted(PaymentCompletedData),

    PaymentFailed(PaymentFailedData),

    /// Broadcast to notification consumers after payment settles.
    OrderConfirmed(OrderConfirmedData),

    /// Broadcast to notification consumers on any rejection.
    OrderRejected(RejectionData),

    /// The customer cancelled; participants stop forward progress.
    OrderCancelled(OrderCancelledData),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreatedData {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub items: Vec<OrderLine>,
    pub total_amount: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveInventoryData {
    pub order_id: OrderId,
    pub items: Vec<StockRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryReservedData {
    pub order_id: OrderId,
    pub items: Vec<ReservedLine>,
    /// Sum of the confirmed line totals at catalog prices.
    pub total_amount: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionData {
    pub order_id: OrderId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessPaymentData {
    pub order_id: OrderId,
    /// The total computed when the order was created.
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentCompletedData {
    pub order_id: OrderId,
    pub transaction_id: Uuid,
    pub amount: Money,
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentFailedData {
    pub order_id: OrderId,
    pub transaction_id: Uuid,
    pub reason: String,
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderConfirmedData {
    pub order_id: OrderId,
    pub total_amount: Money,
    pub transaction_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCancelledData {
    pub order_id: OrderId,
    pub previous_status: OrderStatus,
}

/// A decoded message payload.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEvent {
    Known(SagaEvent),
    /// A well-formed payload whose `type` tag this build does not know.
    Unknown(String),
}

impl SagaEvent {
    /// Every `type` tag this build understands.
    pub const KNOWN_TYPES: [&'static str; 10] = [
        "OrderCreated",
        "ReserveInventory",
        "InventoryReserved",
        "InventoryFailed",
        "ProcessPayment",
        "PaymentCompleted",
        "PaymentFailed",
        "OrderConfirmed",
        "OrderRejected",
        "OrderCancelled",
    ];

    pub fn event_type(&self) -> &'static str {
        match self {
            SagaEvent::OrderCreated(_) => "OrderCreated",
            SagaEvent::ReserveInventory(_) => "ReserveInventory",
            SagaEvent::InventoryReserved(_) => "InventoryReserved",
            SagaEvent::InventoryFailed(_) => "InventoryFailed",
            SagaEvent::ProcessPayment(_) => "ProcessPayment",
            SagaEvent::PaymentCompleted(_) => "PaymentCompleted",
            SagaEvent::PaymentFailed(_) => "PaymentFailed",
            SagaEvent::OrderConfirmed(_) => "OrderConfirmed",
            SagaEvent::OrderRejected(_) => "OrderRejected",
            SagaEvent::OrderCancelled(_) => "OrderCancelled",
        }
    }

    pub fn order_id(&self) -> OrderId {
        match self {
            SagaEvent::OrderCreated(data) => data.order_id,
            SagaEvent::ReserveInventory(data) => data.order_id,
            SagaEvent::InventoryReserved(data) => data.order_id,
            SagaEvent::InventoryFailed(data) | SagaEvent::OrderRejected(data) => data.order_id,
            SagaEvent::ProcessPayment(data) => data.order_id,
            SagaEvent::PaymentCompleted(data) => data.order_id,
            SagaEvent::PaymentFailed(data) => data.order_id,
            SagaEvent::OrderConfirmed(data) => data.order_id,
            SagaEvent::OrderCancelled(data) => data.order_id,
        }
    }

    /// Topic routing key the event is published under.
    pub fn routing_key(&self) -> &'static str {
        match self {
            SagaEvent::OrderCreated(_) => routing::ORDER_CREATED,
            SagaEvent::ReserveInventory(_) => routing::INVENTORY_RESERVE,
            SagaEvent::InventoryReserved(_) => routing::INVENTORY_RESERVED,
            SagaEvent::InventoryFailed(_) | SagaEvent::OrderRejected(_) => routing::ORDER_REJECTED,
            SagaEvent::ProcessPayment(_) => routing::PAYMENT_PROCESS,
            SagaEvent::PaymentCompleted(_) => routing::PAYMENT_COMPLETED,
            SagaEvent::PaymentFailed(_) => routing::PAYMENT_FAILED,
            SagaEvent::OrderConfirmed(_) => routing::ORDER_CONFIRMED,
            SagaEvent::OrderCancelled(_) => routing::ORDER_CANCELLED,
        }
    }

    /// Wraps the event in a new message.
    pub fn to_message(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Message, serde_json::Error> {
        let message = Message::encode(self.routing_key(), correlation_id, self)?;
        Ok(message.with_event_type(self.event_type()))
    }

    /// Decodes a message payload, separating unknown tags from malformed payloads.
    pub fn from_message(message: &Message) -> Result<DecodedEvent, serde_json::Error> {
        match message.payload.get("type").and_then(serde_json::Value::as_str) {
            Some(tag) if !Self::KNOWN_TYPES.contains(&tag) => {
                Ok(DecodedEvent::Unknown(tag.to_string()))
            }
            _ => message.decode().map(DecodedEvent::Known),
        }
    }

    /// Payload sent to the analytics stream.
    pub fn analytics_payload(
        &self,
        correlation_id: CorrelationId,
        timestamp: DateTime<Utc>,
    ) -> Result<serde_json::Value, serde_json::Error> {
        let mut payload = serde_json::to_value(self)?;
        if let Some(object) = payload.as_object_mut() {
            object.insert("correlation_id".into(), serde_json::to_value(correlation_id)?);
            object.insert("timestamp".into(), serde_json::to_value(timestamp)?);
        }
        Ok(payload)
    }
}

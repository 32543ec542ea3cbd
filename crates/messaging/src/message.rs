//! Message envelope carried by the fabric.

use chrono::{DateTime, Utc};
use common::{CorrelationId, MessageId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Transport headers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeaders {
    /// How many times the message has been requeued after a failed delivery.
    #[serde(rename = "x-retry-count", default)]
    pub retry_count: u32,

    #[serde(rename = "x-event-type", default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,

    /// Set when the message is routed to a dead-letter queue.
    #[serde(rename = "x-death-reason", default, skip_serializing_if = "Option::is_none")]
    pub death_reason: Option<String>,
}

/// A message on the fabric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub correlation_id: CorrelationId,
    pub routing_key: String,
    pub headers: MessageHeaders,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(
        routing_key: impl Into<String>,
        correlation_id: CorrelationId,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            message_id: MessageId::new(),
            correlation_id,
            routing_key: routing_key.into(),
            headers: MessageHeaders::default(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Serializes `body` into a new message.
    pub fn encode<T: Serialize>(
        routing_key: impl Into<String>,
        correlation_id: CorrelationId,
        body: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            routing_key,
            correlation_id,
            serde_json::to_value(body)?,
        ))
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.headers.event_type = Some(event_type.into());
        self
    }

    pub fn with_message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = message_id;
        self
    }

    /// Deserializes the payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    pub fn retry_count(&self) -> u32 {
        self.headers.retry_count
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_headers_use_wire_names() {
        let mut message = Message::new("order.created", CorrelationId::new(), json!({}))
            .with_event_type("OrderCreated");
        message.headers.retry_count = 2;

        let value = serde_json::to_value(&message.headers).unwrap();
        assert_eq!(value["x-retry-count"], 2);
        assert_eq!(value["x-event-type"], "OrderCreated");
        assert!(value.get("x-death-reason").is_none());
    }

    #[test]
    fn test_new_message_starts_without_retries() {
        let message = Message::new("order.process", CorrelationId::new(), json!({"a": 1}));
        assert_eq!(message.retry_count(), 0);
        let body: serde_json::Map<String, serde_json::Value> = message.decode().unwrap();
        assert_eq!(body["a"], 1);
    }
}

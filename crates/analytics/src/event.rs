//! Loose decoding of analytics records.
//!
//! Records come from several emitters and may grow new fields or event
//! types at any time, so only the handful of fields the views need are
//! extracted and everything else is ignored.

use chrono::{DateTime, Utc};
use common::{CorrelationId, Money, OrderId};
use messaging::AnalyticsRecord;
use serde::Serialize;
use serde_json::Value;

use crate::{AnalyticsError, Result};

/// The parts of an analytics record the projections care about.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsEvent {
    pub event_type: String,
    pub order_id: Option<OrderId>,
    pub correlation_id: Option<CorrelationId>,
    /// `total_amount`, or `amount` for payment events.
    pub amount: Option<Money>,
    pub timestamp: DateTime<Utc>,
}

impl AnalyticsEvent {
    pub fn from_record(record: &AnalyticsRecord) -> Result<Self> {
        Self::from_payload(&record.payload, record.timestamp)
    }

    /// Extracts the event from a `{type, data, correlation_id, timestamp}`
    /// payload. Only `type` is required; `received_at` stands in for a
    /// missing or unparsable timestamp.
    pub fn from_payload(payload: &Value, received_at: DateTime<Utc>) -> Result<Self> {
        let event_type = payload
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| AnalyticsError::Malformed("missing event type".to_string()))?
            .to_string();
        let data = payload.get("data").unwrap_or(&Value::Null);

        let amount = data
            .get("total_amount")
            .or_else(|| data.get("amount"))
            .and_then(Value::as_i64)
            .map(Money::from_cents);

        let timestamp = payload
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|parsed| parsed.with_timezone(&Utc))
            .unwrap_or(received_at);

        Ok(Self {
            event_type,
            order_id: parse_field(data, "order_id"),
            correlation_id: parse_field(payload, "correlation_id"),
            amount,
            timestamp,
        })
    }
}

fn parse_field<T: std::str::FromStr>(value: &Value, field: &str) -> Option<T> {
    value.get(field)?.as_str()?.parse().ok()
}

//! Payment attempt records.

use chrono::{DateTime, Utc};
use common::{CorrelationId, Money, OrderId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Completed => "COMPLETED",
            TransactionStatus::Failed => "FAILED",
        }
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COMPLETED" => Ok(TransactionStatus::Completed),
            "FAILED" => Ok(TransactionStatus::Failed),
            other => Err(format!("unknown transaction status: {other}")),
        }
    }
}

/// One payment attempt. Immutable once written; retries add new rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub order_id: OrderId,
    pub correlation_id: CorrelationId,
    pub amount: Money,
    pub status: TransactionStatus,
    pub gateway_reference: String,
    pub gateway_response: serde_json::Value,
    pub processed_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(
        order_id: OrderId,
        correlation_id: CorrelationId,
        amount: Money,
        status: TransactionStatus,
        gateway_reference: String,
        gateway_response: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            correlation_id,
            amount,
            status,
            gateway_reference,
            gateway_response,
            processed_at: Utc::now(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == TransactionStatus::Completed
    }
}

//! Order lifecycle state machine.

use serde::{Deserialize, Serialize};

/// The status of an order in the saga.
///
/// ```text
/// PENDING ──► VALIDATING ──► RESERVED ──► CONFIRMED
///    │             │             │
///    ├─────────────┴──────┬──────┴──► REJECTED
///    └─────────────┴──────┴─────────► CANCELLED
/// ```
///
/// `PENDING -> REJECTED` only happens when the saga could not be started
/// at intake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Accepted at intake, not yet picked up by the validation consumer.
    #[default]
    Pending,

    /// Inventory reservation has been requested.
    Validating,

    /// Stock is held, payment has been requested.
    Reserved,

    /// Payment settled (terminal).
    Confirmed,

    /// Inventory or payment failed (terminal).
    Rejected,

    /// Cancelled by the customer (terminal).
    Cancelled,
}

impl OrderStatus {
    /// Returns true if `next` is a legal successor of this status.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Validating)
                | (Validating, Reserved)
                | (Pending | Validating, Rejected)
                | (Reserved, Confirmed)
                | (Reserved, Rejected)
                | (Pending | Validating | Reserved, Cancelled)
        )
    }

    /// Returns true if the order may still be cancelled.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Validating | OrderStatus::Reserved
        )
    }

    /// Returns true if this is a terminal status (the order is immutable).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Confirmed | OrderStatus::Rejected | OrderStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Validating => "VALIDATING",
            OrderStatus::Reserved => "RESERVED",
            OrderStatus::Confirmed => "CONFIRMED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OrderStatus::Pending),
            "VALIDATING" => Ok(OrderStatus::Validating),
            "RESERVED" => Ok(OrderStatus::Reserved),
            "CONFIRMED" => Ok(OrderStatus::Confirmed),
            "REJECTED" => Ok(OrderStatus::Rejected),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

//! Products, reservations and stock movements.

use chrono::{DateTime, Utc};
use common::{Money, OrderId, ProductId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A sellable product and its stock counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub sku: String,
    pub name: String,
    pub price: Money,
    pub quantity_available: u32,
    pub quantity_reserved: u32,
    pub is_active: bool,
}

impl Product {
    pub fn new(sku: impl Into<String>, name: impl Into<String>, price: Money, stock: u32) -> Self {
        Self {
            id: ProductId::new(),
            sku: sku.into(),
            name: name.into(),
            price,
            quantity_available: stock,
            quantity_reserved: 0,
            is_active: true,
        }
    }

    /// Stock that can still be reserved.
    pub fn available(&self) -> u32 {
        self.quantity_available.saturating_sub(self.quantity_reserved)
    }
}

/// Reservation lifecycle: `RESERVED -> CONFIRMED | RELEASED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Reserved,
    Confirmed,
    Released,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Reserved => "RESERVED",
            ReservationStatus::Confirmed => "CONFIRMED",
            ReservationStatus::Released => "RELEASED",
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RESERVED" => Ok(ReservationStatus::Reserved),
            "CONFIRMED" => Ok(ReservationStatus::Confirmed),
            "RELEASED" => Ok(ReservationStatus::Released),
            other => Err(format!("unknown reservation status: {other}")),
        }
    }
}

/// Stock committed to one line of one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
}

impl Reservation {
    pub fn new(order_id: OrderId, product_id: ProductId, quantity: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            product_id,
            quantity,
            status: ReservationStatus::Reserved,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementKind {
    Reserve,
    Release,
}

impl MovementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementKind::Reserve => "RESERVE",
            MovementKind::Release => "RELEASE",
        }
    }
}

impl std::str::FromStr for MovementKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RESERVE" => Ok(MovementKind::Reserve),
            "RELEASE" => Ok(MovementKind::Release),
            other => Err(format!("unknown movement kind: {other}")),
        }
    }
}

/// Audit entry for a change to a product's reserved counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub product_id: ProductId,
    pub order_id: OrderId,
    pub kind: MovementKind,
    pub quantity: u32,
    pub created_at: DateTime<Utc>,
}

impl StockMovement {
    pub fn new(
        product_id: ProductId,
        order_id: OrderId,
        kind: MovementKind,
        quantity: u32,
    ) -> Self {
        Self {
            product_id,
            order_id,
            kind,
            quantity,
            created_at: Utc::now(),
        }
    }
}

/// One line of a reservation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRequest {
    pub product_id: ProductId,
    pub quantity: u32,
}

/// A line of an order the inventory service confirmed, priced from the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedLine {
    pub product_id: ProductId,
    pub quantity: u32,
    pub unit_price: Money,
    pub line_total: Money,
}

/// Why an all-or-nothing reservation was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReservationRejection {
    ProductNotFound { product_id: ProductId },
    ProductInactive { product_id: ProductId },
    InsufficientStock {
        product_id: ProductId,
        requested: u32,
        available: u32,
    },
    OrderCancelled,
}

impl ReservationRejection {
    /// Short reason string carried on rejection events.
    pub fn reason(&self) -> &'static str {
        match self {
            ReservationRejection::ProductNotFound { .. } => "Product not found",
            ReservationRejection::ProductInactive { .. } => "Product inactive",
            ReservationRejection::InsufficientStock { .. } => "Insufficient stock",
            ReservationRejection::OrderCancelled => "Order cancelled",
        }
    }
}

/// Outcome of an all-or-nothing reservation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationOutcome {
    Reserved(Vec<ReservedLine>),
    Rejected(ReservationRejection),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_subtracts_reserved() {
        let mut product = Product::new("SKU-1", "Widget", Money::from_cents(500), 5);
        product.quantity_reserved = 2;
        assert_eq!(product.available(), 3);

        product.quantity_reserved = 9;
        assert_eq!(product.available(), 0);
    }

    #[test]
    fn test_rejection_reasons() {
        let product_id = ProductId::new();
        let rejection = ReservationRejection::InsufficientStock {
            product_id,
            requested: 3,
            available: 1,
        };
        assert_eq!(rejection.reason(), "Insufficient stock");
        assert_eq!(ReservationRejection::OrderCancelled.reason(), "Order cancelled");
    }

    #[test]
    fn test_reservation_status_parses() {
        assert_eq!("RELEASED".parse(), Ok(ReservationStatus::Released));
        assert!("HELD".parse::<ReservationStatus>().is_err());
    }
}

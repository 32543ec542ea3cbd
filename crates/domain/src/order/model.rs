//! The order entity and its intake shapes.

use chrono::{DateTime, Utc};
use common::{CorrelationId, CustomerId, Money, OrderId, ProductId};
use serde::{Deserialize, Serialize};

use super::OrderStatus;
use crate::error::OrderError;

/// Customer reference and contact fields captured at intake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerInfo {
    pub id: CustomerId,
    pub email: Option<String>,
    pub name: Option<String>,
}

impl CustomerInfo {
    pub fn new(id: CustomerId) -> Self {
        Self {
            id,
            email: None,
            name: None,
        }
    }
}

/// A line item as submitted by the client; the unit price is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrderLine {
    pub product_id: ProductId,
    pub product_name: Option<String>,
    pub quantity: u32,
    pub unit_price: Option<Money>,
}

impl NewOrderLine {
    pub fn new(product_id: ProductId, quantity: u32, unit_price: Money) -> Self {
        Self {
            product_id,
            product_name: None,
            quantity,
            unit_price: Some(unit_price),
        }
    }
}

/// Everything needed to create an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOrder {
    pub customer: CustomerInfo,
    pub items: Vec<NewOrderLine>,
    pub shipping_address: Option<serde_json::Value>,
    pub notes: Option<String>,
}

impl NewOrder {
    pub fn new(customer: CustomerInfo, items: Vec<NewOrderLine>) -> Self {
        Self {
            customer,
            items,
            shipping_address: None,
            notes: None,
        }
    }

    /// Checks the intake invariants without building anything.
    pub fn validate(&self) -> Result<(), OrderError> {
        if self.items.is_empty() {
            return Err(OrderError::NoItems);
        }
        for item in &self.items {
            if item.quantity == 0 {
                return Err(OrderError::InvalidQuantity {
                    product_id: item.product_id,
                    quantity: item.quantity,
                });
            }
            if let Some(price) = item.unit_price
                && price.is_negative()
            {
                return Err(OrderError::InvalidPrice {
                    product_id: item.product_id,
                    price_cents: price.cents(),
                });
            }
        }
        self.total().map(|_| ())
    }

    /// Sum of `unit_price * quantity`, with missing prices counted as zero.
    fn total(&self) -> Result<Money, OrderError> {
        self.items.iter().try_fold(Money::zero(), |total, item| {
            item.unit_price
                .unwrap_or_default()
                .checked_times(item.quantity)
                .and_then(|subtotal| total.checked_add(subtotal))
                .ok_or(OrderError::AmountOverflow {
                    product_id: item.product_id,
                })
        })
    }
}

/// A priced order line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: ProductId,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price: Money,
    pub subtotal: Money,
}

/// An order and its current saga status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub correlation_id: CorrelationId,
    pub customer: CustomerInfo,
    pub items: Vec<OrderLine>,
    pub total_amount: Money,
    pub status: OrderStatus,
    pub shipping_address: Option<serde_json::Value>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Validates the intake and builds a `PENDING` order.
    ///
    /// Missing unit prices count as zero, so the total is the sum of
    /// `unit_price * quantity` over the lines the client priced.
    pub fn place(new_order: NewOrder, correlation_id: CorrelationId) -> Result<Self, OrderError> {
        new_order.validate()?;

        let total_amount = new_order.total()?;

        // Subtotals cannot overflow once the checked total succeeded.
        let items: Vec<OrderLine> = new_order
            .items
            .into_iter()
            .map(|line| {
                let unit_price = line.unit_price.unwrap_or_default();
                OrderLine {
                    product_id: line.product_id,
                    product_name: line.product_name.unwrap_or_else(|| "Unknown".to_string()),
                    quantity: line.quantity,
                    unit_price,
                    subtotal: unit_price.times(line.quantity),
                }
            })
            .collect();
        let now = Utc::now();

        Ok(Self {
            id: OrderId::new(),
            correlation_id,
            customer: new_order.customer,
            items,
            total_amount,
            status: OrderStatus::Pending,
            shipping_address: new_order.shipping_address,
            notes: new_order.notes,
            created_at: now,
            updated_at: now,
        })
    }

    /// Moves the order to `next` if the state machine allows it.
    pub fn transition(&mut self, next: OrderStatus) -> Result<(), OrderError> {
        if !self.status.can_transition_to(next) {
            return Err(OrderError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn summary(&self) -> OrderSummary {
        OrderSummary {
            order_id: self.id,
            correlation_id: self.correlation_id,
            status: self.status,
            total_amount: self.total_amount,
            item_count: self.items.len(),
            created_at: self.created_at,
        }
    }
}

/// The result returned to intake callers, and stored for idempotent replays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSummary {
    pub order_id: OrderId,
    pub correlation_id: CorrelationId,
    pub status: OrderStatus,
    pub total_amount: Money,
    pub item_count: usize,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_order(items: Vec<NewOrderLine>) -> NewOrder {
        NewOrder::new(CustomerInfo::new(CustomerId::new()), items)
    }

    #[test]
    fn test_place_computes_subtotals_and_total() {
        let order = Order::place(
            new_order(vec![
                NewOrderLine::new(ProductId::new(), 2, Money::from_cents(1000)),
                NewOrderLine::new(ProductId::new(), 1, Money::from_cents(2500)),
            ]),
            CorrelationId::new(),
        )
        .unwrap();

        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.items[0].subtotal, Money::from_cents(2000));
        assert_eq!(order.total_amount, Money::from_cents(4500));
    }

    #[test]
    fn test_missing_price_counts_as_zero() {
        let mut line = NewOrderLine::new(ProductId::new(), 3, Money::zero());
        line.unit_price = None;
        let order = Order::place(new_order(vec![line]), CorrelationId::new()).unwrap();
        assert!(order.total_amount.is_zero());
        assert_eq!(order.items[0].product_name, "Unknown");
    }

    #[test]
    fn test_rejects_empty_items() {
        let result = Order::place(new_order(vec![]), CorrelationId::new());
        assert_eq!(result.unwrap_err(), OrderError::NoItems);
    }

    #[test]
    fn test_rejects_zero_quantity() {
        let product_id = ProductId::new();
        let result = Order::place(
            new_order(vec![NewOrderLine::new(product_id, 0, Money::from_cents(100))]),
            CorrelationId::new(),
        );
        assert_eq!(
            result.unwrap_err(),
            OrderError::InvalidQuantity {
                product_id,
                quantity: 0
            }
        );
    }

    #[test]
    fn test_rejects_negative_price() {
        let result = Order::place(
            new_order(vec![NewOrderLine::new(
                ProductId::new(),
                1,
                Money::from_cents(-1),
            )]),
            CorrelationId::new(),
        );
        assert!(matches!(result, Err(OrderError::InvalidPrice { .. })));
    }

    #[test]
    fn test_rejects_amounts_that_overflow() {
        let product_id = ProductId::new();
        let huge = Money::from_cents(i64::MAX / 2);

        let line_overflow = Order::place(
            new_order(vec![NewOrderLine::new(product_id, 3, huge)]),
            CorrelationId::new(),
        );
        assert_eq!(
            line_overflow.unwrap_err(),
            OrderError::AmountOverflow { product_id }
        );

        let total_overflow = Order::place(
            new_order(vec![
                NewOrderLine::new(ProductId::new(), 1, huge),
                NewOrderLine::new(ProductId::new(), 1, huge),
                NewOrderLine::new(product_id, 1, huge),
            ]),
            CorrelationId::new(),
        );
        assert_eq!(
            total_overflow.unwrap_err(),
            OrderError::AmountOverflow { product_id }
        );
    }

    #[test]
    fn test_transition_guards_terminal_orders() {
        let mut order = Order::place(
            new_order(vec![NewOrderLine::new(
                ProductId::new(),
                1,
                Money::from_cents(100),
            )]),
            CorrelationId::new(),
        )
        .unwrap();

        order.transition(OrderStatus::Cancelled).unwrap();
        let err = order.transition(OrderStatus::Validating).unwrap_err();
        assert_eq!(
            err,
            OrderError::InvalidTransition {
                from: OrderStatus::Cancelled,
                to: OrderStatus::Validating
            }
        );
    }
}

//! Order validation and lifecycle errors.

use common::ProductId;
use thiserror::Error;

use crate::order::OrderStatus;

/// Errors raised when building or transitioning an order.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OrderError {
    /// An order needs at least one line.
    #[error("Order must contain at least one item")]
    NoItems,

    /// Quantities are strictly positive.
    #[error("Invalid quantity {quantity} for product {product_id} (must be greater than 0)")]
    InvalidQuantity { product_id: ProductId, quantity: u32 },

    /// Unit prices cannot be negative.
    #[error("Invalid unit price {price_cents} for product {product_id}")]
    InvalidPrice {
        product_id: ProductId,
        price_cents: i64,
    },

    /// A subtotal or the order total does not fit in the money type.
    #[error("Order amount too large for product {product_id}")]
    AmountOverflow { product_id: ProductId },

    /// The requested transition is not in the state machine.
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },
}

use async_trait::async_trait;
use common::{CorrelationId, OrderId, ProductId};
use domain::{
    Order, OrderEventRecord, OrderStatus, Product, Reservation, ReservationOutcome, StockMovement,
    StockRequest, Transaction,
};

use crate::Result;

/// Orders and their event timeline.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Persists a new order together with its creation event, atomically.
    async fn insert_order(&self, order: &Order, created: OrderEventRecord) -> Result<()>;

    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>>;

    async fn find_by_correlation(&self, correlation_id: CorrelationId) -> Result<Option<Order>>;

    /// Moves the order to `to` only if its current status is one of `from`,
    /// appending `events` in the same write.
    ///
    /// Returns the updated order, or `None` when the order is unknown or its
    /// status no longer matches. Nothing is written in that case.
    async fn transition_status(
        &self,
        order_id: OrderId,
        from: &[OrderStatus],
        to: OrderStatus,
        events: Vec<OrderEventRecord>,
    ) -> Result<Option<Order>>;

    async fn append_event(&self, event: OrderEventRecord) -> Result<()>;

    /// Events of one order, oldest first.
    async fn events_for_order(&self, order_id: OrderId) -> Result<Vec<OrderEventRecord>>;

    /// Events of one saga instance, oldest first.
    async fn events_for_correlation(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Vec<OrderEventRecord>>;
}

/// Products, reservations and stock movements.
#[async_trait]
pub trait InventoryRepository: Send + Sync {
    async fn upsert_product(&self, product: &Product) -> Result<()>;

    async fn get_product(&self, product_id: ProductId) -> Result<Option<Product>>;

    /// Reserves every requested line or none of them.
    ///
    /// The availability check and the counter increments happen under one
    /// lock so concurrent requests for the same product cannot overcommit.
    /// If the order already holds live reservations they are returned
    /// unchanged, which makes redelivered requests harmless.
    async fn reserve_all(
        &self,
        order_id: OrderId,
        lines: &[StockRequest],
    ) -> Result<ReservationOutcome>;

    async fn reservations_for_order(&self, order_id: OrderId) -> Result<Vec<Reservation>>;

    /// Marks the order's `RESERVED` rows `CONFIRMED`. Returns how many changed.
    async fn confirm_reservations(&self, order_id: OrderId) -> Result<usize>;

    /// Releases the order's `RESERVED` rows and gives their quantity back.
    ///
    /// Rows already `RELEASED` or `CONFIRMED` are left alone, so calling
    /// this twice never double-decrements. Returns how many changed.
    async fn release_reservations(&self, order_id: OrderId) -> Result<usize>;

    async fn stock_movements(&self, product_id: ProductId) -> Result<Vec<StockMovement>>;
}

/// Payment attempts.
#[async_trait]
pub trait PaymentRepository: Send + Sync {
    async fn record_transaction(&self, transaction: &Transaction) -> Result<()>;

    async fn transactions_for_order(&self, order_id: OrderId) -> Result<Vec<Transaction>>;
}

/// Everything the saga participants persist.
pub trait SagaStore: OrderRepository + InventoryRepository + PaymentRepository {}

impl<T: OrderRepository + InventoryRepository + PaymentRepository + ?Sized> SagaStore for T {}

/// Folds repeated products into one line each, keeping first-seen order.
///
/// Quantities saturate, so an absurd request fails the stock check instead
/// of wrapping.
pub(crate) fn merge_lines(lines: &[StockRequest]) -> Vec<StockRequest> {
    let mut merged: Vec<StockRequest> = Vec::with_capacity(lines.len());
    for line in lines {
        match merged.iter_mut().find(|m| m.product_id == line.product_id) {
            Some(existing) => {
                existing.quantity = existing.quantity.saturating_add(line.quantity)
            }
            None => merged.push(*line),
        }
    }
    merged
}

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::{CorrelationId, OrderId, ProductId};
use domain::{
    MovementKind, Order, OrderEventRecord, OrderStatus, Product, Reservation,
    ReservationOutcome, ReservationRejection, ReservationStatus, ReservedLine, StockMovement,
    StockRequest, Transaction,
};
use tokio::sync::RwLock;

use crate::repository::{
    InventoryRepository, OrderRepository, PaymentRepository, merge_lines,
};
use crate::{Result, StoreError};

#[derive(Default)]
struct State {
    orders: HashMap<OrderId, Order>,
    events: Vec<OrderEventRecord>,
    products: HashMap<ProductId, Product>,
    reservations: Vec<Reservation>,
    movements: Vec<StockMovement>,
    transactions: Vec<Transaction>,
}

/// In-memory store for tests and single-process runs.
///
/// All tables live behind one lock, so every multi-row write is atomic.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored orders.
    pub async fn order_count(&self) -> usize {
        self.state.read().await.orders.len()
    }

    /// Number of stored order events across all orders.
    pub async fn event_count(&self) -> usize {
        self.state.read().await.events.len()
    }
}

fn priced_lines(state: &State, reservations: &[&Reservation]) -> Vec<ReservedLine> {
    reservations
        .iter()
        .map(|r| {
            let unit_price = state
                .products
                .get(&r.product_id)
                .map(|p| p.price)
                .unwrap_or_default();
            ReservedLine {
                product_id: r.product_id,
                quantity: r.quantity,
                unit_price,
                line_total: unit_price.times(r.quantity),
            }
        })
        .collect()
}

#[async_trait]
impl OrderRepository for InMemoryStore {
    async fn insert_order(&self, order: &Order, created: OrderEventRecord) -> Result<()> {
        let mut state = self.state.write().await;
        if state.orders.contains_key(&order.id) {
            return Err(StoreError::DuplicateOrder(order.id));
        }
        state.orders.insert(order.id, order.clone());
        state.events.push(created);
        Ok(())
    }

    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>> {
        Ok(self.state.read().await.orders.get(&order_id).cloned())
    }

    async fn find_by_correlation(&self, correlation_id: CorrelationId) -> Result<Option<Order>> {
        let state = self.state.read().await;
        Ok(state
            .orders
            .values()
            .find(|o| o.correlation_id == correlation_id)
            .cloned())
    }

    async fn transition_status(
        &self,
        order_id: OrderId,
        from: &[OrderStatus],
        to: OrderStatus,
        events: Vec<OrderEventRecord>,
    ) -> Result<Option<Order>> {
        let mut state = self.state.write().await;
        let Some(order) = state.orders.get_mut(&order_id) else {
            return Ok(None);
        };
        if !from.contains(&order.status) {
            return Ok(None);
        }
        order.status = to;
        order.updated_at = Utc::now();
        let updated = order.clone();
        state.events.extend(events);
        Ok(Some(updated))
    }

    async fn append_event(&self, event: OrderEventRecord) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.orders.contains_key(&event.order_id) {
            return Err(StoreError::OrderNotFound(event.order_id));
        }
        state.events.push(event);
        Ok(())
    }

    async fn events_for_order(&self, order_id: OrderId) -> Result<Vec<OrderEventRecord>> {
        let state = self.state.read().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn events_for_correlation(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Vec<OrderEventRecord>> {
        let state = self.state.read().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.correlation_id == correlation_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl InventoryRepository for InMemoryStore {
    async fn upsert_product(&self, product: &Product) -> Result<()> {
        self.state
            .write()
            .await
            .products
            .insert(product.id, product.clone());
        Ok(())
    }

    async fn get_product(&self, product_id: ProductId) -> Result<Option<Product>> {
        Ok(self.state.read().await.products.get(&product_id).cloned())
    }

    async fn reserve_all(
        &self,
        order_id: OrderId,
        lines: &[StockRequest],
    ) -> Result<ReservationOutcome> {
        let mut state = self.state.write().await;

        let existing: Vec<&Reservation> = state
            .reservations
            .iter()
            .filter(|r| r.order_id == order_id && r.status != ReservationStatus::Released)
            .collect();
        if !existing.is_empty() {
            return Ok(ReservationOutcome::Reserved(priced_lines(&state, &existing)));
        }

        let lines = merge_lines(lines);
        for line in &lines {
            let Some(product) = state.products.get(&line.product_id) else {
                return Ok(ReservationOutcome::Rejected(
                    ReservationRejection::ProductNotFound {
                        product_id: line.product_id,
                    },
                ));
            };
            if !product.is_active {
                return Ok(ReservationOutcome::Rejected(
                    ReservationRejection::ProductInactive {
                        product_id: line.product_id,
                    },
                ));
            }
            if product.available() < line.quantity {
                return Ok(ReservationOutcome::Rejected(
                    ReservationRejection::InsufficientStock {
                        product_id: line.product_id,
                        requested: line.quantity,
                        available: product.available(),
                    },
                ));
            }
        }

        let mut reserved = Vec::with_capacity(lines.len());
        for line in &lines {
            let product = state
                .products
                .get_mut(&line.product_id)
                .ok_or_else(|| {
                    StoreError::Corrupt(format!("product {} vanished", line.product_id))
                })?;
            product.quantity_reserved += line.quantity;
            reserved.push(ReservedLine {
                product_id: line.product_id,
                quantity: line.quantity,
                unit_price: product.price,
                line_total: product.price.times(line.quantity),
            });
            state
                .reservations
                .push(Reservation::new(order_id, line.product_id, line.quantity));
            state.movements.push(StockMovement::new(
                line.product_id,
                order_id,
                MovementKind::Reserve,
                line.quantity,
            ));
        }

        Ok(ReservationOutcome::Reserved(reserved))
    }

    async fn reservations_for_order(&self, order_id: OrderId) -> Result<Vec<Reservation>> {
        let state = self.state.read().await;
        Ok(state
            .reservations
            .iter()
            .filter(|r| r.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn confirm_reservations(&self, order_id: OrderId) -> Result<usize> {
        let mut state = self.state.write().await;
        let mut changed = 0;
        for reservation in state
            .reservations
            .iter_mut()
            .filter(|r| r.order_id == order_id && r.status == ReservationStatus::Reserved)
        {
            reservation.status = ReservationStatus::Confirmed;
            changed += 1;
        }
        Ok(changed)
    }

    async fn release_reservations(&self, order_id: OrderId) -> Result<usize> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let mut changed = 0;
        for reservation in state
            .reservations
            .iter_mut()
            .filter(|r| r.order_id == order_id && r.status == ReservationStatus::Reserved)
        {
            if let Some(product) = state.products.get_mut(&reservation.product_id) {
                product.quantity_reserved =
                    product.quantity_reserved.saturating_sub(reservation.quantity);
            }
            reservation.status = ReservationStatus::Released;
            state.movements.push(StockMovement::new(
                reservation.product_id,
                order_id,
                MovementKind::Release,
                reservation.quantity,
            ));
            changed += 1;
        }
        Ok(changed)
    }

    async fn stock_movements(&self, product_id: ProductId) -> Result<Vec<StockMovement>> {
        let state = self.state.read().await;
        Ok(state
            .movements
            .iter()
            .filter(|m| m.product_id == product_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PaymentRepository for InMemoryStore {
    async fn record_transaction(&self, transaction: &Transaction) -> Result<()> {
        self.state
            .write()
            .await
            .transactions
            .push(transaction.clone());
        Ok(())
    }

    async fn transactions_for_order(&self, order_id: OrderId) -> Result<Vec<Transaction>> {
        let state = self.state.read().await;
        Ok(state
            .transactions
            .iter()
            .filter(|t| t.order_id == order_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use common::{CustomerId, Money};
    use domain::{CustomerInfo, NewOrder, NewOrderLine, OrderEventType};

    use super::*;

    fn order() -> Order {
        Order::place(
            NewOrder::new(
                CustomerInfo::new(CustomerId::new()),
                vec![NewOrderLine::new(ProductId::new(), 1, Money::from_cents(100))],
            ),
            CorrelationId::new(),
        )
        .unwrap()
    }

    fn created(order: &Order) -> OrderEventRecord {
        OrderEventRecord::new(
            order.id,
            order.correlation_id,
            OrderEventType::OrderCreated,
            serde_json::json!({}),
        )
    }

    fn request(product_id: ProductId, quantity: u32) -> StockRequest {
        StockRequest {
            product_id,
            quantity,
        }
    }

    #[tokio::test]
    async fn test_insert_and_find_by_correlation() {
        let store = InMemoryStore::new();
        let order = order();
        store.insert_order(&order, created(&order)).await.unwrap();

        let found = store
            .find_by_correlation(order.correlation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, order.id);
        assert_eq!(store.event_count().await, 1);

        let duplicate = store.insert_order(&order, created(&order)).await;
        assert!(matches!(duplicate, Err(StoreError::DuplicateOrder(_))));
    }

    #[tokio::test]
    async fn test_transition_is_status_checked() {
        let store = InMemoryStore::new();
        let order = order();
        store.insert_order(&order, created(&order)).await.unwrap();

        let moved = store
            .transition_status(order.id, &[OrderStatus::Pending], OrderStatus::Validating, vec![])
            .await
            .unwrap();
        assert_eq!(moved.unwrap().status, OrderStatus::Validating);

        // A second attempt from PENDING no longer matches and writes nothing.
        let event = OrderEventRecord::new(
            order.id,
            order.correlation_id,
            OrderEventType::OrderValidating,
            serde_json::json!({}),
        );
        let noop = store
            .transition_status(
                order.id,
                &[OrderStatus::Pending],
                OrderStatus::Validating,
                vec![event],
            )
            .await
            .unwrap();
        assert!(noop.is_none());
        assert_eq!(store.events_for_order(order.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reserve_all_is_all_or_nothing() {
        let store = InMemoryStore::new();
        let plenty = Product::new("A", "Plenty", Money::from_cents(100), 10);
        let scarce = Product::new("B", "Scarce", Money::from_cents(200), 1);
        store.upsert_product(&plenty).await.unwrap();
        store.upsert_product(&scarce).await.unwrap();

        let order_id = OrderId::new();
        let outcome = store
            .reserve_all(order_id, &[request(plenty.id, 2), request(scarce.id, 3)])
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ReservationOutcome::Rejected(ReservationRejection::InsufficientStock {
                product_id: scarce.id,
                requested: 3,
                available: 1,
            })
        );
        let plenty_after = store.get_product(plenty.id).await.unwrap().unwrap();
        assert_eq!(plenty_after.quantity_reserved, 0);
        assert!(store.reservations_for_order(order_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reserve_all_is_idempotent_per_order() {
        let store = InMemoryStore::new();
        let product = Product::new("A", "Widget", Money::from_cents(250), 5);
        store.upsert_product(&product).await.unwrap();
        let order_id = OrderId::new();

        let first = store
            .reserve_all(order_id, &[request(product.id, 2)])
            .await
            .unwrap();
        let second = store
            .reserve_all(order_id, &[request(product.id, 2)])
            .await
            .unwrap();

        assert_eq!(first, second);
        let after = store.get_product(product.id).await.unwrap().unwrap();
        assert_eq!(after.quantity_reserved, 2);
        assert_eq!(store.stock_movements(product.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_and_inactive_products_reject() {
        let store = InMemoryStore::new();
        let mut inactive = Product::new("X", "Retired", Money::from_cents(100), 5);
        inactive.is_active = false;
        store.upsert_product(&inactive).await.unwrap();

        let missing = ProductId::new();
        let outcome = store
            .reserve_all(OrderId::new(), &[request(missing, 1)])
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReservationOutcome::Rejected(ReservationRejection::ProductNotFound {
                product_id: missing
            })
        );

        let outcome = store
            .reserve_all(OrderId::new(), &[request(inactive.id, 1)])
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ReservationOutcome::Rejected(ReservationRejection::ProductInactive { .. })
        ));
    }

    #[tokio::test]
    async fn test_release_restores_counter_once() {
        let store = InMemoryStore::new();
        let product = Product::new("A", "Widget", Money::from_cents(100), 5);
        store.upsert_product(&product).await.unwrap();
        let order_id = OrderId::new();
        store
            .reserve_all(order_id, &[request(product.id, 2)])
            .await
            .unwrap();

        assert_eq!(store.release_reservations(order_id).await.unwrap(), 1);
        assert_eq!(store.release_reservations(order_id).await.unwrap(), 0);

        let after = store.get_product(product.id).await.unwrap().unwrap();
        assert_eq!(after.quantity_reserved, 0);
        let kinds: Vec<MovementKind> = store
            .stock_movements(product.id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.kind)
            .collect();
        assert_eq!(kinds, vec![MovementKind::Reserve, MovementKind::Release]);
    }

    #[tokio::test]
    async fn test_confirmed_reservations_are_not_released() {
        let store = InMemoryStore::new();
        let product = Product::new("A", "Widget", Money::from_cents(100), 5);
        store.upsert_product(&product).await.unwrap();
        let order_id = OrderId::new();
        store
            .reserve_all(order_id, &[request(product.id, 2)])
            .await
            .unwrap();

        assert_eq!(store.confirm_reservations(order_id).await.unwrap(), 1);
        assert_eq!(store.release_reservations(order_id).await.unwrap(), 0);
        let after = store.get_product(product.id).await.unwrap().unwrap();
        assert_eq!(after.quantity_reserved, 2);
    }
}

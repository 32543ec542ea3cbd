//! Order saga coordinator.
//!
//! Owns the order lifecycle. It accepts orders at intake, emits the
//! initiating `OrderCreated` event, and is the only writer of order status:
//! every later transition happens here in reaction to events published by
//! the inventory and payment participants.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::{CorrelationId, OrderId};
use domain::{
    NewOrder, Order, OrderEventRecord, OrderEventType, OrderStatus, OrderSummary, StockRequest,
};
use idempotency::{IdempotencyCheck, IdempotencyGuard};
use messaging::{BestEffortSink, DurablePublisher, HandlerError, Message, MessageHandler};
use serde::Serialize;
use serde_json::json;
use store::SagaStore;
use tracing::{debug, info, warn};

use crate::error::{Result, SagaError};
use crate::events::{
    InventoryReservedData, OrderCancelledData, OrderCreatedData, PaymentCompletedData,
    PaymentFailedData, ProcessPaymentData, RejectionData, ReserveInventoryData, SagaEvent,
};
use crate::handler::decode_event;
use crate::topology::{
    ANALYTICS_TOPIC, NOTIFICATION_EXCHANGE, ORDER_EVENTS_EXCHANGE, ORDER_PROCESS_QUEUE,
    PAYMENT_PROCESS_QUEUE, routing,
};

/// Rejection reason for an order whose initiating event could not be sent.
pub const SAGA_NOT_STARTED: &str = "Order processing could not be started";

const CANCELLABLE: [OrderStatus; 3] = [
    OrderStatus::Pending,
    OrderStatus::Validating,
    OrderStatus::Reserved,
];

/// Result of an intake request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOrderOutcome {
    /// A new order was persisted and its saga started.
    Created(OrderSummary),
    /// The idempotency key was seen before; this is the stored result.
    Duplicate(OrderSummary),
}

impl CreateOrderOutcome {
    pub fn summary(&self) -> &OrderSummary {
        match self {
            CreateOrderOutcome::Created(summary) | CreateOrderOutcome::Duplicate(summary) => {
                summary
            }
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, CreateOrderOutcome::Duplicate(_))
    }
}

/// An order together with its audit timeline, oldest event first.
#[derive(Debug, Clone, Serialize)]
pub struct OrderTimeline {
    pub order: Order,
    pub events: Vec<OrderEventRecord>,
}

/// Drives an order from intake to a terminal status.
pub struct OrderSagaCoordinator<S> {
    store: S,
    publisher: DurablePublisher,
    guard: IdempotencyGuard,
    analytics: BestEffortSink,
}

impl<S: SagaStore> OrderSagaCoordinator<S> {
    pub fn new(
        store: S,
        publisher: DurablePublisher,
        guard: IdempotencyGuard,
        analytics: BestEffortSink,
    ) -> Self {
        Self {
            store,
            publisher,
            guard,
            analytics,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Accepts an order under a fresh correlation id.
    pub async fn create_order(
        &self,
        new_order: NewOrder,
        idempotency_key: Option<&str>,
    ) -> Result<CreateOrderOutcome> {
        self.create_order_with_correlation(new_order, idempotency_key, CorrelationId::new())
            .await
    }

    /// Accepts an order and starts its saga under the caller's correlation id.
    ///
    /// With an idempotency key that was already recorded, the stored summary
    /// is returned and nothing is written or published. The key is recorded
    /// only once the saga has started; a failed attempt frees it again.
    #[tracing::instrument(skip(self, new_order))]
    pub async fn create_order_with_correlation(
        &self,
        new_order: NewOrder,
        idempotency_key: Option<&str>,
        correlation_id: CorrelationId,
    ) -> Result<CreateOrderOutcome> {
        let Some(key) = idempotency_key else {
            return self
                .start_saga(new_order, correlation_id)
                .await
                .map(CreateOrderOutcome::Created);
        };

        match self.guard.check_and_reserve::<OrderSummary>(key).await {
            IdempotencyCheck::Previous(summary) => {
                info!(
                    order_id = %summary.order_id,
                    "duplicate submission, returning stored result"
                );
                return Ok(CreateOrderOutcome::Duplicate(summary));
            }
            IdempotencyCheck::InProgress => {
                return Err(SagaError::Conflict(format!(
                    "A request with idempotency key {key} is still being processed"
                )));
            }
            IdempotencyCheck::NotFound => {}
        }

        match self.start_saga(new_order, correlation_id).await {
            Ok(summary) => {
                self.guard.mark_processed(key, &summary, None).await;
                Ok(CreateOrderOutcome::Created(summary))
            }
            Err(err) => {
                self.guard.release(key).await;
                Err(err)
            }
        }
    }

    /// Persists the order and hands it to the validation consumer.
    async fn start_saga(
        &self,
        new_order: NewOrder,
        correlation_id: CorrelationId,
    ) -> Result<OrderSummary> {
        let order = Order::place(new_order, correlation_id)?;
        let data = OrderCreatedData {
            order_id: order.id,
            customer_id: order.customer.id,
            items: order.items.clone(),
            total_amount: order.total_amount,
        };
        let created = OrderEventRecord::new(
            order.id,
            order.correlation_id,
            OrderEventType::OrderCreated,
            serde_json::to_value(&data)?,
        );
        self.store.insert_order(&order, created).await?;

        let event = SagaEvent::OrderCreated(data);
        if let Err(err) = self.announce(&event, order.correlation_id).await {
            self.abandon(&order, &err).await;
            return Err(err);
        }
        self.emit_analytics(&event, order.correlation_id).await;

        metrics::counter!("orders_created_total").increment(1);
        info!(
            order_id = %order.id,
            correlation_id = %order.correlation_id,
            total = %order.total_amount,
            items = order.items.len(),
            "order created"
        );
        Ok(order.summary())
    }

    async fn announce(&self, event: &SagaEvent, correlation_id: CorrelationId) -> Result<()> {
        let message = event.to_message(correlation_id)?;
        self.publisher
            .publish(ORDER_EVENTS_EXCHANGE, routing::ORDER_CREATED, message.clone())
            .await?;
        self.publisher
            .send_to_queue(ORDER_PROCESS_QUEUE, message)
            .await?;
        Ok(())
    }

    /// Moves an order whose saga never started to `REJECTED`.
    async fn abandon(&self, order: &Order, cause: &SagaError) {
        let record = OrderEventRecord::new(
            order.id,
            order.correlation_id,
            OrderEventType::OrderRejected,
            json!({ "reason": SAGA_NOT_STARTED, "rejected_at": Utc::now() }),
        );
        match self
            .store
            .transition_status(
                order.id,
                &[OrderStatus::Pending],
                OrderStatus::Rejected,
                vec![record],
            )
            .await
        {
            Ok(Some(rejected)) => {
                warn!(order_id = %order.id, error = %cause, "saga not started, order rejected");
                self.transitioned(&rejected);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(order_id = %order.id, error = %err, "failed to reject unstarted order");
            }
        }
    }

    /// Cancels an order that has not reached a terminal status.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_order(&self, order_id: OrderId) -> Result<Order> {
        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or_else(|| SagaError::InvalidOperation(format!("Order {order_id} not found")))?;

        if !order.status.is_cancellable() {
            return Err(SagaError::InvalidOperation(format!(
                "Order cannot be cancelled in status {}",
                order.status
            )));
        }

        let data = OrderCancelledData {
            order_id,
            previous_status: order.status,
        };
        let record = OrderEventRecord::new(
            order_id,
            order.correlation_id,
            OrderEventType::OrderCancelled,
            serde_json::to_value(&data)?,
        );
        let cancelled = self
            .store
            .transition_status(order_id, &CANCELLABLE, OrderStatus::Cancelled, vec![record])
            .await?
            .ok_or_else(|| {
                SagaError::InvalidOperation(format!(
                    "Order {order_id} changed status while cancelling"
                ))
            })?;

        let event = SagaEvent::OrderCancelled(data);
        self.publisher
            .publish(
                ORDER_EVENTS_EXCHANGE,
                routing::ORDER_CANCELLED,
                event.to_message(cancelled.correlation_id)?,
            )
            .await?;
        self.emit_analytics(&event, cancelled.correlation_id).await;

        metrics::counter!("orders_cancelled_total").increment(1);
        self.transitioned(&cancelled);
        Ok(cancelled)
    }

    pub async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>> {
        Ok(self.store.get_order(order_id).await?)
    }

    pub async fn get_order_by_correlation(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Option<Order>> {
        Ok(self.store.find_by_correlation(correlation_id).await?)
    }

    /// The order with its events ordered by creation time.
    pub async fn timeline(&self, order_id: OrderId) -> Result<Option<OrderTimeline>> {
        let Some(order) = self.store.get_order(order_id).await? else {
            return Ok(None);
        };
        let events = self.store.events_for_order(order_id).await?;
        Ok(Some(OrderTimeline { order, events }))
    }

    /// Every order and event recorded under one correlation id.
    pub async fn timeline_by_correlation(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Option<OrderTimeline>> {
        let Some(order) = self.store.find_by_correlation(correlation_id).await? else {
            return Ok(None);
        };
        let events = self.store.events_for_correlation(correlation_id).await?;
        Ok(Some(OrderTimeline { order, events }))
    }

    /// `PENDING -> VALIDATING`, then asks inventory to reserve the lines.
    #[tracing::instrument(skip(self, data), fields(order_id = %data.order_id))]
    pub async fn begin_validation(
        &self,
        data: OrderCreatedData,
        correlation_id: CorrelationId,
    ) -> Result<()> {
        let record = OrderEventRecord::new(
            data.order_id,
            correlation_id,
            OrderEventType::OrderValidating,
            json!({ "item_count": data.items.len() }),
        );
        let Some(order) = self
            .store
            .transition_status(
                data.order_id,
                &[OrderStatus::Pending],
                OrderStatus::Validating,
                vec![record],
            )
            .await?
        else {
            return self.skipped(data.order_id, "OrderCreated").await;
        };
        self.transitioned(&order);

        let request = SagaEvent::ReserveInventory(ReserveInventoryData {
            order_id: order.id,
            items: order
                .items
                .iter()
                .map(|line| StockRequest {
                    product_id: line.product_id,
                    quantity: line.quantity,
                })
                .collect(),
        });
        self.publisher
            .publish(
                ORDER_EVENTS_EXCHANGE,
                routing::INVENTORY_RESERVE,
                request.to_message(correlation_id)?,
            )
            .await?;
        Ok(())
    }

    /// Applies an event from the `order.saga` queue.
    pub async fn apply_saga_event(
        &self,
        event: SagaEvent,
        correlation_id: CorrelationId,
    ) -> Result<()> {
        match event {
            SagaEvent::InventoryReserved(data) => {
                self.on_inventory_reserved(data, correlation_id).await
            }
            SagaEvent::InventoryFailed(data) => {
                self.on_inventory_failed(data, correlation_id).await
            }
            SagaEvent::PaymentCompleted(data) => {
                self.on_payment_completed(data, correlation_id).await
            }
            SagaEvent::PaymentFailed(data) => self.on_payment_failed(data, correlation_id).await,
            event @ (SagaEvent::OrderCreated(_)
            | SagaEvent::ReserveInventory(_)
            | SagaEvent::ProcessPayment(_)
            | SagaEvent::OrderConfirmed(_)
            | SagaEvent::OrderRejected(_)
            | SagaEvent::OrderCancelled(_)) => {
                debug!(event_type = event.event_type(), "event not handled by the saga consumer");
                Ok(())
            }
        }
    }

    #[tracing::instrument(skip(self, data), fields(order_id = %data.order_id))]
    async fn on_inventory_reserved(
        &self,
        data: InventoryReservedData,
        correlation_id: CorrelationId,
    ) -> Result<()> {
        let order_id = data.order_id;
        let record = OrderEventRecord::new(
            order_id,
            correlation_id,
            OrderEventType::InventoryReserved,
            serde_json::to_value(&data)?,
        );
        let Some(order) = self
            .store
            .transition_status(
                order_id,
                &[OrderStatus::Validating],
                OrderStatus::Reserved,
                vec![record],
            )
            .await?
        else {
            return self.reserved_after_exit(order_id, correlation_id).await;
        };
        self.transitioned(&order);

        let request = SagaEvent::ProcessPayment(ProcessPaymentData {
            order_id,
            amount: order.total_amount,
        });
        self.publisher
            .send_to_queue(PAYMENT_PROCESS_QUEUE, request.to_message(correlation_id)?)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, data), fields(order_id = %data.order_id))]
    async fn on_inventory_failed(
        &self,
        data: RejectionData,
        correlation_id: CorrelationId,
    ) -> Result<()> {
        let record = OrderEventRecord::new(
            data.order_id,
            correlation_id,
            OrderEventType::OrderRejected,
            json!({ "reason": data.reason, "rejected_at": Utc::now() }),
        );
        let Some(order) = self
            .store
            .transition_status(
                data.order_id,
                &[OrderStatus::Validating],
                OrderStatus::Rejected,
                vec![record],
            )
            .await?
        else {
            return self.skipped(data.order_id, "InventoryFailed").await;
        };
        warn!(reason = %data.reason, "order rejected by inventory");
        self.transitioned(&order);

        let rejected = SagaEvent::OrderRejected(data);
        self.publisher
            .publish(NOTIFICATION_EXCHANGE, "", rejected.to_message(correlation_id)?)
            .await?;
        self.emit_analytics(&rejected, correlation_id).await;
        Ok(())
    }

    #[tracing::instrument(skip(self, data), fields(order_id = %data.order_id))]
    async fn on_payment_completed(
        &self,
        data: PaymentCompletedData,
        correlation_id: CorrelationId,
    ) -> Result<()> {
        let order_id = data.order_id;
        let records = vec![
            OrderEventRecord::new(
                order_id,
                correlation_id,
                OrderEventType::PaymentCompleted,
                serde_json::to_value(&data)?,
            ),
            OrderEventRecord::new(
                order_id,
                correlation_id,
                OrderEventType::OrderConfirmed,
                json!({ "confirmed_at": Utc::now() }),
            ),
        ];
        match self
            .store
            .transition_status(
                order_id,
                &[OrderStatus::Reserved],
                OrderStatus::Confirmed,
                records,
            )
            .await?
        {
            Some(order) => {
                self.transitioned(&order);
                Ok(())
            }
            None => self.skipped(order_id, "PaymentCompleted").await,
        }
    }

    #[tracing::instrument(skip(self, data), fields(order_id = %data.order_id))]
    async fn on_payment_failed(
        &self,
        data: PaymentFailedData,
        correlation_id: CorrelationId,
    ) -> Result<()> {
        let order_id = data.order_id;
        let records = vec![
            OrderEventRecord::new(
                order_id,
                correlation_id,
                OrderEventType::PaymentFailed,
                serde_json::to_value(&data)?,
            ),
            OrderEventRecord::new(
                order_id,
                correlation_id,
                OrderEventType::OrderRejected,
                json!({ "reason": data.reason, "rejected_at": Utc::now() }),
            ),
        ];
        match self
            .store
            .transition_status(order_id, &[OrderStatus::Reserved], OrderStatus::Rejected, records)
            .await?
        {
            Some(order) => {
                warn!(reason = %data.reason, "order rejected by payment");
                self.transitioned(&order);
                Ok(())
            }
            None => self.skipped(order_id, "PaymentFailed").await,
        }
    }

    /// Stock was reserved for an order that already left `VALIDATING`.
    ///
    /// A cancelled order may have been released before the reservation
    /// committed, so the cancellation is sent to inventory again.
    async fn reserved_after_exit(
        &self,
        order_id: OrderId,
        correlation_id: CorrelationId,
    ) -> Result<()> {
        let Some(order) = self.store.get_order(order_id).await? else {
            return self.skipped(order_id, "InventoryReserved").await;
        };
        if order.status != OrderStatus::Cancelled {
            return self.skipped(order_id, "InventoryReserved").await;
        }

        info!(%order_id, "reservation arrived for cancelled order, requesting release");
        let event = SagaEvent::OrderCancelled(OrderCancelledData {
            order_id,
            previous_status: OrderStatus::Validating,
        });
        self.publisher
            .publish(
                ORDER_EVENTS_EXCHANGE,
                routing::ORDER_CANCELLED,
                event.to_message(correlation_id)?,
            )
            .await?;
        Ok(())
    }

    /// Logs an event whose precondition no longer holds.
    async fn skipped(&self, order_id: OrderId, event_type: &str) -> Result<()> {
        let status = self.store.get_order(order_id).await?.map(|o| o.status);
        info!(
            %order_id,
            event_type,
            status = ?status,
            "transition precondition not met, event ignored"
        );
        Ok(())
    }

    fn transitioned(&self, order: &Order) {
        metrics::counter!("saga_transitions_total", "to" => order.status.as_str()).increment(1);
        info!(
            order_id = %order.id,
            correlation_id = %order.correlation_id,
            status = %order.status,
            "order status changed"
        );
    }

    async fn emit_analytics(&self, event: &SagaEvent, correlation_id: CorrelationId) {
        match event.analytics_payload(correlation_id, Utc::now()) {
            Ok(payload) => {
                self.analytics
                    .fire_and_forget(ANALYTICS_TOPIC, &event.order_id().to_string(), &payload)
                    .await
            }
            Err(err) => warn!(error = %err, "analytics payload not serializable"),
        }
    }
}

/// Consumer of the `order.process` work queue.
pub struct ValidationHandler<S>(pub Arc<OrderSagaCoordinator<S>>);

#[async_trait]
impl<S: SagaStore + 'static> MessageHandler for ValidationHandler<S> {
    async fn handle(&self, message: &Message) -> std::result::Result<(), HandlerError> {
        let Some(event) = decode_event(message, ORDER_PROCESS_QUEUE)? else {
            return Ok(());
        };
        match event {
            SagaEvent::OrderCreated(data) => {
                self.0.begin_validation(data, message.correlation_id).await?;
            }
            other => {
                debug!(
                    event_type = other.event_type(),
                    "event not handled by the validation consumer"
                );
            }
        }
        Ok(())
    }
}

/// Consumer of the `order.saga` queue.
pub struct SagaEventHandler<S>(pub Arc<OrderSagaCoordinator<S>>);

#[async_trait]
impl<S: SagaStore + 'static> MessageHandler for SagaEventHandler<S> {
    async fn handle(&self, message: &Message) -> std::result::Result<(), HandlerError> {
        if let Some(event) = decode_event(message, crate::topology::ORDER_SAGA_QUEUE)? {
            self.0.apply_saga_event(event, message.correlation_id).await?;
        }
        Ok(())
    }
}

//! Inventory reservation participant.

use std::sync::Arc;

use async_trait::async_trait;
use common::{CorrelationId, Money, OrderId};
use domain::{ReservationOutcome, ReservationRejection};
use idempotency::{IdempotencyCheck, IdempotencyGuard};
use messaging::{DurablePublisher, HandlerError, Message, MessageHandler};
use store::SagaStore;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::{InventoryReservedData, RejectionData, ReserveInventoryData, SagaEvent};
use crate::handler::decode_event;
use crate::topology::{INVENTORY_RESERVE_QUEUE, ORDER_EVENTS_EXCHANGE};

/// Reserves stock all-or-nothing and releases it again on cancellation or
/// payment failure.
pub struct InventoryReservationCoordinator<S> {
    store: S,
    publisher: DurablePublisher,
    guard: IdempotencyGuard,
}

impl<S: SagaStore> InventoryReservationCoordinator<S> {
    pub fn new(store: S, publisher: DurablePublisher, guard: IdempotencyGuard) -> Self {
        Self {
            store,
            publisher,
            guard,
        }
    }

    /// Reserves every line of the request or none, then reports the outcome.
    #[tracing::instrument(skip(self, request), fields(order_id = %request.order_id))]
    pub async fn reserve(
        &self,
        request: ReserveInventoryData,
        correlation_id: CorrelationId,
    ) -> Result<ReservationOutcome> {
        let order_id = request.order_id;

        let outcome = if self.was_cancelled(order_id).await {
            ReservationOutcome::Rejected(ReservationRejection::OrderCancelled)
        } else {
            let outcome = self.store.reserve_all(order_id, &request.items).await?;
            self.recheck_cancellation(order_id, outcome).await?
        };

        let event = match &outcome {
            ReservationOutcome::Reserved(lines) => {
                let total_amount: Money = lines.iter().map(|line| line.line_total).sum();
                metrics::counter!("inventory_reservations_total", "outcome" => "reserved")
                    .increment(1);
                info!(lines = lines.len(), total = %total_amount, "inventory reserved");
                SagaEvent::InventoryReserved(InventoryReservedData {
                    order_id,
                    items: lines.clone(),
                    total_amount,
                })
            }
            ReservationOutcome::Rejected(rejection) => {
                metrics::counter!("inventory_reservations_total", "outcome" => "rejected")
                    .increment(1);
                warn!(?rejection, "inventory reservation rejected");
                SagaEvent::InventoryFailed(RejectionData {
                    order_id,
                    reason: rejection.reason().to_string(),
                })
            }
        };

        self.publisher
            .publish(
                ORDER_EVENTS_EXCHANGE,
                event.routing_key(),
                event.to_message(correlation_id)?,
            )
            .await?;
        Ok(outcome)
    }

    /// Gives back every `RESERVED` line of the order. Safe to repeat.
    #[tracing::instrument(skip(self))]
    pub async fn release_for_order(&self, order_id: OrderId) -> Result<usize> {
        let released = self.store.release_reservations(order_id).await?;
        if released > 0 {
            info!(released, "reservations released");
        } else {
            debug!("no live reservations to release");
        }
        Ok(released)
    }

    /// Stops future reservations for the order and releases what it holds.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, order_id: OrderId) -> Result<usize> {
        self.guard
            .mark_processed(&cancellation_key(order_id), &true, None)
            .await;
        self.release_for_order(order_id).await
    }

    /// Undoes a reservation that raced a cancellation.
    ///
    /// `cancel` marks the order before releasing, so either it sees the rows
    /// committed here or this check sees its mark.
    async fn recheck_cancellation(
        &self,
        order_id: OrderId,
        outcome: ReservationOutcome,
    ) -> Result<ReservationOutcome> {
        if !matches!(outcome, ReservationOutcome::Reserved(_)) {
            return Ok(outcome);
        }
        if !self.was_cancelled(order_id).await {
            return Ok(outcome);
        }
        let released = self.release_for_order(order_id).await?;
        warn!(released, "order cancelled during reservation, stock returned");
        Ok(ReservationOutcome::Rejected(ReservationRejection::OrderCancelled))
    }

    async fn was_cancelled(&self, order_id: OrderId) -> bool {
        matches!(
            self.guard.lookup::<bool>(&cancellation_key(order_id)).await,
            IdempotencyCheck::Previous(true)
        )
    }
}

fn cancellation_key(order_id: OrderId) -> String {
    format!("inventory:cancelled:{order_id}")
}

/// Consumer of the `inventory.reserve` queue.
pub struct InventoryHandler<S>(pub Arc<InventoryReservationCoordinator<S>>);

#[async_trait]
impl<S: SagaStore + 'static> MessageHandler for InventoryHandler<S> {
    async fn handle(&self, message: &Message) -> std::result::Result<(), HandlerError> {
        let Some(event) = decode_event(message, INVENTORY_RESERVE_QUEUE)? else {
            return Ok(());
        };
        match event {
            SagaEvent::ReserveInventory(request) => {
                self.0.reserve(request, message.correlation_id).await?;
            }
            SagaEvent::OrderCancelled(data) => {
                self.0.cancel(data.order_id).await?;
            }
            other @ (SagaEvent::OrderCreated(_)
            | SagaEvent::InventoryReserved(_)
            | SagaEvent::InventoryFailed(_)
            | SagaEvent::ProcessPayment(_)
            | SagaEvent::PaymentCompleted(_)
            | SagaEvent::PaymentFailed(_)
            | SagaEvent::OrderConfirmed(_)
            | SagaEvent::OrderRejected(_)) => {
                debug!(event_type = other.event_type(), "event not handled by inventory");
            }
        }
        Ok(())
    }
}

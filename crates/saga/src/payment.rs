//! Payment participant and the gateway it charges.
//!
//! The processor is the compensating transaction boundary: a declined
//! payment is the only place stock held for an order is released because
//! of a downstream failure.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use common::{CorrelationId, Money, OrderId};
use domain::{OrderStatus, Transaction, TransactionStatus};
use messaging::{BestEffortSink, DurablePublisher, HandlerError, Message, MessageHandler};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::json;
use store::SagaStore;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::{
    OrderConfirmedData, PaymentCompletedData, PaymentFailedData, ProcessPaymentData,
    RejectionData, SagaEvent,
};
use crate::handler::decode_event;
use crate::topology::{
    ANALYTICS_TOPIC, NOTIFICATION_EXCHANGE, ORDER_EVENTS_EXCHANGE, PAYMENT_PROCESS_QUEUE,
};

/// Reason recorded when the gateway declines without one.
pub const PAYMENT_DECLINED: &str = "Payment declined";

/// What the gateway said about a charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayOutcome {
    Approved { reference: String },
    Declined { reason: String, reference: String },
}

impl GatewayOutcome {
    pub fn reference(&self) -> &str {
        match self {
            GatewayOutcome::Approved { reference } | GatewayOutcome::Declined { reference, .. } => {
                reference
            }
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, GatewayOutcome::Approved { .. })
    }
}

/// A payment gateway.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, order_id: OrderId, amount: Money) -> GatewayOutcome;
}

/// Gateway reference in the form `PAY-<epoch millis>-<9 lowercase chars>`.
pub fn gateway_reference() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("PAY-{}-{}", Utc::now().timestamp_millis(), suffix)
}

/// Stand-in gateway that approves with a fixed probability.
#[derive(Debug, Clone)]
pub struct RandomGateway {
    success_rate: f64,
}

impl RandomGateway {
    pub fn new(success_rate: f64) -> Self {
        Self {
            success_rate: success_rate.clamp(0.0, 1.0),
        }
    }
}

impl Default for RandomGateway {
    fn default() -> Self {
        Self::new(0.5)
    }
}

#[async_trait]
impl PaymentGateway for RandomGateway {
    async fn charge(&self, _order_id: OrderId, _amount: Money) -> GatewayOutcome {
        let approved = rand::thread_rng().gen_bool(self.success_rate);
        let reference = gateway_reference();
        if approved {
            GatewayOutcome::Approved { reference }
        } else {
            GatewayOutcome::Declined {
                reason: PAYMENT_DECLINED.to_string(),
                reference,
            }
        }
    }
}

/// Gateway that replays queued decisions, approving once the queue is empty.
#[derive(Debug, Clone, Default)]
pub struct ScriptedGateway {
    script: Arc<Mutex<VecDeque<bool>>>,
    charges: Arc<Mutex<Vec<(OrderId, Money)>>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn approve_next(&self) {
        self.push(true);
    }

    pub fn decline_next(&self) {
        self.push(false);
    }

    /// Every charge attempted so far.
    pub fn charges(&self) -> Vec<(OrderId, Money)> {
        self.charges
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn push(&self, approve: bool) {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(approve);
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn charge(&self, order_id: OrderId, amount: Money) -> GatewayOutcome {
        self.charges
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((order_id, amount));
        let approve = self
            .script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .unwrap_or(true);

        let reference = gateway_reference();
        if approve {
            GatewayOutcome::Approved { reference }
        } else {
            GatewayOutcome::Declined {
                reason: PAYMENT_DECLINED.to_string(),
                reference,
            }
        }
    }
}

/// Settles or declines payment for reserved orders.
pub struct PaymentProcessor<S> {
    store: S,
    gateway: Arc<dyn PaymentGateway>,
    publisher: DurablePublisher,
    analytics: BestEffortSink,
}

impl<S: SagaStore> PaymentProcessor<S> {
    pub fn new(
        store: S,
        gateway: Arc<dyn PaymentGateway>,
        publisher: DurablePublisher,
        analytics: BestEffortSink,
    ) -> Self {
        Self {
            store,
            gateway,
            publisher,
            analytics,
        }
    }

    /// Charges the order and records the attempt.
    ///
    /// An order is charged at most once. When an attempt is already on
    /// record (a redelivered request whose first run failed after the
    /// charge), its outcome is replayed instead of charging again.
    ///
    /// Returns `None` when the order is no longer awaiting payment (for
    /// example it was cancelled after the request was sent).
    #[tracing::instrument(
        skip(self, request),
        fields(order_id = %request.order_id, amount = %request.amount)
    )]
    pub async fn process(
        &self,
        request: ProcessPaymentData,
        correlation_id: CorrelationId,
    ) -> Result<Option<Transaction>> {
        let order_id = request.order_id;
        let previous = self.store.transactions_for_order(order_id).await?;
        if let Some(transaction) = previous.into_iter().next() {
            info!(
                transaction_id = %transaction.id,
                status = transaction.status.as_str(),
                "payment already attempted, replaying outcome"
            );
            self.replay(&transaction, correlation_id).await?;
            return Ok(Some(transaction));
        }

        let status = self.store.get_order(order_id).await?.map(|o| o.status);
        if status != Some(OrderStatus::Reserved) {
            info!(status = ?status, "order not awaiting payment, request ignored");
            return Ok(None);
        }

        let outcome = self.gateway.charge(order_id, request.amount).await;
        let (tx_status, response) = match &outcome {
            GatewayOutcome::Approved { reference } => (
                TransactionStatus::Completed,
                json!({ "success": true, "reference": reference }),
            ),
            GatewayOutcome::Declined { reason, reference } => (
                TransactionStatus::Failed,
                json!({ "success": false, "reference": reference, "reason": reason }),
            ),
        };
        let transaction = Transaction::new(
            order_id,
            correlation_id,
            request.amount,
            tx_status,
            outcome.reference().to_string(),
            response,
        );
        self.store.record_transaction(&transaction).await?;

        match outcome {
            GatewayOutcome::Approved { reference } => {
                metrics::counter!("payments_total", "outcome" => "completed").increment(1);
                self.settle(&transaction, reference, correlation_id).await?
            }
            GatewayOutcome::Declined { reason, reference } => {
                metrics::counter!("payments_total", "outcome" => "failed").increment(1);
                self.compensate(&transaction, reason, reference, correlation_id)
                    .await?
            }
        }
        Ok(Some(transaction))
    }

    /// Re-runs the follow-up of a recorded attempt without touching the gateway.
    async fn replay(&self, transaction: &Transaction, correlation_id: CorrelationId) -> Result<()> {
        let reference = transaction.gateway_reference.clone();
        match transaction.status {
            TransactionStatus::Completed => {
                self.settle(transaction, reference, correlation_id).await
            }
            TransactionStatus::Failed => {
                let reason = transaction.gateway_response["reason"]
                    .as_str()
                    .unwrap_or(PAYMENT_DECLINED)
                    .to_string();
                self.compensate(transaction, reason, reference, correlation_id)
                    .await
            }
        }
    }

    async fn settle(
        &self,
        transaction: &Transaction,
        reference: String,
        correlation_id: CorrelationId,
    ) -> Result<()> {
        let order_id = transaction.order_id;
        let confirmed = self.store.confirm_reservations(order_id).await?;
        info!(confirmed, reference = %reference, "payment completed");

        let completed = SagaEvent::PaymentCompleted(PaymentCompletedData {
            order_id,
            transaction_id: transaction.id,
            amount: transaction.amount,
            reference,
        });
        self.publisher
            .publish(
                ORDER_EVENTS_EXCHANGE,
                completed.routing_key(),
                completed.to_message(correlation_id)?,
            )
            .await?;

        let notification = SagaEvent::OrderConfirmed(OrderConfirmedData {
            order_id,
            total_amount: transaction.amount,
            transaction_id: transaction.id,
        });
        self.broadcast(&notification, correlation_id).await
    }

    async fn compensate(
        &self,
        transaction: &Transaction,
        reason: String,
        reference: String,
        correlation_id: CorrelationId,
    ) -> Result<()> {
        let order_id = transaction.order_id;
        let released = self.store.release_reservations(order_id).await?;
        warn!(released, reason = %reason, "payment failed, reservations released");

        let failed = SagaEvent::PaymentFailed(PaymentFailedData {
            order_id,
            transaction_id: transaction.id,
            reason: reason.clone(),
            reference,
        });
        self.publisher
            .publish(
                ORDER_EVENTS_EXCHANGE,
                failed.routing_key(),
                failed.to_message(correlation_id)?,
            )
            .await?;

        let notification = SagaEvent::OrderRejected(RejectionData { order_id, reason });
        self.broadcast(&notification, correlation_id).await
    }

    /// Sends a terminal event to the notification fanout and the analytics stream.
    async fn broadcast(&self, event: &SagaEvent, correlation_id: CorrelationId) -> Result<()> {
        self.publisher
            .publish(NOTIFICATION_EXCHANGE, "", event.to_message(correlation_id)?)
            .await?;
        let payload = event.analytics_payload(correlation_id, Utc::now())?;
        self.analytics
            .fire_and_forget(ANALYTICS_TOPIC, &event.order_id().to_string(), &payload)
            .await;
        Ok(())
    }
}

/// Consumer of the `payment.process` work queue.
pub struct PaymentHandler<S>(pub Arc<PaymentProcessor<S>>);

#[async_trait]
impl<S: SagaStore + 'static> MessageHandler for PaymentHandler<S> {
    async fn handle(&self, message: &Message) -> std::result::Result<(), HandlerError> {
        let Some(event) = decode_event(message, PAYMENT_PROCESS_QUEUE)? else {
            return Ok(());
        };
        match event {
            SagaEvent::ProcessPayment(request) => {
                self.0.process(request, message.correlation_id).await?;
            }
            other => {
                debug!(event_type = other.event_type(), "event not handled by payment");
            }
        }
        Ok(())
    }
}

//! Notification consumers fed by the `notification.fanout` exchange.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::{CorrelationId, OrderId};
use messaging::{HandlerError, Message, MessageHandler};
use serde::Serialize;
use tracing::{debug, info};

use crate::events::SagaEvent;
use crate::handler::decode_event;

/// A message for a customer or for operations staff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub channel: String,
    pub event_type: String,
    pub order_id: OrderId,
    pub correlation_id: CorrelationId,
    pub text: String,
}

/// Delivers notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), HandlerError>;
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), HandlerError> {
        info!(
            channel = %notification.channel,
            event_type = %notification.event_type,
            order_id = %notification.order_id,
            correlation_id = %notification.correlation_id,
            "{}",
            notification.text
        );
        Ok(())
    }
}

/// Records notifications for inspection.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
    failing: Arc<Mutex<bool>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Makes every delivery fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        *self
            .failing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = failing;
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), HandlerError> {
        if *self
            .failing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
        {
            return Err(HandlerError::new("notification channel unavailable"));
        }
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(notification);
        Ok(())
    }
}

/// Consumer of one notification queue.
pub struct NotificationHandler {
    channel: String,
    notifier: Arc<dyn Notifier>,
}

impl NotificationHandler {
    pub fn new(channel: impl Into<String>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            channel: channel.into(),
            notifier,
        }
    }

    fn text(event: &SagaEvent) -> Option<String> {
        match event {
            SagaEvent::OrderConfirmed(data) => Some(format!(
                "Order {} confirmed, {} charged",
                data.order_id, data.total_amount
            )),
            SagaEvent::OrderRejected(data) => Some(format!(
                "Order {} rejected: {}",
                data.order_id, data.reason
            )),
            SagaEvent::OrderCreated(_)
            | SagaEvent::ReserveInventory(_)
            | SagaEvent::InventoryReserved(_)
            | SagaEvent::InventoryFailed(_)
            | SagaEvent::ProcessPayment(_)
            | SagaEvent::PaymentCompleted(_)
            | SagaEvent::PaymentFailed(_)
            | SagaEvent::OrderCancelled(_) => None,
        }
    }
}

#[async_trait]
impl MessageHandler for NotificationHandler {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        let Some(event) = decode_event(message, &self.channel)? else {
            return Ok(());
        };
        let Some(text) = Self::text(&event) else {
            debug!(
                channel = %self.channel,
                event_type = event.event_type(),
                "no notification for event"
            );
            return Ok(());
        };

        self.notifier
            .notify(Notification {
                channel: self.channel.clone(),
                event_type: event.event_type().to_string(),
                order_id: event.order_id(),
                correlation_id: message.correlation_id,
                text,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use common::Money;
    use uuid::Uuid;

    use super::*;
    use crate::events::{OrderConfirmedData, RejectionData};

    fn confirmed() -> SagaEvent {
        SagaEvent::OrderConfirmed(OrderConfirmedData {
            order_id: OrderId::new(),
            total_amount: Money::from_cents(2000),
            transaction_id: Uuid::new_v4(),
        })
    }

    #[tokio::test]
    async fn test_confirmation_is_delivered() {
        let notifier = InMemoryNotifier::new();
        let handler = NotificationHandler::new("customer", Arc::new(notifier.clone()));
        let event = confirmed();
        let message = event.to_message(CorrelationId::new()).unwrap();

        handler.handle(&message).await.unwrap();

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel, "customer");
        assert_eq!(sent[0].event_type, "OrderConfirmed");
        assert_eq!(sent[0].order_id, event.order_id());
        assert!(sent[0].text.contains("$20.00"));
    }

    #[tokio::test]
    async fn test_rejection_carries_reason() {
        let notifier = InMemoryNotifier::new();
        let handler = NotificationHandler::new("operations", Arc::new(notifier.clone()));
        let message = SagaEvent::OrderRejected(RejectionData {
            order_id: OrderId::new(),
            reason: "Payment declined".to_string(),
        })
        .to_message(CorrelationId::new())
        .unwrap();

        handler.handle(&message).await.unwrap();

        assert!(notifier.sent()[0].text.ends_with("Payment declined"));
    }

    #[tokio::test]
    async fn test_failing_channel_reports_error() {
        let notifier = InMemoryNotifier::new();
        notifier.set_failing(true);
        let handler = NotificationHandler::new("customer", Arc::new(notifier.clone()));
        let message = confirmed().to_message(CorrelationId::new()).unwrap();

        assert!(handler.handle(&message).await.is_err());
        assert!(notifier.sent().is_empty());
    }
}

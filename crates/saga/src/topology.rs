//! Exchanges, queues and bindings used by the saga.
//!
//! ```text
//! order.events (topic)
//!   inventory.reserve, order.cancelled          -> inventory.reserve
//!   inventory.reserved, order.rejected,
//!   payment.completed, payment.failed           -> order.saga
//! notification.fanout (fanout)                   -> notification.customer
//!                                                -> notification.operations
//! work queues fed directly: order.process, payment.process
//! ```
//!
//! Every queue gets a `<queue>.dlq` dead-letter queue.

use messaging::{Broker, ExchangeKind, QueueOptions, Result};
use tracing::info;

pub const ORDER_EVENTS_EXCHANGE: &str = "order.events";
pub const NOTIFICATION_EXCHANGE: &str = "notification.fanout";

pub const ORDER_PROCESS_QUEUE: &str = "order.process";
pub const ORDER_SAGA_QUEUE: &str = "order.saga";
pub const INVENTORY_RESERVE_QUEUE: &str = "inventory.reserve";
pub const PAYMENT_PROCESS_QUEUE: &str = "payment.process";
pub const CUSTOMER_NOTIFICATION_QUEUE: &str = "notification.customer";
pub const OPERATIONS_NOTIFICATION_QUEUE: &str = "notification.operations";

/// Every consumed queue, in declaration order.
pub const QUEUES: [&str; 6] = [
    ORDER_PROCESS_QUEUE,
    ORDER_SAGA_QUEUE,
    INVENTORY_RESERVE_QUEUE,
    PAYMENT_PROCESS_QUEUE,
    CUSTOMER_NOTIFICATION_QUEUE,
    OPERATIONS_NOTIFICATION_QUEUE,
];

/// Topic on the analytics stream.
pub const ANALYTICS_TOPIC: &str = "order-events";

/// Routing keys on the `order.events` exchange.
pub mod routing {
    pub const ORDER_CREATED: &str = "order.created";
    pub const ORDER_CANCELLED: &str = "order.cancelled";
    pub const ORDER_CONFIRMED: &str = "order.confirmed";
    pub const ORDER_REJECTED: &str = "order.rejected";
    pub const INVENTORY_RESERVE: &str = "inventory.reserve";
    pub const INVENTORY_RESERVED: &str = "inventory.reserved";
    pub const PAYMENT_PROCESS: &str = "payment.process";
    pub const PAYMENT_COMPLETED: &str = "payment.completed";
    pub const PAYMENT_FAILED: &str = "payment.failed";
}

const BINDINGS: &[(&str, &str, &str)] = &[
    (INVENTORY_RESERVE_QUEUE, ORDER_EVENTS_EXCHANGE, routing::INVENTORY_RESERVE),
    (INVENTORY_RESERVE_QUEUE, ORDER_EVENTS_EXCHANGE, routing::ORDER_CANCELLED),
    (ORDER_SAGA_QUEUE, ORDER_EVENTS_EXCHANGE, routing::INVENTORY_RESERVED),
    (ORDER_SAGA_QUEUE, ORDER_EVENTS_EXCHANGE, routing::ORDER_REJECTED),
    (ORDER_SAGA_QUEUE, ORDER_EVENTS_EXCHANGE, routing::PAYMENT_COMPLETED),
    (ORDER_SAGA_QUEUE, ORDER_EVENTS_EXCHANGE, routing::PAYMENT_FAILED),
    (CUSTOMER_NOTIFICATION_QUEUE, NOTIFICATION_EXCHANGE, ""),
    (OPERATIONS_NOTIFICATION_QUEUE, NOTIFICATION_EXCHANGE, ""),
];

/// Declares the saga topology. Safe to call more than once.
pub async fn declare_topology(broker: &Broker) -> Result<()> {
    broker
        .declare_exchange(ORDER_EVENTS_EXCHANGE, ExchangeKind::Topic)
        .await?;
    broker
        .declare_exchange(NOTIFICATION_EXCHANGE, ExchangeKind::Fanout)
        .await?;

    for queue in QUEUES {
        broker
            .declare_queue(queue, QueueOptions::with_dead_letter_queue(queue))
            .await?;
    }

    for (queue, exchange, pattern) in BINDINGS {
        broker.bind_queue(queue, exchange, pattern).await?;
    }

    info!("saga topology declared");
    Ok(())
}

#[cfg(test)]
mod tests {
    use common::CorrelationId;
    use messaging::Message;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_cancellation_reaches_inventory_only() {
        let broker = Broker::new();
        declare_topology(&broker).await.unwrap();

        let delivered = broker
            .publish(
                ORDER_EVENTS_EXCHANGE,
                routing::ORDER_CANCELLED,
                Message::new(routing::ORDER_CANCELLED, CorrelationId::new(), json!({})),
            )
            .await
            .unwrap();

        assert_eq!(delivered, 1);
        assert_eq!(broker.queue_depth(INVENTORY_RESERVE_QUEUE).await.unwrap(), 1);
        assert_eq!(broker.queue_depth(ORDER_SAGA_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_notifications_fan_out_to_both_queues() {
        let broker = Broker::new();
        declare_topology(&broker).await.unwrap();

        let delivered = broker
            .publish(
                NOTIFICATION_EXCHANGE,
                "",
                Message::new("", CorrelationId::new(), json!({})),
            )
            .await
            .unwrap();

        assert_eq!(delivered, 2);
        assert_eq!(broker.queue_depth(CUSTOMER_NOTIFICATION_QUEUE).await.unwrap(), 1);
        assert_eq!(broker.queue_depth(OPERATIONS_NOTIFICATION_QUEUE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_declaring_twice_is_harmless() {
        let broker = Broker::new();
        declare_topology(&broker).await.unwrap();
        declare_topology(&broker).await.unwrap();
        assert!(broker.queue_depth("order.saga.dlq").await.is_ok());
    }
}

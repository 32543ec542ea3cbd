//! Durable publishing for the saga path.
//!
//! Saga events must not be lost while the broker is unreachable. Messages
//! that cannot be delivered are parked in a bounded in-memory outbox and a
//! background flusher replays them, in publish order, once the broker is back.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::{Broker, Message, MessagingError, Result};

/// Configuration for [`DurablePublisher`].
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Maximum parked messages before publishing fails.
    pub capacity: usize,
    /// Interval between flush attempts.
    pub reconnect_delay: Duration,
    /// How long the flusher keeps retrying parked messages after shutdown.
    pub drain_timeout: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            reconnect_delay: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
enum Destination {
    Exchange { name: String, routing_key: String },
    Queue(String),
}

#[derive(Debug, Clone)]
struct Parked {
    destination: Destination,
    message: Message,
}

/// Publisher whose messages survive a broker outage.
#[derive(Clone)]
pub struct DurablePublisher {
    broker: Broker,
    outbox: Arc<Mutex<VecDeque<Parked>>>,
    config: OutboxConfig,
}

impl DurablePublisher {
    pub fn new(broker: Broker, config: OutboxConfig) -> Self {
        Self {
            broker,
            outbox: Arc::new(Mutex::new(VecDeque::new())),
            config,
        }
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Publishes to an exchange, parking the message if the broker is down.
    pub async fn publish(&self, exchange: &str, routing_key: &str, message: Message) -> Result<()> {
        self.deliver(Parked {
            destination: Destination::Exchange {
                name: exchange.to_string(),
                routing_key: routing_key.to_string(),
            },
            message,
        })
        .await
    }

    /// Sends to a work queue, parking the message if the broker is down.
    pub async fn send_to_queue(&self, queue: &str, message: Message) -> Result<()> {
        self.deliver(Parked {
            destination: Destination::Queue(queue.to_string()),
            message,
        })
        .await
    }

    /// Messages waiting for the broker.
    pub async fn pending(&self) -> usize {
        self.outbox.lock().await.len()
    }

    async fn dispatch(&self, parked: &Parked) -> Result<()> {
        match &parked.destination {
            Destination::Exchange { name, routing_key } => self
                .broker
                .publish(name, routing_key, parked.message.clone())
                .await
                .map(|_| ()),
            Destination::Queue(queue) => {
                self.broker
                    .send_to_queue(queue, parked.message.clone())
                    .await
            }
        }
    }

    async fn deliver(&self, parked: Parked) -> Result<()> {
        let mut outbox = self.outbox.lock().await;

        // Anything already parked goes first, so new messages queue behind it.
        if outbox.is_empty() {
            match self.dispatch(&parked).await {
                Ok(()) => return Ok(()),
                Err(MessagingError::Unavailable) => {}
                Err(err) => return Err(err),
            }
        }

        if outbox.len() >= self.config.capacity {
            error!(
                capacity = self.config.capacity,
                message_id = %parked.message.message_id,
                "outbox full, publish failed"
            );
            return Err(MessagingError::OutboxFull {
                capacity: self.config.capacity,
            });
        }

        warn!(
            message_id = %parked.message.message_id,
            correlation_id = %parked.message.correlation_id,
            pending = outbox.len() + 1,
            "broker unavailable, message parked in outbox"
        );
        outbox.push_back(parked);
        metrics::gauge!("outbox_pending").set(outbox.len() as f64);
        Ok(())
    }

    /// Replays parked messages in order until the outbox is empty or the
    /// broker is still unavailable. Returns how many were delivered.
    pub async fn flush(&self) -> usize {
        let mut outbox = self.outbox.lock().await;
        let mut delivered = 0;

        while let Some(parked) = outbox.front() {
            match self.dispatch(parked).await {
                Ok(()) => {
                    outbox.pop_front();
                    delivered += 1;
                }
                Err(MessagingError::Unavailable) => break,
                Err(err) => {
                    error!(
                        error = %err,
                        message_id = %parked.message.message_id,
                        "parked message cannot be delivered, discarding"
                    );
                    outbox.pop_front();
                }
            }
        }

        if delivered > 0 {
            info!(delivered, remaining = outbox.len(), "outbox flushed");
        }
        metrics::gauge!("outbox_pending").set(outbox.len() as f64);
        delivered
    }

    /// Spawns the background flusher.
    ///
    /// On shutdown it keeps flushing until the outbox is empty or
    /// `drain_timeout` has passed, so signal it only after every publisher
    /// has stopped.
    pub fn spawn_flusher(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let publisher = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(publisher.config.reconnect_delay);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        publisher.flush().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            publisher.drain().await;
        })
    }

    async fn drain(&self) {
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        let mut flushed = self.flush().await;
        while self.pending().await > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(self.config.reconnect_delay).await;
            flushed += self.flush().await;
        }

        let pending = self.pending().await;
        if pending > 0 {
            warn!(pending, "shutting down with undelivered outbox messages");
        } else {
            info!(flushed, "outbox flusher stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use common::CorrelationId;
    use serde_json::json;

    use super::*;
    use crate::{ExchangeKind, QueueOptions};

    async fn broker() -> Broker {
        let broker = Broker::new();
        broker
            .declare_exchange("order.events", ExchangeKind::Topic)
            .await
            .unwrap();
        broker
            .declare_queue("audit", QueueOptions::default())
            .await
            .unwrap();
        broker.bind_queue("audit", "order.events", "#").await.unwrap();
        broker
    }

    fn message(n: u64) -> Message {
        Message::new("order.created", CorrelationId::new(), json!({ "n": n }))
    }

    #[tokio::test]
    async fn test_publishes_immediately_when_available() {
        let broker = broker().await;
        let publisher = DurablePublisher::new(broker.clone(), OutboxConfig::default());

        publisher
            .publish("order.events", "order.created", message(1))
            .await
            .unwrap();

        assert_eq!(publisher.pending().await, 0);
        assert_eq!(broker.queue_depth("audit").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_parks_during_outage_and_flushes_in_order() {
        let broker = broker().await;
        let publisher = DurablePublisher::new(broker.clone(), OutboxConfig::default());

        broker.set_available(false);
        for n in 0..3 {
            publisher
                .publish("order.events", "order.created", message(n))
                .await
                .unwrap();
        }
        assert_eq!(publisher.pending().await, 3);
        assert_eq!(publisher.flush().await, 0);

        broker.set_available(true);
        // Published after reconnect but before the flush: must queue behind.
        publisher
            .publish("order.events", "order.created", message(3))
            .await
            .unwrap();
        assert_eq!(publisher.flush().await, 4);

        for expected in 0..4u64 {
            let delivery = broker.receive("audit").await.unwrap();
            assert_eq!(delivery.message().payload["n"], expected);
            delivery.ack();
        }
    }

    #[tokio::test]
    async fn test_full_outbox_fails_loudly() {
        let broker = broker().await;
        let publisher = DurablePublisher::new(
            broker.clone(),
            OutboxConfig {
                capacity: 1,
                ..OutboxConfig::default()
            },
        );

        broker.set_available(false);
        publisher
            .publish("order.events", "order.created", message(1))
            .await
            .unwrap();
        let result = publisher
            .publish("order.events", "order.created", message(2))
            .await;
        assert!(matches!(result, Err(MessagingError::OutboxFull { capacity: 1 })));
    }

    #[tokio::test]
    async fn test_unknown_destination_is_an_error_not_parked() {
        let broker = broker().await;
        let publisher = DurablePublisher::new(broker, OutboxConfig::default());

        let result = publisher.send_to_queue("missing", message(1)).await;
        assert!(matches!(result, Err(MessagingError::QueueNotFound(_))));
        assert_eq!(publisher.pending().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flusher_delivers_after_reconnect() {
        let broker = broker().await;
        let publisher = DurablePublisher::new(broker.clone(), OutboxConfig::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let flusher = publisher.spawn_flusher(shutdown_rx);

        broker.set_available(false);
        publisher
            .publish("order.events", "order.created", message(1))
            .await
            .unwrap();

        broker.set_available(true);
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(publisher.pending().await, 0);
        assert_eq!(broker.queue_depth("audit").await.unwrap(), 1);

        shutdown_tx.send(true).unwrap();
        flusher.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_broker_within_drain_timeout() {
        let broker = broker().await;
        let publisher = DurablePublisher::new(broker.clone(), OutboxConfig::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let flusher = publisher.spawn_flusher(shutdown_rx);

        broker.set_available(false);
        publisher
            .publish("order.events", "order.created", message(1))
            .await
            .unwrap();
        shutdown_tx.send(true).unwrap();

        let reconnect = {
            let broker = broker.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                broker.set_available(true);
            })
        };
        flusher.await.unwrap();
        reconnect.await.unwrap();

        assert_eq!(publisher.pending().await, 0);
        assert_eq!(broker.queue_depth("audit").await.unwrap(), 1);
    }
}

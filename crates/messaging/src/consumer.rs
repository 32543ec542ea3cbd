//! Work-queue consumer loop with a prefetch bound and retry/dead-letter policy.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::{Broker, Delivery, Message, MessagingError};

/// Failure reported by a message handler.
///
/// The consumer turns it into a requeue or a dead-letter; it never
/// propagates further.
#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct HandlerError {
    reason: String,
}

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("malformed payload: {err}"))
    }
}

impl From<MessagingError> for HandlerError {
    fn from(err: MessagingError) -> Self {
        Self::new(err.to_string())
    }
}

/// Processes one message taken from a work queue.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        (**self).handle(message).await
    }
}

/// Configuration for a queue consumer.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub queue: String,

    /// Maximum unacknowledged messages in flight.
    pub prefetch: usize,

    /// Requeues allowed before a failing message is dead-lettered.
    pub max_retries: u32,

    /// Pause before receiving again after the broker became unavailable.
    pub reconnect_delay: Duration,

    /// When false, a failed message is dead-lettered on its first failure.
    pub retry_failures: bool,
}

impl ConsumerConfig {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            prefetch: 10,
            max_retries: 3,
            reconnect_delay: Duration::from_secs(5),
            retry_failures: true,
        }
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn without_retries(mut self) -> Self {
        self.retry_failures = false;
        self
    }
}

/// What happened to a message after its handler ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Requeued { retry_count: u32 },
    DeadLettered,
}

/// Settles a delivery from its handler's outcome.
///
/// `next = retry_count + 1`; the message is requeued while
/// `next <= max_retries`, otherwise it is dead-lettered.
pub fn settle(
    delivery: Delivery,
    outcome: Result<(), HandlerError>,
    config: &ConsumerConfig,
) -> Settlement {
    let err = match outcome {
        Ok(()) => {
            delivery.ack();
            return Settlement::Acked;
        }
        Err(err) => err,
    };

    let message = delivery.message();
    let next = message.headers.retry_count + 1;
    if config.retry_failures && next <= config.max_retries {
        warn!(
            queue = %config.queue,
            message_id = %message.message_id,
            correlation_id = %message.correlation_id,
            retry_count = next,
            max_retries = config.max_retries,
            error = %err,
            "message processing failed, requeueing"
        );
        delivery.requeue(next);
        Settlement::Requeued { retry_count: next }
    } else {
        delivery.dead_letter(err.reason());
        Settlement::DeadLettered
    }
}

/// A blocking receive loop over one queue.
pub struct Consumer<H> {
    broker: Broker,
    handler: Arc<H>,
    config: ConsumerConfig,
}

impl<H: MessageHandler> Consumer<H> {
    pub fn new(broker: Broker, handler: Arc<H>, config: ConsumerConfig) -> Self {
        Self {
            broker,
            handler,
            config,
        }
    }

    /// Runs until `shutdown` flips to true (or its sender is dropped), then
    /// waits for in-flight handlers to settle.
    #[tracing::instrument(skip(self, shutdown), fields(queue = %self.config.queue))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let permits = Arc::new(Semaphore::new(self.config.prefetch));
        let config = Arc::new(self.config);
        let mut in_flight = JoinSet::new();
        info!(prefetch = config.prefetch, "consumer started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            while in_flight.try_join_next().is_some() {}

            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                changed = shutdown.changed() => if changed.is_err() { break } else { continue },
            };

            let delivery = tokio::select! {
                delivery = self.broker.receive(&config.queue) => delivery,
                changed = shutdown.changed() => if changed.is_err() { break } else { continue },
            };

            match delivery {
                Ok(delivery) => {
                    let handler = self.handler.clone();
                    let config = config.clone();
                    in_flight.spawn(async move {
                        let outcome = AssertUnwindSafe(handler.handle(delivery.message()))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|_| Err(HandlerError::new("handler panicked")));
                        let settlement = settle(delivery, outcome, &config);
                        debug!(?settlement, "delivery settled");
                        drop(permit);
                    });
                }
                Err(MessagingError::Unavailable) => {
                    drop(permit);
                    warn!(
                        delay_ms = config.reconnect_delay.as_millis() as u64,
                        "broker unavailable, reconnecting"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(config.reconnect_delay) => {}
                        changed = shutdown.changed() => if changed.is_err() { break },
                    }
                }
                Err(err) => {
                    error!(error = %err, "consumer stopped");
                    break;
                }
            }
        }

        while in_flight.join_next().await.is_some() {}
        info!("consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use common::CorrelationId;
    use serde_json::json;

    use super::*;
    use crate::QueueOptions;

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl MessageHandler for Counting {
        async fn handle(&self, _message: &Message) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(HandlerError::new("boom"))
            } else {
                Ok(())
            }
        }
    }

    async fn work_queue() -> Broker {
        let broker = Broker::new();
        broker
            .declare_queue("work", QueueOptions::with_dead_letter_queue("work"))
            .await
            .unwrap();
        broker
    }

    fn message() -> Message {
        Message::new("work", CorrelationId::new(), json!({}))
    }

    #[tokio::test]
    async fn test_settle_requeues_until_limit() {
        let broker = work_queue().await;
        let config = ConsumerConfig::new("work");
        broker.send_to_queue("work", message()).await.unwrap();

        let mut settlements = Vec::new();
        for _ in 0..4 {
            let delivery = broker.receive("work").await.unwrap();
            settlements.push(settle(delivery, Err(HandlerError::new("boom")), &config));
        }

        assert_eq!(
            settlements,
            vec![
                Settlement::Requeued { retry_count: 1 },
                Settlement::Requeued { retry_count: 2 },
                Settlement::Requeued { retry_count: 3 },
                Settlement::DeadLettered,
            ]
        );
        assert_eq!(broker.queue_depth("work").await.unwrap(), 0);
        assert_eq!(broker.queue_depth("work.dlq").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_settle_without_retries_dead_letters_immediately() {
        let broker = work_queue().await;
        let config = ConsumerConfig::new("work").without_retries();
        broker.send_to_queue("work", message()).await.unwrap();

        let delivery = broker.receive("work").await.unwrap();
        let settlement = settle(delivery, Err(HandlerError::new("boom")), &config);
        assert_eq!(settlement, Settlement::DeadLettered);
    }

    #[tokio::test]
    async fn test_consumer_acks_and_stops_on_shutdown() {
        let broker = work_queue().await;
        let handler = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        for _ in 0..3 {
            broker.send_to_queue("work", message()).await.unwrap();
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let consumer = Consumer::new(broker.clone(), handler.clone(), ConsumerConfig::new("work"));
        let task = tokio::spawn(consumer.run(shutdown_rx));

        while handler.calls.load(Ordering::SeqCst) < 3 {
            tokio::task::yield_now().await;
        }
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(broker.queue_depth("work").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_consumer_dead_letters_after_max_retries() {
        let broker = work_queue().await;
        let handler = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        broker.send_to_queue("work", message()).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let consumer = Consumer::new(broker.clone(), handler.clone(), ConsumerConfig::new("work"));
        let task = tokio::spawn(consumer.run(shutdown_rx));

        while broker.queue_depth("work.dlq").await.unwrap() == 0 {
            tokio::task::yield_now().await;
        }
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        // The first delivery plus three retries.
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
        let dead = broker.receive("work.dlq").await.unwrap();
        assert_eq!(dead.message().retry_count(), 3);
        dead.ack();
    }

    #[tokio::test]
    async fn test_handler_panic_counts_as_failure() {
        struct Panicking;

        #[async_trait]
        impl MessageHandler for Panicking {
            async fn handle(&self, _message: &Message) -> Result<(), HandlerError> {
                panic!("handler bug");
            }
        }

        let broker = work_queue().await;
        broker.send_to_queue("work", message()).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let consumer = Consumer::new(
            broker.clone(),
            Arc::new(Panicking),
            ConsumerConfig::new("work").without_retries(),
        );
        let task = tokio::spawn(consumer.run(shutdown_rx));

        while broker.queue_depth("work.dlq").await.unwrap() == 0 {
            tokio::task::yield_now().await;
        }
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}

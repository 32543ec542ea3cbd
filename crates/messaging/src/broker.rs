//! In-process broker: exchanges, bindings, queues and deliveries.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Notify, RwLock};
use tracing::{debug, error, info, warn};

use crate::{ExchangeKind, Message, MessagingError, Result};

/// Suffix of the dead-letter queue declared alongside a work queue.
pub const DEAD_LETTER_SUFFIX: &str = ".dlq";

/// Queue declaration options.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    /// Queue that receives messages which exhausted their retries.
    pub dead_letter: Option<String>,
}

impl QueueOptions {
    /// Dead-letters to `<queue>.dlq`.
    pub fn with_dead_letter_queue(queue: &str) -> Self {
        Self {
            dead_letter: Some(format!("{queue}{DEAD_LETTER_SUFFIX}")),
        }
    }
}

struct Binding {
    queue: String,
    pattern: String,
}

struct Exchange {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

struct Queue {
    name: String,
    messages: Mutex<VecDeque<Message>>,
    ready: Notify,
    dead_letter: Option<Arc<Queue>>,
}

impl Queue {
    fn new(name: &str, dead_letter: Option<Arc<Queue>>) -> Self {
        Self {
            name: name.to_string(),
            messages: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            dead_letter,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Message>> {
        // A panic while holding this lock cannot leave the deque half-updated.
        self.messages.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push_back(&self, message: Message) {
        self.lock().push_back(message);
        self.ready.notify_one();
    }

    fn push_front(&self, message: Message) {
        self.lock().push_front(message);
        self.ready.notify_one();
    }

    fn pop(&self) -> Option<Message> {
        self.lock().pop_front()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

struct Inner {
    exchanges: RwLock<HashMap<String, Exchange>>,
    queues: RwLock<HashMap<String, Arc<Queue>>>,
    available: AtomicBool,
}

/// Cloneable handle to the in-process message fabric.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                exchanges: RwLock::new(HashMap::new()),
                queues: RwLock::new(HashMap::new()),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Simulates losing or regaining the broker connection.
    pub fn set_available(&self, available: bool) {
        let was = self.inner.available.swap(available, Ordering::SeqCst);
        if was != available {
            if available {
                info!("message broker connection restored");
            } else {
                warn!("message broker connection lost");
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(MessagingError::Unavailable)
        }
    }

    /// Declares an exchange. Redeclaring with the same kind is a no-op.
    pub async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        self.ensure_available()?;
        let mut exchanges = self.inner.exchanges.write().await;
        match exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(MessagingError::TopologyConflict(
                format!("exchange {name} already declared as {:?}", existing.kind),
            )),
            Some(_) => Ok(()),
            None => {
                exchanges.insert(
                    name.to_string(),
                    Exchange {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                debug!(exchange = name, ?kind, "exchange declared");
                Ok(())
            }
        }
    }

    /// Declares a queue, creating its dead-letter queue first if needed.
    pub async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        self.ensure_available()?;
        let mut queues = self.inner.queues.write().await;
        if queues.contains_key(name) {
            return Ok(());
        }

        let dead_letter = match options.dead_letter {
            Some(dlq) => Some(
                queues
                    .entry(dlq.clone())
                    .or_insert_with(|| Arc::new(Queue::new(&dlq, None)))
                    .clone(),
            ),
            None => None,
        };
        queues.insert(name.to_string(), Arc::new(Queue::new(name, dead_letter)));
        debug!(queue = name, "queue declared");
        Ok(())
    }

    /// Binds a queue to an exchange under a routing pattern.
    pub async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        self.ensure_available()?;
        if !self.inner.queues.read().await.contains_key(queue) {
            return Err(MessagingError::QueueNotFound(queue.to_string()));
        }
        let mut exchanges = self.inner.exchanges.write().await;
        let exchange_entry = exchanges
            .get_mut(exchange)
            .ok_or_else(|| MessagingError::ExchangeNotFound(exchange.to_string()))?;
        let exists = exchange_entry
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.pattern == pattern);
        if !exists {
            exchange_entry.bindings.push(Binding {
                queue: queue.to_string(),
                pattern: pattern.to_string(),
            });
        }
        Ok(())
    }

    /// Publishes to an exchange. Returns how many queues received a copy.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mut message: Message,
    ) -> Result<usize> {
        self.ensure_available()?;
        message.routing_key = routing_key.to_string();

        let targets: Vec<String> = {
            let exchanges = self.inner.exchanges.read().await;
            let entry = exchanges
                .get(exchange)
                .ok_or_else(|| MessagingError::ExchangeNotFound(exchange.to_string()))?;
            let mut targets: Vec<String> = entry
                .bindings
                .iter()
                .filter(|b| entry.kind.routes(&b.pattern, routing_key))
                .map(|b| b.queue.clone())
                .collect();
            targets.sort();
            targets.dedup();
            targets
        };

        if targets.is_empty() {
            debug!(exchange, routing_key, "no binding matched, message dropped");
            return Ok(0);
        }

        let queues = self.inner.queues.read().await;
        for target in &targets {
            if let Some(queue) = queues.get(target) {
                queue.push_back(message.clone());
            }
        }
        metrics::counter!("messages_published_total", "exchange" => exchange.to_string())
            .increment(1);
        Ok(targets.len())
    }

    /// Sends directly to a queue (default-exchange semantics).
    pub async fn send_to_queue(&self, queue: &str, message: Message) -> Result<()> {
        self.ensure_available()?;
        let queue_entry = self.queue(queue).await?;
        queue_entry.push_back(message);
        metrics::counter!("messages_published_total", "exchange" => "").increment(1);
        Ok(())
    }

    /// Waits for the next message on `queue`.
    ///
    /// Cancel-safe: dropping the future before it resolves never loses a message.
    pub async fn receive(&self, queue: &str) -> Result<Delivery> {
        let queue = self.queue(queue).await?;
        loop {
            self.ensure_available()?;
            if let Some(message) = queue.pop() {
                return Ok(Delivery::new(message, queue));
            }
            queue.ready.notified().await;
        }
    }

    /// Takes the next message without waiting.
    pub async fn try_receive(&self, queue: &str) -> Result<Option<Delivery>> {
        self.ensure_available()?;
        let queue = self.queue(queue).await?;
        Ok(queue.pop().map(|message| Delivery::new(message, queue)))
    }

    /// Number of ready (undelivered) messages in a queue.
    pub async fn queue_depth(&self, queue: &str) -> Result<usize> {
        Ok(self.queue(queue).await?.len())
    }

    async fn queue(&self, name: &str) -> Result<Arc<Queue>> {
        self.inner
            .queues
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| MessagingError::QueueNotFound(name.to_string()))
    }
}

/// A message taken from a queue that must be settled exactly once.
///
/// Settling consumes the delivery. A delivery dropped without being
/// settled goes back to the head of its queue unchanged.
pub struct Delivery {
    message: Message,
    queue: Arc<Queue>,
    settled: bool,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue.name)
            .field("message_id", &self.message.message_id)
            .field("retry_count", &self.message.headers.retry_count)
            .finish()
    }
}

impl Delivery {
    fn new(message: Message, queue: Arc<Queue>) -> Self {
        Self {
            message,
            queue,
            settled: false,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn queue_name(&self) -> &str {
        &self.queue.name
    }

    /// Acknowledges successful processing.
    pub fn ack(mut self) {
        self.settled = true;
        metrics::counter!("messages_acked_total", "queue" => self.queue.name.clone()).increment(1);
    }

    /// Puts the message back at the tail with an updated retry count.
    pub fn requeue(mut self, retry_count: u32) {
        self.settled = true;
        let mut message = self.message.clone();
        message.headers.retry_count = retry_count;
        self.queue.push_back(message);
        metrics::counter!("messages_requeued_total", "queue" => self.queue.name.clone())
            .increment(1);
    }

    /// Routes the message to the queue's dead-letter queue.
    pub fn dead_letter(mut self, reason: &str) {
        self.settled = true;
        let mut message = self.message.clone();
        message.headers.death_reason = Some(reason.to_string());
        match &self.queue.dead_letter {
            Some(dlq) => {
                error!(
                    queue = %self.queue.name,
                    dead_letter_queue = %dlq.name,
                    message_id = %message.message_id,
                    correlation_id = %message.correlation_id,
                    retry_count = message.headers.retry_count,
                    reason,
                    "message dead-lettered"
                );
                dlq.push_back(message);
            }
            None => {
                error!(
                    queue = %self.queue.name,
                    message_id = %message.message_id,
                    reason,
                    "message rejected with no dead-letter queue, dropped"
                );
            }
        }
        metrics::counter!("messages_dead_lettered_total", "queue" => self.queue.name.clone())
            .increment(1);
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if !self.settled {
            self.queue.push_front(self.message.clone());
        }
    }
}

//! Wires every saga participant to its queue and runs the consumers.

use std::sync::Arc;
use std::time::Duration;

use idempotency::IdempotencyGuard;
use messaging::{
    BestEffortSink, Broker, Consumer, ConsumerConfig, DurablePublisher, MessageHandler,
    OutboxConfig,
};
use store::SagaStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::coordinator::{OrderSagaCoordinator, SagaEventHandler, ValidationHandler};
use crate::error::Result;
use crate::handler::IdempotentHandler;
use crate::inventory::{InventoryHandler, InventoryReservationCoordinator};
use crate::notification::{NotificationHandler, Notifier};
use crate::payment::{PaymentGateway, PaymentHandler, PaymentProcessor};
use crate::topology::{
    CUSTOMER_NOTIFICATION_QUEUE, INVENTORY_RESERVE_QUEUE, OPERATIONS_NOTIFICATION_QUEUE,
    ORDER_PROCESS_QUEUE, ORDER_SAGA_QUEUE, PAYMENT_PROCESS_QUEUE, declare_topology,
};

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Unacknowledged messages per consumer.
    pub prefetch: usize,
    /// Requeues before a failing message is dead-lettered.
    pub max_retries: u32,
    /// Pause between reconnect attempts and outbox flushes.
    pub reconnect_delay: Duration,
    pub outbox_capacity: usize,
    /// How long shutdown waits for the broker to take parked messages.
    pub drain_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            prefetch: 10,
            max_retries: 3,
            reconnect_delay: Duration::from_secs(5),
            outbox_capacity: 10_000,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl RuntimeConfig {
    fn consumer(&self, queue: &str) -> ConsumerConfig {
        ConsumerConfig::new(queue)
            .with_prefetch(self.prefetch)
            .with_max_retries(self.max_retries)
            .with_reconnect_delay(self.reconnect_delay)
    }

    fn outbox(&self) -> OutboxConfig {
        OutboxConfig {
            capacity: self.outbox_capacity,
            reconnect_delay: self.reconnect_delay,
            drain_timeout: self.drain_timeout,
        }
    }
}

/// Collaborators the runtime is built from.
pub struct SagaDependencies<S> {
    pub store: S,
    pub broker: Broker,
    pub guard: IdempotencyGuard,
    pub analytics: BestEffortSink,
    pub gateway: Arc<dyn PaymentGateway>,
    pub notifier: Arc<dyn Notifier>,
}

/// The running saga: participants, their consumers and the outbox flusher.
pub struct SagaRuntime<S> {
    broker: Broker,
    publisher: DurablePublisher,
    guard: IdempotencyGuard,
    coordinator: Arc<OrderSagaCoordinator<S>>,
    inventory: Arc<InventoryReservationCoordinator<S>>,
    payment: Arc<PaymentProcessor<S>>,
    shutdown: watch::Sender<bool>,
    consumers: Vec<JoinHandle<()>>,
    flusher_shutdown: watch::Sender<bool>,
    flusher: JoinHandle<()>,
}

impl<S: SagaStore + Clone + 'static> SagaRuntime<S> {
    /// Declares the topology and spawns one consumer per queue.
    pub async fn start(deps: SagaDependencies<S>, config: RuntimeConfig) -> Result<Self> {
        let SagaDependencies {
            store,
            broker,
            guard,
            analytics,
            gateway,
            notifier,
        } = deps;

        declare_topology(&broker).await?;
        let publisher = DurablePublisher::new(broker.clone(), config.outbox());

        let coordinator = Arc::new(OrderSagaCoordinator::new(
            store.clone(),
            publisher.clone(),
            guard.clone(),
            analytics.clone(),
        ));
        let inventory = Arc::new(InventoryReservationCoordinator::new(
            store.clone(),
            publisher.clone(),
            guard.clone(),
        ));
        let payment = Arc::new(PaymentProcessor::new(
            store,
            gateway,
            publisher.clone(),
            analytics,
        ));

        let (shutdown, shutdown_rx) = watch::channel(false);
        // Consumers publish through the outbox, so the flusher stops last.
        let (flusher_shutdown, flusher_rx) = watch::channel(false);
        let flusher = publisher.spawn_flusher(flusher_rx);
        let mut runtime = Self {
            broker,
            publisher,
            guard,
            coordinator,
            inventory,
            payment,
            shutdown,
            consumers: Vec::new(),
            flusher_shutdown,
            flusher,
        };

        runtime.spawn(
            ValidationHandler(runtime.coordinator.clone()),
            config.consumer(ORDER_PROCESS_QUEUE),
            &shutdown_rx,
        );
        runtime.spawn(
            SagaEventHandler(runtime.coordinator.clone()),
            config.consumer(ORDER_SAGA_QUEUE),
            &shutdown_rx,
        );
        runtime.spawn(
            InventoryHandler(runtime.inventory.clone()),
            config.consumer(INVENTORY_RESERVE_QUEUE),
            &shutdown_rx,
        );
        runtime.spawn(
            PaymentHandler(runtime.payment.clone()),
            config.consumer(PAYMENT_PROCESS_QUEUE),
            &shutdown_rx,
        );
        for queue in [CUSTOMER_NOTIFICATION_QUEUE, OPERATIONS_NOTIFICATION_QUEUE] {
            runtime.spawn(
                NotificationHandler::new(queue, notifier.clone()),
                config.consumer(queue).without_retries(),
                &shutdown_rx,
            );
        }

        info!(consumers = runtime.consumers.len(), "saga runtime started");
        Ok(runtime)
    }

    fn spawn<H: MessageHandler>(
        &mut self,
        handler: H,
        config: ConsumerConfig,
        shutdown: &watch::Receiver<bool>,
    ) {
        let handler = IdempotentHandler::new(config.queue.clone(), self.guard.clone(), handler);
        let consumer = Consumer::new(self.broker.clone(), Arc::new(handler), config);
        self.consumers.push(tokio::spawn(consumer.run(shutdown.clone())));
    }

    pub fn coordinator(&self) -> &Arc<OrderSagaCoordinator<S>> {
        &self.coordinator
    }

    pub fn inventory(&self) -> &Arc<InventoryReservationCoordinator<S>> {
        &self.inventory
    }

    pub fn payment(&self) -> &Arc<PaymentProcessor<S>> {
        &self.payment
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn publisher(&self) -> &DurablePublisher {
        &self.publisher
    }

    pub fn guard(&self) -> &IdempotencyGuard {
        &self.guard
    }

    /// Stops every consumer, waits for in-flight handlers, then drains the
    /// outbox of whatever those handlers published.
    pub async fn shutdown(self) {
        info!("saga runtime shutting down");
        let _ = self.shutdown.send(true);
        for consumer in self.consumers {
            let _ = consumer.await;
        }
        let _ = self.flusher_shutdown.send(true);
        let _ = self.flusher.await;
        info!("saga runtime stopped");
    }
}

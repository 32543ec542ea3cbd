//! End-to-end tests of the order saga over the in-process fabric.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{CorrelationId, CustomerId, Money, OrderId, ProductId};
use domain::{
    CustomerInfo, NewOrder, NewOrderLine, Order, OrderEventType, OrderStatus, Product,
    ReservationStatus, TransactionStatus,
};
use idempotency::{IdempotencyConfig, IdempotencyGuard, InMemoryKeyValueStore};
use messaging::{BestEffortSink, Broker, Message, StreamingSink};
use saga::{
    CreateOrderOutcome, GatewayOutcome, InMemoryNotifier, PaymentGateway, RuntimeConfig,
    SagaDependencies, SagaRuntime, ScriptedGateway, topology,
};
use serde_json::json;
use store::{InMemoryStore, InventoryRepository, OrderRepository, PaymentRepository};
use tokio::sync::Notify;

/// Gateway that holds every charge until the test lets it through.
struct HeldGateway {
    inner: ScriptedGateway,
    entered: Notify,
    release: Notify,
    /// Taken offline once a held charge goes through.
    outage: Option<Broker>,
}

impl HeldGateway {
    fn new(inner: ScriptedGateway) -> Self {
        Self {
            inner,
            entered: Notify::new(),
            release: Notify::new(),
            outage: None,
        }
    }

    /// Waits until a charge is held.
    async fn charging(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.entered.notified())
            .await
            .expect("no charge attempted");
    }
}

#[async_trait]
impl PaymentGateway for HeldGateway {
    async fn charge(&self, order_id: OrderId, amount: Money) -> GatewayOutcome {
        self.entered.notify_one();
        self.release.notified().await;
        if let Some(broker) = &self.outage {
            broker.set_available(false);
        }
        self.inner.charge(order_id, amount).await
    }
}

struct Harness {
    runtime: SagaRuntime<InMemoryStore>,
    store: InMemoryStore,
    broker: Broker,
    gateway: ScriptedGateway,
    notifier: InMemoryNotifier,
    analytics: StreamingSink,
    product: Product,
}

impl Harness {
    async fn start() -> Self {
        let gateway = ScriptedGateway::new();
        Self::start_with_gateway(gateway.clone(), Arc::new(gateway)).await
    }

    async fn start_with_gateway(
        gateway: ScriptedGateway,
        payment_gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self::start_on(Broker::new(), gateway, payment_gateway).await
    }

    async fn start_on(
        broker: Broker,
        gateway: ScriptedGateway,
        payment_gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        let store = InMemoryStore::new();
        let notifier = InMemoryNotifier::new();
        let analytics = StreamingSink::default();

        let product = Product::new("SKU-P", "Widget", Money::from_cents(1000), 5);
        store.upsert_product(&product).await.unwrap();

        let runtime = SagaRuntime::start(
            SagaDependencies {
                store: store.clone(),
                broker: broker.clone(),
                guard: IdempotencyGuard::new(
                    Arc::new(InMemoryKeyValueStore::new()),
                    IdempotencyConfig::default(),
                ),
                analytics: BestEffortSink::new(Arc::new(analytics.clone())),
                gateway: payment_gateway,
                notifier: Arc::new(notifier.clone()),
            },
            RuntimeConfig {
                reconnect_delay: Duration::from_millis(20),
                ..RuntimeConfig::default()
            },
        )
        .await
        .unwrap();

        Self {
            runtime,
            store,
            broker,
            gateway,
            notifier,
            analytics,
            product,
        }
    }

    fn order_for(&self, lines: Vec<(ProductId, u32)>) -> NewOrder {
        NewOrder::new(
            CustomerInfo::new(CustomerId::new()),
            lines
                .into_iter()
                .map(|(product_id, quantity)| {
                    NewOrderLine::new(product_id, quantity, Money::from_cents(1000))
                })
                .collect(),
        )
    }

    async fn place(&self, quantity: u32) -> OrderId {
        let outcome = self
            .runtime
            .coordinator()
            .create_order(self.order_for(vec![(self.product.id, quantity)]), None)
            .await
            .unwrap();
        outcome.summary().order_id
    }

    async fn wait_for_status(&self, order_id: OrderId, status: OrderStatus) -> Order {
        let store = self.store.clone();
        tokio::time::timeout(Duration::from_secs(5), async move {
            loop {
                if let Some(order) = store.get_order(order_id).await.unwrap()
                    && order.status == status
                {
                    return order;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("order {order_id} never reached {status}"))
    }

    async fn wait_for_notifications(&self, count: usize) {
        let notifier = self.notifier.clone();
        tokio::time::timeout(Duration::from_secs(5), async move {
            while notifier.sent().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("notifications not delivered");
    }

    async fn wait_for_depth(&self, queue: &str, depth: usize) {
        let broker = self.broker.clone();
        let queue = queue.to_string();
        tokio::time::timeout(Duration::from_secs(5), async move {
            while broker.queue_depth(&queue).await.unwrap() != depth {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("queue depth not reached");
    }

    async fn reserved(&self) -> u32 {
        self.store
            .get_product(self.product.id)
            .await
            .unwrap()
            .unwrap()
            .quantity_reserved
    }

    async fn event_types(&self, order_id: OrderId) -> Vec<OrderEventType> {
        self.store
            .events_for_order(order_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }
}

#[tokio::test]
async fn test_payment_success_confirms_order() {
    let h = Harness::start().await;

    let order_id = h.place(2).await;
    let order = h.wait_for_status(order_id, OrderStatus::Confirmed).await;

    assert_eq!(order.total_amount, Money::from_cents(2000));
    assert_eq!(h.reserved().await, 2);

    let transactions = h.store.transactions_for_order(order_id).await.unwrap();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].status, TransactionStatus::Completed);
    assert_eq!(transactions[0].amount, Money::from_cents(2000));

    let reservations = h.store.reservations_for_order(order_id).await.unwrap();
    assert_eq!(reservations.len(), 1);
    assert_eq!(reservations[0].status, ReservationStatus::Confirmed);

    assert_eq!(
        h.event_types(order_id).await,
        [
            OrderEventType::OrderCreated,
            OrderEventType::OrderValidating,
            OrderEventType::InventoryReserved,
            OrderEventType::PaymentCompleted,
            OrderEventType::OrderConfirmed,
        ]
    );

    h.wait_for_notifications(2).await;
    let channels: Vec<_> = h.notifier.sent().into_iter().map(|n| n.channel).collect();
    assert!(channels.contains(&"notification.customer".to_string()));
    assert!(channels.contains(&"notification.operations".to_string()));

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_payment_decline_rejects_and_restores_stock() {
    let h = Harness::start().await;
    h.gateway.decline_next();

    let order_id = h.place(2).await;
    h.wait_for_status(order_id, OrderStatus::Rejected).await;

    assert_eq!(h.reserved().await, 0);
    let transactions = h.store.transactions_for_order(order_id).await.unwrap();
    assert_eq!(transactions[0].status, TransactionStatus::Failed);
    let reservations = h.store.reservations_for_order(order_id).await.unwrap();
    assert!(reservations.iter().all(|r| r.status == ReservationStatus::Released));

    let types = h.event_types(order_id).await;
    assert_eq!(
        &types[types.len() - 2..],
        [OrderEventType::PaymentFailed, OrderEventType::OrderRejected]
    );

    h.wait_for_notifications(2).await;
    assert!(h.notifier.sent()[0].text.contains("Payment declined"));

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_insufficient_stock_rejects_without_payment() {
    let h = Harness::start().await;

    let order_id = h.place(6).await;
    h.wait_for_status(order_id, OrderStatus::Rejected).await;

    assert_eq!(h.reserved().await, 0);
    assert!(h.store.reservations_for_order(order_id).await.unwrap().is_empty());
    assert!(h.gateway.charges().is_empty());
    assert_eq!(
        h.event_types(order_id).await,
        [
            OrderEventType::OrderCreated,
            OrderEventType::OrderValidating,
            OrderEventType::OrderRejected,
        ]
    );

    h.wait_for_notifications(2).await;
    assert!(h.notifier.sent()[0].text.contains("Insufficient stock"));

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_reservation_is_all_or_nothing() {
    let h = Harness::start().await;
    let unknown = ProductId::new();

    let outcome = h
        .runtime
        .coordinator()
        .create_order(h.order_for(vec![(h.product.id, 2), (unknown, 1)]), None)
        .await
        .unwrap();
    let order_id = outcome.summary().order_id;
    h.wait_for_status(order_id, OrderStatus::Rejected).await;

    assert_eq!(h.reserved().await, 0);
    assert!(h.store.reservations_for_order(order_id).await.unwrap().is_empty());
    assert!(h.store.stock_movements(h.product.id).await.unwrap().is_empty());

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_submission_creates_one_order() {
    let h = Harness::start().await;
    let coordinator = h.runtime.coordinator();

    let first = coordinator
        .create_order(h.order_for(vec![(h.product.id, 1)]), Some("checkout-42"))
        .await
        .unwrap();
    let order_id = first.summary().order_id;
    h.wait_for_status(order_id, OrderStatus::Confirmed).await;

    let second = coordinator
        .create_order(h.order_for(vec![(h.product.id, 1)]), Some("checkout-42"))
        .await
        .unwrap();

    assert!(matches!(second, CreateOrderOutcome::Duplicate(_)));
    assert_eq!(second.summary().order_id, order_id);
    assert_eq!(h.store.order_count().await, 1);
    assert_eq!(h.gateway.charges().len(), 1);
    assert_eq!(h.event_types(order_id).await.len(), 5);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_cancel_after_confirmation_is_rejected() {
    let h = Harness::start().await;
    let order_id = h.place(1).await;
    h.wait_for_status(order_id, OrderStatus::Confirmed).await;

    let result = h.runtime.coordinator().cancel_order(order_id).await;

    assert!(matches!(result, Err(saga::SagaError::InvalidOperation(_))));
    assert_eq!(h.reserved().await, 1);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_cancel_reserved_order_releases_stock() {
    let gateway = ScriptedGateway::new();
    let held = Arc::new(HeldGateway::new(gateway.clone()));
    let h = Harness::start_with_gateway(gateway, held.clone()).await;

    let order_id = h.place(2).await;
    held.charging().await;
    let order = h.store.get_order(order_id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Reserved);
    assert_eq!(h.reserved().await, 2);

    let cancelled = h.runtime.coordinator().cancel_order(order_id).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);

    let store = h.store.clone();
    let product_id = h.product.id;
    tokio::time::timeout(Duration::from_secs(5), async move {
        while store.get_product(product_id).await.unwrap().unwrap().quantity_reserved != 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("reservation not released");
    let reservations = h.store.reservations_for_order(order_id).await.unwrap();
    assert_eq!(reservations.len(), 1);
    assert_eq!(reservations[0].status, ReservationStatus::Released);

    // The charge already in flight settles without reviving the order or its stock.
    held.release.notify_one();
    let store = h.store.clone();
    tokio::time::timeout(Duration::from_secs(5), async move {
        while store.transactions_for_order(order_id).await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("payment not recorded");
    h.wait_for_depth(topology::ORDER_SAGA_QUEUE, 0).await;
    let order = h.store.get_order(order_id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(h.reserved().await, 0);
    assert_eq!(
        h.event_types(order_id).await.last(),
        Some(&OrderEventType::OrderCancelled)
    );

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_saga_survives_broker_outage() {
    let h = Harness::start().await;
    h.broker.set_available(false);

    let order_id = h.place(2).await;
    assert_eq!(h.runtime.publisher().pending().await, 2);

    h.broker.set_available(true);
    h.wait_for_status(order_id, OrderStatus::Confirmed).await;
    assert_eq!(h.runtime.publisher().pending().await, 0);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_drains_messages_published_by_in_flight_handlers() {
    let broker = Broker::new();
    let gateway = ScriptedGateway::new();
    let held = Arc::new(HeldGateway {
        outage: Some(broker.clone()),
        ..HeldGateway::new(gateway.clone())
    });
    let h = Harness::start_on(broker, gateway, held.clone()).await;

    h.place(2).await;
    held.charging().await;
    let publisher = h.runtime.publisher().clone();
    let broker = h.broker.clone();

    let shutdown = tokio::spawn(h.runtime.shutdown());
    tokio::time::sleep(Duration::from_millis(50)).await;
    // The payment handler is still running; its events park while the broker is down.
    held.release.notify_one();
    tokio::time::sleep(Duration::from_millis(100)).await;
    broker.set_available(true);
    shutdown.await.unwrap();

    assert_eq!(publisher.pending().await, 0);
    assert_eq!(broker.queue_depth(topology::ORDER_SAGA_QUEUE).await.unwrap(), 1);
    assert_eq!(
        broker
            .queue_depth(topology::CUSTOMER_NOTIFICATION_QUEUE)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn test_poison_message_is_dead_lettered() {
    let h = Harness::start().await;
    let poison = Message::new(
        topology::routing::PAYMENT_PROCESS,
        CorrelationId::new(),
        json!({ "type": "ProcessPayment", "data": { "order_id": "not-a-uuid" } }),
    );

    h.broker
        .send_to_queue(topology::PAYMENT_PROCESS_QUEUE, poison)
        .await
        .unwrap();
    h.wait_for_depth("payment.process.dlq", 1).await;

    let dead = h
        .broker
        .try_receive("payment.process.dlq")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dead.message().retry_count(), 3);
    assert!(dead.message().headers.death_reason.is_some());
    dead.ack();

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_unknown_event_type_is_acknowledged() {
    let h = Harness::start().await;
    let unknown = Message::new(
        "order.shipped",
        CorrelationId::new(),
        json!({ "type": "OrderShipped", "data": {} }),
    );

    h.broker
        .send_to_queue(topology::ORDER_SAGA_QUEUE, unknown)
        .await
        .unwrap();
    h.wait_for_depth(topology::ORDER_SAGA_QUEUE, 0).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.broker.queue_depth("order.saga.dlq").await.unwrap(), 0);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_analytics_stream_sees_saga_milestones() {
    let h = Harness::start().await;
    let mut records = h.analytics.subscribe();

    let order_id = h.place(1).await;
    h.wait_for_status(order_id, OrderStatus::Confirmed).await;

    let mut types = Vec::new();
    while types.len() < 2 {
        let record = tokio::time::timeout(Duration::from_secs(5), records.recv())
            .await
            .expect("analytics record not published")
            .unwrap();
        assert_eq!(record.topic, topology::ANALYTICS_TOPIC);
        assert_eq!(record.key, order_id.to_string());
        types.push(record.payload["type"].as_str().unwrap_or_default().to_string());
    }
    assert_eq!(types, ["OrderCreated", "OrderConfirmed"]);

    h.runtime.shutdown().await;
}

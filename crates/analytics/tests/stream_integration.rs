//! Analytics fed through the best-effort sink the saga publishes with.

use std::sync::Arc;
use std::time::Duration;

use analytics::{AnalyticsProcessor, RealtimeMetrics};
use common::{CorrelationId, Money, OrderId};
use messaging::{BestEffortSink, StreamingSink};
use serde_json::json;
use tokio::sync::watch;

async fn wait_for_created(metrics: &RealtimeMetrics, count: u64) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while metrics.snapshot().await.orders_created < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("analytics never caught up");
}

#[tokio::test]
async fn test_sink_records_reach_realtime_metrics() {
    let stream = StreamingSink::default();
    let sink = BestEffortSink::new(Arc::new(stream.clone()));
    let metrics = RealtimeMetrics::new();
    let mut processor = AnalyticsProcessor::new();
    processor.register(Arc::new(metrics.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = processor.spawn(stream.subscribe(), shutdown_rx);

    let order_id = OrderId::new();
    let correlation_id = CorrelationId::new();
    sink.fire_and_forget(
        "order-events",
        &order_id.to_string(),
        &json!({
            "type": "OrderConfirmed",
            "data": { "order_id": order_id, "total_amount": 4200 },
            "correlation_id": correlation_id,
        }),
    )
    .await;
    sink.fire_and_forget(
        "order-events",
        &order_id.to_string(),
        &json!({ "type": "OrderCreated", "data": { "order_id": order_id } }),
    )
    .await;
    wait_for_created(&metrics, 1).await;

    let snapshot = metrics.snapshot().await;
    assert_eq!(snapshot.orders_confirmed, 1);
    assert_eq!(snapshot.total_revenue, Money::from_cents(4200));
    assert_eq!(snapshot.recent_events[1].order_id, Some(order_id));
    assert_eq!(snapshot.recent_events[1].correlation_id, Some(correlation_id));

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_stream_outage_loses_records_without_failing() {
    let stream = StreamingSink::default();
    let sink = BestEffortSink::new(Arc::new(stream.clone()));
    let metrics = RealtimeMetrics::new();
    let mut processor = AnalyticsProcessor::new();
    processor.register(Arc::new(metrics.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = processor.spawn(stream.subscribe(), shutdown_rx);
    let created = json!({ "type": "OrderCreated", "data": {} });

    stream.set_available(false);
    sink.fire_and_forget("order-events", "a", &created).await;
    stream.set_available(true);
    sink.fire_and_forget("order-events", "b", &created).await;
    wait_for_created(&metrics, 1).await;

    assert_eq!(sink.failures(), 1);
    assert_eq!(metrics.snapshot().await.orders_created, 1);

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
}

//! Best-effort analytics streaming.
//!
//! Analytics must never hold up the saga: [`BestEffortSink`] swallows every
//! error from the underlying [`AnalyticsSink`] and only logs a bounded
//! sample of them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{MessagingError, Result};

/// Failures are logged on the first occurrence and then every this many.
const LOG_EVERY: u64 = 100;

/// One record on the analytics stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsRecord {
    pub topic: String,
    pub key: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// A streaming destination for analytics events.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn send(&self, topic: &str, key: &str, payload: &serde_json::Value) -> Result<()>;
}

/// In-process stream backed by a broadcast channel.
#[derive(Clone)]
pub struct StreamingSink {
    sender: broadcast::Sender<AnalyticsRecord>,
    available: Arc<AtomicBool>,
}

impl StreamingSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AnalyticsRecord> {
        self.sender.subscribe()
    }

    /// Simulates the stream going away.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl Default for StreamingSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl AnalyticsSink for StreamingSink {
    async fn send(&self, topic: &str, key: &str, payload: &serde_json::Value) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(MessagingError::Unavailable);
        }
        let record = AnalyticsRecord {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: payload.clone(),
            timestamp: Utc::now(),
        };
        if self.sender.send(record).is_err() {
            debug!(topic, "no analytics subscribers, record dropped");
        }
        Ok(())
    }
}

/// Fire-and-forget wrapper around an analytics sink.
#[derive(Clone)]
pub struct BestEffortSink {
    sink: Arc<dyn AnalyticsSink>,
    failures: Arc<AtomicU64>,
}

impl BestEffortSink {
    pub fn new(sink: Arc<dyn AnalyticsSink>) -> Self {
        Self {
            sink,
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Sends and forgets. Never fails.
    pub async fn fire_and_forget(&self, topic: &str, key: &str, payload: &serde_json::Value) {
        if let Err(err) = self.sink.send(topic, key, payload).await {
            let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
            metrics::counter!("analytics_dropped_total").increment(1);
            if failures == 1 || failures % LOG_EVERY == 0 {
                warn!(topic, key, failures, error = %err, "analytics event dropped");
            }
        }
    }

    /// Total number of dropped events so far.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_records() {
        let sink = StreamingSink::default();
        let mut receiver = sink.subscribe();

        sink.send("order-events", "order-1", &json!({ "type": "OrderCreated" }))
            .await
            .unwrap();

        let record = receiver.recv().await.unwrap();
        assert_eq!(record.topic, "order-events");
        assert_eq!(record.payload["type"], "OrderCreated");
    }

    #[tokio::test]
    async fn test_send_without_subscribers_is_ok() {
        let sink = StreamingSink::default();
        assert!(sink.send("t", "k", &json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn test_best_effort_swallows_failures() {
        let sink = StreamingSink::default();
        sink.set_available(false);
        let best_effort = BestEffortSink::new(Arc::new(sink.clone()));

        for _ in 0..3 {
            best_effort
                .fire_and_forget("order-events", "k", &json!({}))
                .await;
        }
        assert_eq!(best_effort.failures(), 3);

        sink.set_available(true);
        best_effort
            .fire_and_forget("order-events", "k", &json!({}))
            .await;
        assert_eq!(best_effort.failures(), 3);
    }
}

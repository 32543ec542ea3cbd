//! Drives projections from the analytics stream.

use std::sync::Arc;

use messaging::AnalyticsRecord;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::Result;
use crate::event::AnalyticsEvent;
use crate::projection::Projection;

/// Delivers every analytics record to the registered projections.
///
/// Processing is best-effort like the stream itself: malformed records and
/// projection failures are logged and skipped, and a lagging receiver just
/// loses the records it fell behind on.
#[derive(Clone, Default)]
pub struct AnalyticsProcessor {
    projections: Vec<Arc<dyn Projection>>,
}

impl AnalyticsProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, projection: Arc<dyn Projection>) {
        self.projections.push(projection);
    }

    pub fn projection_count(&self) -> usize {
        self.projections.len()
    }

    /// Delivers one record to every projection.
    #[tracing::instrument(skip(self, record), fields(topic = %record.topic, key = %record.key))]
    pub async fn process_record(&self, record: &AnalyticsRecord) -> Result<()> {
        let event = AnalyticsEvent::from_record(record)?;
        for projection in &self.projections {
            if let Err(err) = projection.handle(&event).await {
                warn!(
                    projection = projection.name(),
                    event_type = %event.event_type,
                    error = %err,
                    "projection failed to apply event"
                );
            }
        }
        metrics::counter!("analytics_events_processed_total").increment(1);
        Ok(())
    }

    /// Consumes the stream until shutdown is signalled or every sender is gone.
    pub async fn run(
        self,
        mut receiver: broadcast::Receiver<AnalyticsRecord>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(projections = self.projections.len(), "analytics processor started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = receiver.recv() => match received {
                    Ok(record) => {
                        if let Err(err) = self.process_record(&record).await {
                            debug!(key = %record.key, error = %err, "analytics record skipped");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        metrics::counter!("analytics_events_missed_total").increment(missed);
                        warn!(missed, "analytics processor lagged, events skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("analytics stream closed");
                        break;
                    }
                },
            }
        }
        info!("analytics processor stopped");
    }

    pub fn spawn(
        self,
        receiver: broadcast::Receiver<AnalyticsRecord>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(receiver, shutdown))
    }
}

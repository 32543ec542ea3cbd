//! Core projection trait and position tracking.

use async_trait::async_trait;

use crate::Result;
use crate::event::AnalyticsEvent;

/// Tracks how many events a projection has processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectionPosition {
    /// Number of events folded into the projection so far.
    pub events_processed: u64,
}

impl ProjectionPosition {
    /// The position of a projection that has seen no events.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Returns the position after one more event.
    pub fn advance(&self) -> Self {
        Self {
            events_processed: self.events_processed + 1,
        }
    }
}

impl std::fmt::Display for ProjectionPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "position({})", self.events_processed)
    }
}

/// A read model folded from analytics events.
///
/// The stream is best-effort, so projections see each event at most once
/// and must tolerate gaps.
#[async_trait]
pub trait Projection: Send + Sync {
    /// Stable name used in logs and metrics labels.
    fn name(&self) -> &'static str;

    /// Folds one event into the read model.
    async fn handle(&self, event: &AnalyticsEvent) -> Result<()>;

    /// How far the projection has read.
    async fn position(&self) -> ProjectionPosition;

    /// Drops all state.
    async fn reset(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_advances_from_zero() {
        let pos = ProjectionPosition::zero().advance().advance();
        assert_eq!(pos.events_processed, 2);
        assert_eq!(pos.to_string(), "position(2)");
    }
}

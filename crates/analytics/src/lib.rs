//! Real-time analytics over the order event stream.
//!
//! The saga emits analytics records on a best-effort stream. This crate
//! folds them into read models:
//! - [`Projection`] trait for anything that consumes [`AnalyticsEvent`]s
//! - [`RealtimeMetrics`] with order counters, revenue and recent events
//! - [`AnalyticsProcessor`] that drives projections from the stream

pub mod error;
pub mod event;
pub mod processor;
pub mod projection;
pub mod views;

pub use error::{AnalyticsError, Result};
pub use event::AnalyticsEvent;
pub use processor::AnalyticsProcessor;
pub use projection::{Projection, ProjectionPosition};
pub use views::{RealtimeMetrics, RealtimeSnapshot, RecentEvent};

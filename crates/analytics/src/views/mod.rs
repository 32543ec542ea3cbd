//! Read models fed by the analytics stream.

pub mod realtime;

pub use realtime::{RealtimeMetrics, RealtimeSnapshot, RecentEvent};

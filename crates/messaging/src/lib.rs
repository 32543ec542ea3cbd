//! Message fabric for the order saga.
//!
//! An in-process broker with the three delivery shapes the saga relies on:
//!
//! - topic exchanges for fan-out by routing key
//! - fanout exchanges for notification broadcast
//! - point-to-point work queues with explicit settlement, retry-count
//!   tracking and dead-lettering
//!
//! On top of the broker sit the consumer loop ([`Consumer`]), the durable
//! saga-path publisher ([`DurablePublisher`]) and the best-effort analytics
//! path ([`BestEffortSink`]).

pub mod broker;
pub mod consumer;
pub mod error;
pub mod exchange;
pub mod message;
pub mod publisher;
pub mod sink;

pub use broker::{Broker, DEAD_LETTER_SUFFIX, Delivery, QueueOptions};
pub use consumer::{Consumer, ConsumerConfig, HandlerError, MessageHandler, Settlement, settle};
pub use error::{MessagingError, Result};
pub use exchange::{ExchangeKind, topic_matches};
pub use message::{Message, MessageHeaders};
pub use publisher::{DurablePublisher, OutboxConfig};
pub use sink::{AnalyticsRecord, AnalyticsSink, BestEffortSink, StreamingSink};

//! Shared identifiers and value types used by every saga participant.

mod ids;
mod money;

pub use ids::{CorrelationId, CustomerId, MessageId, OrderId, ProductId};
pub use money::Money;

//! Orders, their status machine and their event timeline.

mod event;
mod model;
mod status;

pub use event::{OrderEventRecord, OrderEventType};
pub use model::{CustomerInfo, NewOrder, NewOrderLine, Order, OrderLine, OrderSummary};
pub use status::OrderStatus;

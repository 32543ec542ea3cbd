//! Resilience primitives for synchronous calls to external dependencies.
//!
//! - [`CircuitBreaker`]: closed / open / half-open breaker over a rolling window
//! - [`CircuitBreakerRegistry`]: one breaker per named dependency
//! - [`retry_with_backoff`]: exponential backoff that skips client errors
//! - [`with_timeout`]: per-attempt deadline
//! - [`ResilientCaller`]: breaker around retry around timeout

pub mod breaker;
pub mod caller;
pub mod error;
pub mod registry;
pub mod retry;
pub mod timeout;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use caller::ResilientCaller;
pub use error::{ResilienceError, Retryable, is_client_error_status};
pub use registry::CircuitBreakerRegistry;
pub use retry::{RetryPolicy, retry_with_backoff};
pub use timeout::with_timeout;

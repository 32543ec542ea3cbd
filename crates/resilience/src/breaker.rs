//! Per-dependency circuit breaker.
//!
//! ```text
//! Closed ──(error rate >= threshold over the rolling window)──► Open
//!   ▲                                                            │
//!   │                                               (reset timeout elapses)
//!   │                                                            ▼
//!   └──────────────(trial succeeds)──────────────────────── HalfOpen
//!                   (trial fails) ──► Open
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::ResilienceError;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through and are counted.
    Closed,
    /// Calls are rejected without being attempted.
    Open,
    /// One trial call decides between closed and open.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Failure percentage (0-100) at which the breaker opens.
    pub error_threshold_percentage: u8,
    /// Calls required in the window before the rate is evaluated.
    pub volume_threshold: usize,
    /// Span of the rolling window of counted calls.
    pub rolling_window: Duration,
    /// Time spent open before a trial call is allowed.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold_percentage: 50,
            volume_threshold: 5,
            rolling_window: Duration::from_secs(10),
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Point-in-time view of a breaker, for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub calls_in_window: usize,
    pub failure_rate: f64,
    pub total_calls: u64,
    pub total_failures: u64,
    pub rejected: u64,
    pub since_last_transition_ms: u64,
}

struct Inner {
    state: CircuitState,
    window: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    last_transition: Instant,
    trial_in_flight: bool,
    total_calls: u64,
    total_failures: u64,
    rejected: u64,
}

impl Inner {
    fn prune(&mut self, now: Instant, span: Duration) {
        while let Some(&(at, _)) = self.window.front() {
            if now.duration_since(at) > span {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|(_, ok)| !ok).count();
        failures as f64 * 100.0 / self.window.len() as f64
    }
}

/// Circuit breaker for one named dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

/// Admission ticket for one call. Dropping it unfinished counts as a failure
/// so an abandoned half-open trial cannot wedge the breaker.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    finished: bool,
}

impl Permit<'_> {
    fn finish(mut self, success: bool) {
        self.finished = true;
        self.breaker.record(self.trial, success);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.breaker.record(self.trial, false);
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                opened_at: None,
                last_transition: Instant::now(),
                trial_in_flight: false,
                total_calls: 0,
                total_failures: 0,
                rejected: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState, now: Instant) {
        if inner.state == to {
            return;
        }
        let from = inner.state;
        inner.state = to;
        inner.last_transition = now;
        match to {
            CircuitState::Open => {
                inner.opened_at = Some(now);
                warn!(
                    name = %self.name,
                    %from,
                    failure_rate = inner.failure_rate(),
                    calls_in_window = inner.window.len(),
                    "circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                info!(name = %self.name, "circuit breaker half-open, allowing a trial call");
            }
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.window.clear();
                info!(name = %self.name, "circuit breaker closed");
            }
        }
        metrics::counter!(
            "circuit_breaker_transitions_total",
            "name" => self.name.clone(),
            "state" => to.as_str()
        )
        .increment(1);
    }

    /// Moves an open breaker to half-open once the reset timeout has elapsed.
    fn refresh(&self, inner: &mut Inner, now: Instant) {
        if inner.state == CircuitState::Open
            && inner
                .opened_at
                .is_some_and(|at| now.duration_since(at) >= self.config.reset_timeout)
        {
            self.transition(inner, CircuitState::HalfOpen, now);
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        let now = Instant::now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        inner.state
    }

    fn acquire(&self) -> Option<Permit<'_>> {
        let now = Instant::now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);

        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                inner.rejected += 1;
                return None;
            }
        };

        Some(Permit {
            breaker: self,
            trial,
            finished: false,
        })
    }

    fn record(&self, trial: bool, success: bool) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.total_calls += 1;
        if !success {
            inner.total_failures += 1;
        }

        if trial {
            inner.trial_in_flight = false;
            let next = if success {
                CircuitState::Closed
            } else {
                CircuitState::Open
            };
            self.transition(&mut inner, next, now);
            return;
        }

        inner.window.push_back((now, success));
        inner.prune(now, self.config.rolling_window);

        if inner.state == CircuitState::Closed
            && inner.window.len() >= self.config.volume_threshold
            && inner.failure_rate() >= f64::from(self.config.error_threshold_percentage)
        {
            self.transition(&mut inner, CircuitState::Open, now);
        }
    }

    /// Runs `op` if the breaker admits it; errors pass through unchanged.
    ///
    /// This is the building block for composing the breaker around calls
    /// that already report [`ResilienceError`]s (retry, timeout).
    pub async fn guarded<F, Fut, T, E>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        let Some(permit) = self.acquire() else {
            return Err(ResilienceError::CircuitOpen {
                name: self.name.clone(),
            });
        };
        let result = op().await;
        permit.finish(result.is_ok());
        result
    }

    /// Executes an operation with circuit breaker protection.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.guarded(move || async move { op().await.map_err(ResilienceError::Operation) })
            .await
    }

    /// Like [`call`](Self::call), but any failure (including an open
    /// breaker) is handed to `fallback`.
    pub async fn call_or_else<F, Fut, T, E, G>(&self, op: F, fallback: G) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce(ResilienceError<E>) -> T,
    {
        match self.call(op).await {
            Ok(value) => value,
            Err(err) => fallback(err),
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = Instant::now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        inner.prune(now, self.config.rolling_window);
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            calls_in_window: inner.window.len(),
            failure_rate: inner.failure_rate(),
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            rejected: inner.rejected,
            since_last_transition_ms: now.duration_since(inner.last_transition).as_millis() as u64,
        }
    }
}

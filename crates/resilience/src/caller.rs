use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::{
    CircuitBreaker, ResilienceError, RetryPolicy, Retryable, retry_with_backoff, with_timeout,
};

/// A breaker wrapped around retry wrapped around a per-attempt timeout.
///
/// The breaker records one outcome per logical call, after retries are spent.
#[derive(Clone)]
pub struct ResilientCaller {
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl ResilientCaller {
    pub fn new(breaker: Arc<CircuitBreaker>, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            breaker,
            retry,
            timeout,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub async fn call<F, Fut, T, E>(&self, mut op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let name = self.breaker.name();
        let timeout = self.timeout;
        let retry = &self.retry;
        let op = &mut op;
        self.breaker
            .guarded(move || {
                retry_with_backoff(retry, name, move |_| with_timeout(timeout, op()))
            })
            .await
    }

    /// Like [`call`](Self::call), with every failure handed to `fallback`.
    pub async fn call_or_else<F, Fut, T, E, G>(&self, op: F, fallback: G) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
        G: FnOnce(ResilienceError<E>) -> T,
    {
        match self.call(op).await {
            Ok(value) => value,
            Err(err) => fallback(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::{CircuitBreakerConfig, CircuitState};

    #[derive(Debug)]
    struct Unreachable;

    impl Display for Unreachable {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("connection refused")
        }
    }

    impl Retryable for Unreachable {}

    fn caller() -> ResilientCaller {
        ResilientCaller::new(
            Arc::new(CircuitBreaker::new("auth-service", CircuitBreakerConfig::default())),
            RetryPolicy::new(2, Duration::from_millis(100)),
            Duration::from_secs(5),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_timeouts_then_succeeds() {
        let caller = caller();
        let attempts = AtomicU32::new(0);

        let result = caller
            .call(|| async {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                Ok::<_, Unreachable>("ok")
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(caller.breaker().snapshot().total_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_counts_one_outcome_per_call() {
        let caller = caller();
        let attempts = AtomicU32::new(0);

        for _ in 0..5 {
            let result = caller
                .call(|| async {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Unreachable)
                })
                .await;
            assert!(matches!(result, Err(ResilienceError::Operation(Unreachable))));
        }

        assert_eq!(attempts.load(Ordering::SeqCst), 15);
        assert_eq!(caller.breaker().state(), CircuitState::Open);

        let fallback = caller
            .call_or_else(|| async { Ok::<_, Unreachable>(true) }, |err| {
                assert!(err.is_circuit_open());
                false
            })
            .await;
        assert!(!fallback);
        assert_eq!(attempts.load(Ordering::SeqCst), 15);
    }
}

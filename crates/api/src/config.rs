//! Application configuration loaded from environment variables.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use idempotency::IdempotencyConfig;
use resilience::{CircuitBreakerConfig, RetryPolicy};
use saga::RuntimeConfig;

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT` (default `0.0.0.0:3001`)
/// - `RUST_LOG` (default `"info"`), `LOG_FORMAT` (`text` or `json`)
/// - `DATABASE_URL`, unset for the in-memory store
/// - `API_TOKENS`, comma-separated bearer tokens accepted without a remote check
/// - `REQUIRE_AUTH` (default `false`)
/// - `PREFETCH`, `MAX_DELIVERY_RETRIES`, `RECONNECT_DELAY_MS` for the consumers
/// - `IDEMPOTENCY_TTL_SECS`
/// - `REQUEST_TIMEOUT_MS`, `RETRY_ATTEMPTS`, `RETRY_DELAY_MS` and the
///   `CIRCUIT_BREAKER_*` family for calls to the auth service
/// - `PAYMENT_SUCCESS_RATE` for the simulated gateway
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub api_tokens: HashSet<String>,
    pub require_auth: bool,
    pub prefetch: usize,
    pub max_delivery_retries: u32,
    pub idempotency_ttl: Duration,
    pub reconnect_delay: Duration,
    pub request_timeout: Duration,
    pub breaker_threshold: u8,
    pub breaker_reset_timeout: Duration,
    pub breaker_volume: usize,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub payment_success_rate: f64,
}

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from any key lookup. Unparsable values fall
    /// back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| Parsed(lookup(key));
        let millis = |key: &str, default: Duration| {
            parsed(key)
                .get()
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parsed("PORT").get().unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: match lookup("LOG_FORMAT").as_deref() {
                Some("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            api_tokens: lookup("API_TOKENS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|token| !token.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            require_auth: parsed("REQUIRE_AUTH").get().unwrap_or(defaults.require_auth),
            prefetch: parsed("PREFETCH").get().unwrap_or(defaults.prefetch),
            max_delivery_retries: parsed("MAX_DELIVERY_RETRIES")
                .get()
                .unwrap_or(defaults.max_delivery_retries),
            idempotency_ttl: parsed("IDEMPOTENCY_TTL_SECS")
                .get()
                .map(Duration::from_secs)
                .unwrap_or(defaults.idempotency_ttl),
            reconnect_delay: millis("RECONNECT_DELAY_MS", defaults.reconnect_delay),
            request_timeout: millis("REQUEST_TIMEOUT_MS", defaults.request_timeout),
            breaker_threshold: parsed("CIRCUIT_BREAKER_THRESHOLD")
                .get()
                .unwrap_or(defaults.breaker_threshold),
            breaker_reset_timeout: millis(
                "CIRCUIT_BREAKER_TIMEOUT_MS",
                defaults.breaker_reset_timeout,
            ),
            breaker_volume: parsed("CIRCUIT_BREAKER_VOLUME")
                .get()
                .unwrap_or(defaults.breaker_volume),
            retry_attempts: parsed("RETRY_ATTEMPTS").get().unwrap_or(defaults.retry_attempts),
            retry_delay: millis("RETRY_DELAY_MS", defaults.retry_delay),
            payment_success_rate: parsed("PAYMENT_SUCCESS_RATE")
                .get()
                .unwrap_or(defaults.payment_success_rate),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Consumer and outbox settings for the saga runtime.
    pub fn runtime(&self) -> RuntimeConfig {
        RuntimeConfig {
            prefetch: self.prefetch,
            max_retries: self.max_delivery_retries,
            reconnect_delay: self.reconnect_delay,
            ..RuntimeConfig::default()
        }
    }

    /// One TTL covers both client keys and consumed message ids.
    pub fn idempotency(&self) -> IdempotencyConfig {
        IdempotencyConfig {
            request_ttl: self.idempotency_ttl,
            message_ttl: self.idempotency_ttl,
            ..IdempotencyConfig::default()
        }
    }

    /// Breaker settings for calls to the auth service.
    pub fn circuit_breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            error_threshold_percentage: self.breaker_threshold,
            volume_threshold: self.breaker_volume,
            reset_timeout: self.breaker_reset_timeout,
            ..CircuitBreakerConfig::default()
        }
    }

    /// Retry settings for calls to the auth service.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, self.retry_delay)
    }
}

/// A raw variable parsed on demand into whatever type the field needs.
struct Parsed(Option<String>);

impl Parsed {
    fn get<T: FromStr>(self) -> Option<T> {
        self.0.and_then(|raw| raw.trim().parse().ok())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            api_tokens: HashSet::new(),
            require_auth: false,
            prefetch: 10,
            max_delivery_retries: 3,
            idempotency_ttl: Duration::from_secs(86_400),
            reconnect_delay: Duration::from_millis(5_000),
            request_timeout: Duration::from_millis(5_000),
            breaker_threshold: 50,
            breaker_reset_timeout: Duration::from_millis(30_000),
            breaker_volume: 5,
            retry_attempts: 3,
            retry_delay: Duration::from_millis(1_000),
            payment_success_rate: 0.5,
        }
    }
}

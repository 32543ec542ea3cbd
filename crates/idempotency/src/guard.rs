use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::KeyValueStore;

const REQUEST_PREFIX: &str = "idempotency:";
const MESSAGE_PREFIX: &str = "msg:";

/// Value held under a client key while its first request is still running.
const IN_PROGRESS: &str = "__in_progress__";

/// TTLs applied by the guard.
#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    /// How long a client idempotency key is honoured.
    pub request_ttl: Duration,
    /// How long a consumed message id is remembered.
    pub message_ttl: Duration,
    /// How long a reserved client key blocks duplicates before its result
    /// is recorded. Bounds the damage of a caller that dies mid-request.
    pub reservation_ttl: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            request_ttl: Duration::from_secs(86_400),
            message_ttl: Duration::from_secs(86_400),
            reservation_ttl: Duration::from_secs(60),
        }
    }
}

/// Outcome of looking up a client idempotency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyCheck<T> {
    /// The key was seen before; this is the result stored for it.
    Previous(T),
    /// Another request holds the key and has not finished yet.
    InProgress,
    /// The key was free and is now reserved for the caller.
    NotFound,
}

/// Duplicate suppression over a [`KeyValueStore`].
///
/// Every store failure fails open: a lookup that cannot be answered is
/// treated as "not seen", so an outage degrades to possible duplicate
/// processing rather than blocking the saga.
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn KeyValueStore>,
    config: IdempotencyConfig,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn KeyValueStore>, config: IdempotencyConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// Reserves a client key, or reports what already holds it.
    ///
    /// On `NotFound` the caller owns the key and must finish with
    /// [`mark_processed`](Self::mark_processed) or [`release`](Self::release).
    /// Concurrent callers with the same key see `InProgress` until then.
    pub async fn check_and_reserve<T: DeserializeOwned>(&self, key: &str) -> IdempotencyCheck<T> {
        let stored_key = format!("{REQUEST_PREFIX}{key}");
        match self
            .store
            .set_nx_ex(&stored_key, IN_PROGRESS, self.config.reservation_ttl)
            .await
        {
            Ok(true) => return IdempotencyCheck::NotFound,
            Ok(false) => {}
            Err(err) => {
                warn!(key, error = %err, "idempotency check failed, proceeding");
                return IdempotencyCheck::NotFound;
            }
        }

        match self.store.get(&stored_key).await {
            Ok(Some(raw)) if raw == IN_PROGRESS => {
                debug!(key, "idempotency key held by a running request");
                IdempotencyCheck::InProgress
            }
            Ok(Some(raw)) => self.parse_previous(key, &raw),
            // Expired between the two calls.
            Ok(None) => IdempotencyCheck::NotFound,
            Err(err) => {
                warn!(key, error = %err, "idempotency check failed, proceeding");
                IdempotencyCheck::NotFound
            }
        }
    }

    /// Reads the result stored for a client key without reserving it.
    pub async fn lookup<T: DeserializeOwned>(&self, key: &str) -> IdempotencyCheck<T> {
        match self.store.get(&format!("{REQUEST_PREFIX}{key}")).await {
            Ok(Some(raw)) if raw == IN_PROGRESS => IdempotencyCheck::InProgress,
            Ok(Some(raw)) => self.parse_previous(key, &raw),
            Ok(None) => IdempotencyCheck::NotFound,
            Err(err) => {
                warn!(key, error = %err, "idempotency lookup failed, proceeding");
                IdempotencyCheck::NotFound
            }
        }
    }

    fn parse_previous<T: DeserializeOwned>(&self, key: &str, raw: &str) -> IdempotencyCheck<T> {
        match serde_json::from_str::<T>(raw) {
            Ok(previous) => {
                debug!(key, "idempotency key hit");
                metrics::counter!("idempotency_hits_total", "kind" => "request").increment(1);
                IdempotencyCheck::Previous(previous)
            }
            Err(err) => {
                warn!(key, error = %err, "stored idempotency result unreadable, proceeding");
                IdempotencyCheck::NotFound
            }
        }
    }

    /// Frees a reserved client key so the request can be retried.
    pub async fn release(&self, key: &str) {
        if let Err(err) = self.store.delete(&format!("{REQUEST_PREFIX}{key}")).await {
            warn!(key, error = %err, "failed to release idempotency key");
        }
    }

    /// Stores `result` under a client key. Returns false if it could not be stored.
    pub async fn mark_processed<T: Serialize>(
        &self,
        key: &str,
        result: &T,
        ttl: Option<Duration>,
    ) -> bool {
        let raw = match serde_json::to_string(result) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(key, error = %err, "idempotency result not serializable");
                return false;
            }
        };
        let ttl = ttl.unwrap_or(self.config.request_ttl);
        match self
            .store
            .set_ex(&format!("{REQUEST_PREFIX}{key}"), &raw, ttl)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!(key, error = %err, "failed to record idempotency key");
                false
            }
        }
    }

    /// Claims a message id before its side effects run.
    ///
    /// Returns true if the caller should process the message, false if
    /// another delivery already claimed it. Store errors return true.
    pub async fn claim_message(&self, message_id: &str) -> bool {
        let key = format!("{MESSAGE_PREFIX}{message_id}");
        match self
            .store
            .set_nx_ex(&key, "1", self.config.message_ttl)
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                debug!(message_id, "message already processed, skipping");
                metrics::counter!("idempotency_hits_total", "kind" => "message").increment(1);
                false
            }
            Err(err) => {
                warn!(message_id, error = %err, "message claim failed, processing anyway");
                true
            }
        }
    }

    /// Drops a claim so a redelivery of a failed message is processed.
    pub async fn release_message(&self, message_id: &str) {
        if let Err(err) = self.store.delete(&format!("{MESSAGE_PREFIX}{message_id}")).await {
            warn!(message_id, error = %err, "failed to release message claim");
        }
    }

    pub async fn is_message_processed(&self, message_id: &str) -> bool {
        self.store
            .exists(&format!("{MESSAGE_PREFIX}{message_id}"))
            .await
            .unwrap_or(false)
    }

    /// Whether the backing store answers.
    pub async fn is_healthy(&self) -> bool {
        self.store.ping().await.is_ok()
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};

/// Named breakers, one per outbound dependency, created on first use.
pub struct CircuitBreakerRegistry {
    defaults: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            defaults,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the breaker for `name`, creating it with the default config.
    pub async fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breaker_with(name, self.defaults.clone()).await
    }

    /// Returns the breaker for `name`; `config` only applies on creation.
    pub async fn breaker_with(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().await.get(name) {
            return existing.clone();
        }

        let mut breakers = self.breakers.write().await;
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    /// Snapshots of every breaker, ordered by name.
    pub async fn status(&self) -> Vec<CircuitSnapshot> {
        let breakers = self.breakers.read().await;
        let mut snapshots: Vec<_> = breakers.values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub async fn any_open(&self) -> bool {
        self.breakers
            .read()
            .await
            .values()
            .any(|b| b.state() == CircuitState::Open)
    }

    /// Drops every breaker. Callers holding an `Arc` keep theirs.
    pub async fn shutdown(&self) {
        let mut breakers = self.breakers.write().await;
        info!(count = breakers.len(), "Shutting down circuit breakers");
        breakers.clear();
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

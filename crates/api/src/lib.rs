//! HTTP intake API for the order saga.
//!
//! Provides REST endpoints to place, cancel and inspect orders, with bearer
//! authentication through the resilience layer, correlation ids on every
//! response, structured logging (tracing) and Prometheus metrics.

pub mod auth;
pub mod config;
pub mod error;
pub mod middleware;
pub mod routes;

use std::sync::Arc;
use std::time::Instant;

use analytics::{AnalyticsProcessor, RealtimeMetrics};
use axum::Router;
use axum::routing::{get, post};
use idempotency::{IdempotencyGuard, InMemoryKeyValueStore};
use messaging::{BestEffortSink, Broker, DurablePublisher, StreamingSink};
use metrics_exporter_prometheus::PrometheusHandle;
use resilience::{CircuitBreakerRegistry, ResilientCaller};
use saga::{
    Notifier, OrderSagaCoordinator, PaymentGateway, SagaDependencies, SagaError, SagaRuntime,
};
use store::SagaStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use auth::{AUTH_SERVICE, Authenticator, CredentialValidator};
use config::Config;

/// Shared application state accessible from all handlers.
pub struct AppState<S> {
    pub coordinator: Arc<OrderSagaCoordinator<S>>,
    pub broker: Broker,
    pub publisher: DurablePublisher,
    pub guard: IdempotencyGuard,
    pub breakers: CircuitBreakerRegistry,
    pub realtime: RealtimeMetrics,
    pub started_at: Instant,
}

/// External systems the service talks to.
pub struct Collaborators {
    pub gateway: Arc<dyn PaymentGateway>,
    pub notifier: Arc<dyn Notifier>,
    pub validator: Arc<dyn CredentialValidator>,
}

/// Everything running behind the HTTP surface.
pub struct Services<S> {
    pub state: Arc<AppState<S>>,
    pub auth: Arc<Authenticator>,
    runtime: SagaRuntime<S>,
    analytics: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl<S: SagaStore + Clone + 'static> Services<S> {
    /// Starts the saga consumers and the analytics projection over `store`.
    pub async fn start(
        store: S,
        config: &Config,
        collaborators: Collaborators,
    ) -> Result<Self, SagaError> {
        let Collaborators {
            gateway,
            notifier,
            validator,
        } = collaborators;

        let broker = Broker::new();
        let guard = IdempotencyGuard::new(
            Arc::new(InMemoryKeyValueStore::new()),
            config.idempotency(),
        );

        let stream = StreamingSink::default();
        let realtime = RealtimeMetrics::new();
        let mut processor = AnalyticsProcessor::new();
        processor.register(Arc::new(realtime.clone()));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let analytics = processor.spawn(stream.subscribe(), shutdown_rx);

        let runtime = SagaRuntime::start(
            SagaDependencies {
                store,
                broker: broker.clone(),
                guard: guard.clone(),
                analytics: BestEffortSink::new(Arc::new(stream)),
                gateway,
                notifier,
            },
            config.runtime(),
        )
        .await?;

        let breakers = CircuitBreakerRegistry::new(config.circuit_breaker());
        let caller = ResilientCaller::new(
            breakers.breaker(AUTH_SERVICE).await,
            config.retry_policy(),
            config.request_timeout,
        );
        let auth = Arc::new(Authenticator::new(
            config.require_auth,
            config.api_tokens.clone(),
            validator,
            caller,
        ));

        let state = Arc::new(AppState {
            coordinator: runtime.coordinator().clone(),
            broker,
            publisher: runtime.publisher().clone(),
            guard,
            breakers,
            realtime,
            started_at: Instant::now(),
        });

        Ok(Self {
            state,
            auth,
            runtime,
            analytics,
            shutdown,
        })
    }

    /// The HTTP application over these services.
    pub fn router(&self, metrics_handle: PrometheusHandle) -> Router {
        create_app(self.state.clone(), self.auth.clone(), metrics_handle)
    }

    /// Drains the saga consumers first so their last analytics records are
    /// still projected, then stops the projection.
    pub async fn shutdown(self) {
        self.runtime.shutdown().await;
        let _ = self.shutdown.send(true);
        let _ = self.analytics.await;
        self.state.breakers.shutdown().await;
    }
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: SagaStore + Clone + 'static>(
    state: Arc<AppState<S>>,
    auth: Arc<Authenticator>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get::<S>))
        .with_state(Arc::new(routes::metrics::MetricsState {
            handle: metrics_handle,
            app: state.clone(),
        }));

    let orders = Router::new()
        .route("/orders", post(routes::orders::create::<S>))
        .route("/orders/{id}", get(routes::orders::get::<S>))
        .route("/orders/{id}/cancel", post(routes::orders::cancel::<S>))
        .route(
            "/orders/correlation/{correlation_id}",
            get(routes::orders::by_correlation::<S>),
        )
        .route_layer(axum::middleware::from_fn_with_state(
            auth,
            middleware::authenticate,
        ))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(routes::health::check::<S>))
        .route(
            "/health/circuit-breakers",
            get(routes::health::circuit_breakers::<S>),
        )
        .route("/analytics/realtime", get(routes::analytics::realtime::<S>))
        .with_state(state)
        .merge(orders)
        .merge(metrics_router)
        .layer(axum::middleware::from_fn(middleware::correlation_id))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

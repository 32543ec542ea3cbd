//! API server entry point.

use std::sync::Arc;

use api::auth::DenyAllValidator;
use api::config::{Config, LogFormat};
use api::{Collaborators, Services};
use common::Money;
use domain::Product;
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{LoggingNotifier, RandomGateway};
use store::{InMemoryStore, InventoryRepository, PostgresStore, SagaStore};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

/// A few products so the in-memory store can take orders out of the box.
async fn seed_demo_catalog(store: &InMemoryStore) {
    let catalog = [
        ("SKU-KEYBOARD", "Mechanical keyboard", 8_999, 25),
        ("SKU-MOUSE", "Wireless mouse", 2_499, 50),
        ("SKU-MONITOR", "27\" monitor", 27_900, 5),
    ];
    for (sku, name, price, stock) in catalog {
        let product = Product::new(sku, name, Money::from_cents(price), stock);
        store
            .upsert_product(&product)
            .await
            .expect("failed to seed catalog");
        tracing::info!(product_id = %product.id, sku, stock, "seeded product");
    }
}

async fn serve<S: SagaStore + Clone + 'static>(
    store: S,
    config: &Config,
    metrics_handle: PrometheusHandle,
) {
    let collaborators = Collaborators {
        gateway: Arc::new(RandomGateway::new(config.payment_success_rate)),
        notifier: Arc::new(LoggingNotifier),
        validator: Arc::new(DenyAllValidator),
    };
    let services = Services::start(store, config, collaborators)
        .await
        .expect("failed to start saga runtime");
    let app = services.router(metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, require_auth = config.require_auth, "starting API server");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    services.shutdown().await;
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Pick the store and run
    match &config.database_url {
        Some(url) => {
            let store = PostgresStore::connect(url)
                .await
                .expect("failed to connect to database");
            store
                .run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!("using PostgreSQL store");
            serve(store, &config, metrics_handle).await;
        }
        None => {
            let store = InMemoryStore::new();
            seed_demo_catalog(&store).await;
            tracing::info!("DATABASE_URL not set, using in-memory store");
            serve(store, &config, metrics_handle).await;
        }
    }

    tracing::info!("server shut down gracefully");
}

use polyspack_payments::api;
use polyspack_payments::config::AppConfig;
use polyspack_payments::database;
use polyspack_payments::database::order_repository::OrderRepository;
use polyspack_payments::database::payment_repository::PaymentRepository;
use polyspack_payments::logging::init_tracing;
use polyspack_payments::mpesa::DarajaClient;
use polyspack_payments::services::payment_flow::PaymentService;
use polyspack_payments::state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().map_err(|e| anyhow::anyhow!("configuration: {}", e))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("configuration: {}", e))?;

    init_tracing(&config.logging);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = ?config.mpesa.environment,
        "🚀 Starting Polyspack payments service"
    );

    info!("📊 Initializing database connection pool...");
    let pool = database::init_pool_from_config(&config.database)
        .await
        .map_err(|e| {
            error!("Failed to initialize database pool: {}", e);
            anyhow::anyhow!(e)
        })?;
    info!("✅ Database connection pool initialized");

    let gateway = Arc::new(
        DarajaClient::new(config.mpesa.clone())
            .map_err(|e| anyhow::anyhow!("gateway client: {}", e))?,
    );
    let payments = Arc::new(PaymentRepository::new(pool.clone()));
    let orders = Arc::new(OrderRepository::new(pool.clone()));
    let service = Arc::new(PaymentService::new(gateway, payments, orders));

    let state = AppState {
        payments: service,
        pool,
        jwt_secret: config.auth.jwt_secret.clone(),
    };

    info!("🛣️  Setting up application routes...");
    let app = api::router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("❌ Failed to bind to address {}: {}", addr, e);
        e
    })?;

    info!(address = %addr, "🚀 Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("👋 Server shutdown complete");
    Ok(())
}

use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use studio_pipeline::{
    app_state::AppState,
    config::AppConfig,
    db::{self, store::PgStore},
    routes,
    services::{fetch::HttpFetcher, provider::ReplicateClient, storage::R2Client},
    worker::PollLoop,
};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting generation worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe_metrics();

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Initializing services");
    let storage = R2Client::new(&config.r2_endpoint, &config.r2_access_key, &config.r2_secret_key)
        .expect("Failed to initialize R2 client");

    let provider = ReplicateClient::new(
        &config.provider_base_url,
        &config.provider_api_token,
        config.http_timeout(),
        config.provider_max_retries,
    )
    .expect("Failed to initialize provider client");

    let fetcher = HttpFetcher::new(config.http_timeout()).expect("Failed to initialize HTTP fetcher");

    let store = Arc::new(PgStore::new(db_pool));
    let state = AppState::new(
        store.clone(),
        store.clone(),
        store,
        Arc::new(storage),
        Arc::new(provider),
        Arc::new(fetcher),
        config.pipeline_settings(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Operational endpoints
    let ops = Router::new()
        .route("/health", get(routes::health::health_check))
        .with_state(state.clone())
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.ops_bind_addr)
        .await
        .expect("Failed to bind ops address");
    tracing::info!("Ops endpoints listening on {}", config.ops_bind_addr);

    let mut ops_shutdown = shutdown_rx.clone();
    let ops_server = tokio::spawn(async move {
        let result = axum::serve(listener, ops)
            .with_graceful_shutdown(async move {
                let _ = ops_shutdown.wait_for(|stop| *stop).await;
            })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "Ops server error");
        }
    });

    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received, finishing current job");
        let _ = shutdown_tx.send(true);
    });

    let poll_loop = PollLoop::new(state);
    tracing::info!(worker_id = %poll_loop.worker_id(), "Worker ready, starting job processing loop");
    poll_loop.run(shutdown_rx).await;

    let _ = ops_server.await;
    tracing::info!("Worker stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

use anyhow::{Context, Result};
use compression_service::{
    api::{start_api_server, AppState},
    asset_store::build_asset_store,
    config::Config,
    detector::GeminiDetector,
    image_store::PgImageStore,
    orchestrator::UploadPipeline,
    rate_limit::{spawn_sweeper, RateLimiter, SlidingWindowLimiter},
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        environment = config.service.environment.as_str(),
        "Starting compression service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // The service is useless without its database
    let image_store = match PgImageStore::connect_with_retry(&config.database).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            let error = format!("{e:#}");
            error!(error = %error, "Could not connect to PostgreSQL, exiting");
            std::process::exit(1);
        }
    };

    // Run migrations if enabled
    if config.database.run_migrations {
        image_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let detector = Arc::new(
        GeminiDetector::new(&config.detector).context("Failed to initialize region detector")?,
    );

    let assets = build_asset_store(&config.asset_store)
        .await
        .context("Failed to initialize asset store")?;

    let pipeline = Arc::new(UploadPipeline::new(
        detector,
        assets,
        image_store.clone(),
        config.api.max_upload_bytes,
    ));

    let (limiter, sweeper_handle) = if config.rate_limit_enabled() {
        let limiter = Arc::new(SlidingWindowLimiter::new(
            config.api.rate_limit.max_requests,
            config.rate_limit_window(),
        ));
        let handle = spawn_sweeper(limiter.clone());
        (Some(limiter as Arc<dyn RateLimiter>), Some(handle))
    } else {
        (None, None)
    };

    let api_state = AppState::new(pipeline, config.service.environment);

    info!("Compression service started successfully");

    // Serve until a shutdown signal arrives, letting in-flight requests finish
    if let Err(e) = start_api_server(api_state, &config.api, limiter, shutdown_signal()).await {
        let error = format!("{e:#}");
        error!(error = %error, "API server error");
    }

    info!("Shutting down compression service");

    if let Some(handle) = sweeper_handle {
        handle.abort();
    }

    image_store.close().await;

    info!("Compression service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

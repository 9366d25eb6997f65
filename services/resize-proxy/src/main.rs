use anyhow::{Context, Result};
use resize_proxy::config::Config;
use resize_proxy::server::{start_server, AppState};
use resize_proxy::{HttpOrigin, Interceptor, S3Store, Transcoder, WriteBackQueue};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        origin = %config.origin.url,
        "Starting resize proxy"
    );

    if config.service.metrics_port != 0 {
        init_metrics(config.service.metrics_port)?;
    }

    let origin = Arc::new(HttpOrigin::new(&config.origin)?);
    let transcoder = Transcoder::new(config.resize_filter()?);

    let origin_base = config.origin_url()?;

    let write_back = if config.write_back.enabled {
        let store = Arc::new(
            S3Store::new(&config.s3, &origin_base)
                .await
                .context("Failed to initialize S3 store")?,
        );
        Some(WriteBackQueue::start(store, &config.write_back))
    } else {
        warn!("Write-back disabled, variants will be recomputed on every request");
        None
    };

    let state = AppState {
        interceptor: Arc::new(Interceptor::new(
            origin,
            transcoder,
            write_back.as_ref().map(WriteBackQueue::handle),
        )),
        origin_base,
        max_request_body_bytes: config.api.max_request_body_bytes,
    };

    start_server(state, &config.api, shutdown_signal()).await?;

    info!("Shutting down resize proxy");

    if let Some(queue) = write_back {
        queue.shutdown(config.shutdown_timeout()).await;
    }

    info!("Resize proxy stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

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
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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

//! Canvas Operator - lifecycle and capacity manager for SD multiplayer canvases
//!
//! Watches `SDMultiplayer` instances in one namespace, keeps their derived
//! resources converged and scales each backend with its load.

use anyhow::Result;
use canvas_operator::{api, config::OperatorConfig};
use operator_lib::{
    Controller, EventWatcher, HealthRegistry, JobMetricsSource, KubeCluster, OperatorMetrics,
    PrometheusJobSource, StaticJobSource, StructuredLogger,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const OPERATOR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = OperatorConfig::load()?;
    info!(namespace = %config.namespace, "Operator configured");

    let health_registry = HealthRegistry::new();

    let metrics = OperatorMetrics::new();
    let logger = StructuredLogger::new(&config.namespace);
    logger.log_startup(OPERATOR_VERSION);

    let client = kube::Client::try_default().await?;
    let cluster = Arc::new(
        KubeCluster::new(client, &config.namespace).with_watch_timeout(config.watch_timeout_secs),
    );

    let jobs: Arc<dyn JobMetricsSource> = match &config.prometheus_url {
        Some(url) => {
            info!(url = %url, "Using Prometheus for job metrics");
            Arc::new(PrometheusJobSource::new(url)?)
        }
        None => Arc::new(StaticJobSource::default()),
    };

    let controller = Arc::new(Controller::new(
        cluster.clone(),
        jobs,
        config.monitor_config(),
        health_registry.clone(),
    ));
    let watcher = EventWatcher::new(
        cluster,
        controller.clone(),
        config.watcher_config(),
        health_registry.clone(),
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let app_state = Arc::new(api::AppState::new(health_registry, metrics));
    let api_handle = tokio::spawn(api::serve(
        config.api_port,
        app_state,
        shutdown_tx.subscribe(),
    ));
    let watcher_handle = tokio::spawn(watcher.run(shutdown_rx));

    let reason = shutdown_signal().await;
    logger.log_shutdown(reason);

    let _ = shutdown_tx.send(());
    if let Err(e) = watcher_handle.await {
        warn!(error = %e, "Watcher task ended abnormally");
    }
    controller.shutdown().await;
    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "Probe server failed"),
        Err(e) => warn!(error = %e, "Probe server task ended abnormally"),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT received",
        _ = terminate => "SIGTERM received",
    }
}

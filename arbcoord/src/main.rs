mod http;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};

use arbcoord_cluster::broker::RedisBroker;
use arbcoord_cluster::{Coordinator, Dependencies, WebhookNotifier};
use arbcoord_core::config::Config;
use arbcoord_core::logging;
use arbcoord_core::metrics::SystemMetrics;

#[derive(Debug, Parser)]
#[command(name = "arbcoord", about = "Arbitrage coordinator control plane")]
struct Args {
    /// Path to a configuration file (TOML/YAML/JSON)
    #[arg(short, long, env = "ARBCOORD_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration; invalid config aborts start
    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("config error: {e}");
        }
        anyhow::bail!("invalid configuration ({} errors)", errors.len());
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("ArbCoord coordinator starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Wire dependencies
    let broker = Arc::new(RedisBroker::new(&config.redis.url)?);
    let notifier = Arc::new(WebhookNotifier::new(
        &config.alerts.discord_webhook_url,
        &config.alerts.slack_webhook_url,
    ));
    let metrics = Arc::new(SystemMetrics::new());
    let http_address = config.http_address();

    let coordinator = Arc::new(Coordinator::new(Dependencies {
        broker,
        notifier,
        config,
        metrics,
    }));
    info!(instance_id = %coordinator.instance_id(), "Instance identity resolved");

    // 4. Start the coordinator core
    coordinator.start().await.context("Coordinator start failed")?;

    // 5. Bind the HTTP surface last, per the start sequence
    let listener = tokio::net::TcpListener::bind(&http_address)
        .await
        .with_context(|| format!("Failed to bind {http_address}"))?;
    let app = http::router(coordinator.clone());

    let shutdown_coordinator = coordinator.clone();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, stopping coordinator");
        shutdown_coordinator.stop().await;
    });

    if let Err(e) = serve.await {
        error!(error = %e, "HTTP server error");
        coordinator.stop().await;
        return Err(e.into());
    }

    info!("ArbCoord coordinator stopped");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

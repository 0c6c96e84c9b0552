use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use reload_relay::abuse::spawn_abuse_sweep;
use reload_relay::admission;
use reload_relay::config::{CliArgs, Config};
use reload_relay::state::AppState;
use reload_relay::token_bucket::spawn_bucket_sweep;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli_args = CliArgs::parse();
    let config = Config::load(&cli_args).context("Failed to load configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        bind_addr = %config.bind_addr,
        max_connections = config.max_connections,
        rate_limit = config.rate_limit_enabled,
        "starting reload relay"
    );

    let (state, hub) = AppState::new(&config);
    let hub_handle = state.hub.clone();
    let hub_task = tokio::spawn(hub.run());

    // Background sweeps stop when the shutdown flag flips
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let bucket_sweep = spawn_bucket_sweep(
        Arc::clone(state.abuse_guard.limiter().limiter()),
        Duration::from_secs(config.bucket_sweep_interval_secs),
        Duration::from_secs(config.bucket_idle_secs),
        shutdown_rx.clone(),
    );
    let abuse_sweep = spawn_abuse_sweep(
        Arc::clone(&state.abuse_guard),
        Duration::from_secs(config.abuse_sweep_interval_secs),
        shutdown_rx,
    );

    let app = admission::router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    // Drain: close every client with a going-away frame, stop the sweeps
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    if let Err(err) = hub_handle
        .shutdown(Duration::from_secs(config.shutdown_grace_secs))
        .await
    {
        error!(error = %err, "hub did not drain before the deadline");
    }
    let _ = hub_task.await;
    let _ = bucket_sweep.await;
    let _ = abuse_sweep.await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        // Without a signal handler, park forever rather than exit early
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;

use prox_road::{
    cli::{self, Cli, Commands},
    config::ServerConfig,
    telemetry::Telemetry,
    AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let telemetry = Telemetry::init()?;

    if let Some(Commands::Probe {
        url,
        public_key,
        list,
        listen_secs,
    }) = cli.command
    {
        return cli::run_probe_client(url, public_key, list, listen_secs).await;
    }

    let config = ServerConfig::try_from(cli.serve)?;
    info!(
        listen_addr = %config.listen_addr,
        probe_interval_secs = config.liveness.probe_interval.as_secs(),
        dead_after_secs = config.liveness.dead_after.as_secs(),
        "starting prox-road"
    );

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let state = AppState::new(Some(telemetry.metrics_handle()));

    prox_road::serve(listener, state, config.liveness, shutdown_signal()).await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; waiting for grace period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

mod config;
mod error;
mod logging;
mod slave;
mod supervisor;
mod tasks;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, ConfigSource};
use crate::error::SupervisorError;
use crate::slave::{Dispatcher, RegisterStore};
use crate::supervisor::{RetryPolicy, Supervisor, SupervisorConfig};
use crate::tasks::HEALTH_INTERVAL;
use crate::transport::TcpTransport;

/// Modbus TCP slave simulator.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the JSON configuration file; created with defaults if missing.
    #[arg(short, long, env = "MODBUS_SIM_CONFIG", default_value = "config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (config, source) = Config::load_or_create(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;
    config.validate()?;

    let _log_guard = logging::init(&config.logging)?;

    if source == ConfigSource::CreatedDefaults {
        info!(
            config = %args.config.display(),
            "Config file not found, created with defaults - edit it and restart to customize settings"
        );
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "Starting Modbus server"
    );

    let store = Arc::new(RegisterStore::new(&config.modbus)?);
    let dispatcher = Dispatcher::new(store);
    let transport = TcpTransport::new(
        config.server.bind_address(),
        config.server.max_clients,
        config.server.idle_timeout(),
        dispatcher.clone(),
    );

    let cancel = CancellationToken::new();
    let supervisor_config = SupervisorConfig {
        retry: RetryPolicy {
            max_attempts: config.server.max_retries,
            delay: config.server.retry_delay(),
        },
        counter_interval: config.modbus.update_interval(),
        health_interval: HEALTH_INTERVAL,
        shutdown_timeout: config.server.shutdown_timeout(),
    };
    let supervisor = Supervisor::new(transport, dispatcher, supervisor_config, cancel.clone());

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(err) => error!(error = %err, "Failed to listen for shutdown signals"),
        }
        signal_cancel.cancel();
    });

    match supervisor.run().await {
        Ok(()) => {}
        Err(SupervisorError::Cancelled) => warn!("Shutdown requested during startup"),
        Err(err @ SupervisorError::StartFailed { .. }) => {
            error!(error = %err, "Failed to start server");
            return Err(err.into());
        }
        Err(err) => {
            error!(error = %err, "Error during shutdown");
            return Err(err.into());
        }
    }

    info!("Server stopped successfully");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use btleplug::api::Manager as _;
use btleplug::platform::Manager as BleManager;
use clap::Parser;
use log::{LevelFilter, error, info, warn};

mod cancel;
mod config;
mod gate;
mod manager;
mod messages;
mod relay;
mod sensor;
mod sink;
mod status;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Relays heart rate from a BLE sensor to OSC, gated by a UDP presence signal.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the TOML config file (defaults to ./config.toml if present).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Where gated samples go.
    #[arg(short, long, value_enum, default_value_t = sink::OutputMode::Osc)]
    output: sink::OutputMode,

    /// Override `[status] port`.
    #[arg(long)]
    status_port: Option<u16>,

    /// Override `[sensor] name_filter`.
    #[arg(long)]
    name_filter: Option<String>,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<config::AppConfig> {
    let path = match path {
        Some(path) => path,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => Path::new(DEFAULT_CONFIG_PATH),
        None => {
            info!("No {DEFAULT_CONFIG_PATH} found, using defaults");
            return Ok(config::AppConfig::default());
        }
    };

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Reading config file {}", path.display()))?;
    toml::de::from_str(&contents).with_context(|| format!("Parsing config file {}", path.display()))
}

/// Fires `shutdown` on the first Ctrl-C or SIGTERM. Later signals are only logged.
async fn watch_signals(shutdown: cancel::Canceller) {
    loop {
        if let Err(err) = wait_for_signal().await {
            error!("Unable to listen for shutdown signals: {err}");
            // Keep the canceller alive; dropping it would stop the relay.
            std::future::pending::<()>().await;
        }
        if shutdown.cancel() {
            info!("Received exit signal");
        } else {
            warn!("Shutdown already in progress");
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => Some(terminate),
        Err(err) => {
            warn!("Unable to listen for SIGTERM, only Ctrl-C will stop the relay: {err}");
            None
        }
    };
    first_signal(
        tokio::signal::ctrl_c(),
        terminate.map(|mut terminate| async move {
            terminate.recv().await;
        }),
    )
    .await
}

/// Resolves on `interrupt`, or on `terminate` when that handler is available.
#[cfg(unix)]
async fn first_signal(
    interrupt: impl Future<Output = std::io::Result<()>>,
    terminate: Option<impl Future<Output = ()>>,
) -> std::io::Result<()> {
    match terminate {
        Some(terminate) => tokio::select! {
            result = interrupt => result,
            _ = terminate => Ok(()),
        },
        None => interrupt.await,
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::formatted_timed_builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(port) = cli.status_port {
        config.status.port = Some(port);
    }
    if let Some(name_filter) = cli.name_filter {
        config.sensor.name_filter = Some(name_filter);
    }

    let sink = sink::build(cli.output, &config.osc)?;

    let (shutdown, token) = cancel::pair();
    tokio::spawn(watch_signals(shutdown));

    let bt_manager = BleManager::new().await.context("Opening Bluetooth manager")?;
    let adapter = bt_manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;

    let core = manager::Manager::new(&config.status, &config.osc, sink);
    let result = core
        .run_loop(
            |cancel| sensor::discover(&adapter, &config.sensor, cancel),
            token,
        )
        .await;

    match &result {
        Ok(()) => info!("Program exited gracefully"),
        Err(err) => error!("{err:#}"),
    }
    result
}

#[cfg(all(test, unix))]
mod tests {
    use std::future::{pending, ready};

    use super::*;

    #[tokio::test]
    async fn test_interrupt_alone_without_terminate_handler() {
        let result = first_signal(ready(Ok(())), None::<std::future::Pending<()>>).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_terminate_stops_waiting() {
        let result = first_signal(pending(), Some(ready(()))).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_interrupt_error_is_reported() {
        let result = first_signal(
            ready(Err(std::io::Error::other("no handler"))),
            None::<std::future::Pending<()>>,
        )
        .await;
        assert!(result.is_err());
    }
}

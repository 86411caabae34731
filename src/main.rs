//! Hub Telemetry - Main Entry Point
//!
//! Loads the device configuration, connects to the broker and publishes simulated
//! telemetry until interrupted.

use clap::{Parser, Subcommand};
use hub_telemetry::client::{ClientSnapshot, TelemetryClient, TokioScheduler};
use hub_telemetry::config::ClientConfig;
use hub_telemetry::observability::init_default_logging;
use hub_telemetry::transport::mqtt::MqttSession;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{error, info, warn};

/// How long to wait for the broker to acknowledge CONNECT
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// How long to wait for the link to close on shutdown
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Device telemetry client for cloud MQTT brokers
#[derive(Parser)]
#[command(name = "hub-telemetry")]
#[command(about = "Publish simulated device telemetry to a cloud MQTT broker")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "HUB_TELEMETRY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and publish telemetry until interrupted
    Run {
        /// Publish interval in seconds, overrides the configuration
        #[arg(long, value_name = "SECS")]
        interval: Option<u64>,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting hub-telemetry v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { interval } => run_client(config, interval).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: Option<&std::path::Path>,
) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(ClientConfig::load_from_file(path)?);
    }

    for candidate in ["device.toml", "config/device.toml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(ClientConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create device.toml".into())
}

async fn run_client(
    config: ClientConfig,
    interval_override: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let interval = match interval_override {
        Some(0) => return Err("--interval must be greater than zero".into()),
        Some(secs) => Duration::from_secs(secs),
        None => config.telemetry_interval(),
    };

    info!(
        device_id = %config.device.id,
        broker = %config.broker.url,
        "Client starting"
    );

    let credentials = config.credentials()?;
    let trust = config.load_trust_material()?;
    let (session, events) = MqttSession::configure(&config, &credentials, trust.as_ref())?;

    let scheduler = TokioScheduler::current().ok_or("no tokio runtime available")?;
    let client = TelemetryClient::new(&config, session, Arc::new(scheduler))?;
    let pump = client.attach_events(events);
    let reporter = tokio::spawn(report_snapshots(client.subscribe()));

    client.connect()?;
    client.wait_for_connection(CONNECT_TIMEOUT).await?;
    client.start_telemetry(interval)?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut changes = client.subscribe();

    info!(topic = %client.telemetry_topic(), "Publishing telemetry, press Ctrl-C to stop");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        _ = connection_lost(&mut changes) => {
            error!("Broker connection lost, shutting down...");
        }
    }

    if client.snapshot().is_connected {
        client.disconnect()?;
        if let Err(e) = client
            .wait_for_state(hub_telemetry::ConnectionState::Idle, DISCONNECT_TIMEOUT)
            .await
        {
            warn!("Link did not close cleanly: {}", e);
        }
    } else {
        client.stop_telemetry();
    }

    let summary = client.snapshot();
    info!(
        sent = summary.counters.messages_sent(),
        sent_ok = summary.counters.messages_sent_ok(),
        sent_failed = summary.counters.messages_sent_failed(),
        received = summary.counters.messages_received(),
        "Client stopped"
    );

    reporter.abort();
    drop(client);
    pump.abort();
    Ok(())
}

/// Resolves once the client is no longer connected
async fn connection_lost(changes: &mut watch::Receiver<ClientSnapshot>) {
    loop {
        if !changes.borrow_and_update().is_connected {
            return;
        }
        if changes.changed().await.is_err() {
            return;
        }
    }
}

/// Log every committed snapshot change
async fn report_snapshots(mut changes: watch::Receiver<ClientSnapshot>) {
    while changes.changed().await.is_ok() {
        let snapshot = changes.borrow_and_update().clone();
        info!(
            state = ?snapshot.state,
            sending = snapshot.is_sending_telemetry,
            sent = snapshot.counters.messages_sent(),
            received = snapshot.counters.messages_received(),
            last_message = %snapshot.last_telemetry_message(),
            "Client state"
        );
    }
}

fn handle_config_command(
    config: &ClientConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    config.endpoint()?;
    config.credentials()?;

    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

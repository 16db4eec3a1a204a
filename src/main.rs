use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use mockgate_server::{ServerConfig, ServerDeps};
use mockgate_settings::MockSettings;
use mockgate_store::{BypassConfigStore, PersistConfig, PresetQueue};
use mockgate_telemetry::TelemetryConfig;
use mockgate_upstream::HttpForwarder;

/// Mock chat-completions endpoint with preset, bypass, and manual modes.
#[derive(Debug, Parser)]
#[command(name = "mockgate", version)]
struct Cli {
    /// Settings file (defaults to `$MOCKGATE_SETTINGS` or `mockgate.json`).
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// Bind address, overriding the settings file.
    #[arg(long)]
    host: Option<String>,

    /// Listen port, overriding the settings file.
    #[arg(short, long)]
    port: Option<u16>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

fn load_settings(cli: &Cli) -> Result<MockSettings> {
    let mut settings = match &cli.settings {
        Some(path) => mockgate_settings::load_settings_from_path(path),
        None => mockgate_settings::load_settings(),
    }
    .context("Failed to load settings")?;

    if let Some(host) = &cli.host {
        settings.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if cli.json_logs {
        settings.logging.json = true;
    }
    Ok(settings)
}

fn telemetry_config(settings: &MockSettings) -> TelemetryConfig {
    TelemetryConfig {
        log_level: settings
            .logging
            .level
            .as_filter_str()
            .parse()
            .unwrap_or(tracing::Level::INFO),
        json: settings.logging.json,
        ..Default::default()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    mockgate_telemetry::init_telemetry(&telemetry_config(&settings))
        .context("Failed to initialize logging")?;

    tracing::info!("Starting mock server");

    let storage = &settings.storage;
    let presets = Arc::new(PresetQueue::open(PersistConfig {
        path: PathBuf::from(&storage.preset_queue_path),
        max_retries: storage.persist_max_retries,
        retry_delay: Duration::from_millis(storage.persist_retry_delay_ms),
    }));
    let bypass = Arc::new(BypassConfigStore::open(&storage.bypass_config_path));
    let forwarder = Arc::new(HttpForwarder::new().context("Failed to build HTTP client")?);

    let config = ServerConfig::from_settings(&settings);
    let handle = mockgate_server::start(
        config,
        ServerDeps {
            presets: Arc::clone(&presets),
            bypass,
            forwarder,
        },
    )
    .await
    .context("Failed to start server")?;

    tracing::info!(port = handle.port, "Mock server ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    tracing::info!("Shutting down");
    handle.shutdown().await;
    if let Err(e) = presets.flush().await {
        tracing::error!(error = %e, "Final preset flush failed");
    }
    Ok(())
}

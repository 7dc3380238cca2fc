use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use hisp_settings::{hisp_home, load_settings, load_settings_from_path};
use hisp_store::devices::DeviceRepo;
use hisp_store::Database;
use hisp_telemetry::{init_telemetry, TelemetryConfig};

/// Device presence and event delivery server.
#[derive(Debug, Parser)]
#[command(name = "hisp", version)]
struct Cli {
    /// Settings file (default: ~/.hisp/settings.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the listen port
    #[arg(long)]
    port: Option<u16>,

    /// Override the device database path
    #[arg(long)]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => load_settings_from_path(path),
        None => load_settings(),
    }
    .context("failed to load settings")?;
    if let Some(port) = cli.port {
        settings.server.port = port;
    }

    let home = hisp_home();
    let telemetry = init_telemetry(TelemetryConfig {
        filter: settings.logging.level.clone(),
        log_to_sqlite: settings.logging.log_to_sqlite,
        log_db_path: settings.logging.resolve_db_path(&home),
    });

    tracing::info!("Starting hisp server");

    let db_path = cli.db.unwrap_or_else(|| settings.database.resolve(&home));
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "Database opened");

    // Nothing is connected yet, so any flag still set is left over from a crash.
    let cleared = DeviceRepo::new(db.clone())
        .reset_presence()
        .context("failed to reset presence flags")?;
    if cleared > 0 {
        tracing::info!(cleared, "Cleared stale presence flags");
    }

    let config = hisp_server::ServerConfig::from_settings(&settings);
    let handle = hisp_server::start(config, db, telemetry.log_sink())
        .await
        .context("failed to start server")?;

    tracing::info!(port = handle.port, "hisp server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}

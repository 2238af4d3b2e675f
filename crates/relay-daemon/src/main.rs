//! # relay-daemon
//!
//! Relay server binary. Loads settings, installs logging and the metrics
//! recorder, and serves execution events over WebSocket until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use relay_core::logging::init_subscriber;
use relay_server::{
    JwtAuthenticator, OwnershipEntitlements, RealtimeConfig, RealtimeHub, RelayServer,
    ServerConfig,
};
use relay_settings::RelaySettings;
use tracing_subscriber::fmt::MakeWriter;

/// Real-time execution event relay.
#[derive(Parser, Debug)]
#[command(name = "relay-daemon", about = "Real-time execution event relay")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default `~/.relay/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Minimum log level (overrides settings; `RUST_LOG` still wins).
    #[arg(long)]
    log_level: Option<String>,
}

fn load_settings(cli: &Cli) -> Result<RelaySettings> {
    let mut settings = match &cli.config {
        Some(path) => relay_settings::load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => relay_settings::load_settings().context("Failed to load settings")?,
    };
    apply_cli_overrides(&mut settings, cli);
    Ok(settings)
}

fn apply_cli_overrides(settings: &mut RelaySettings, cli: &Cli) {
    if let Some(host) = &cli.host {
        settings.server.host.clone_from(host);
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if let Some(level) = &cli.log_level {
        settings.logging.level.clone_from(level);
    }
}

/// Run `f` with a warn-level subscriber writing to `make_writer` as the
/// thread default.
///
/// Settings loading reports ignored `RELAY_*` overrides before the
/// configured subscriber can be installed.
fn with_bootstrap_logging<T, W>(make_writer: W, f: impl FnOnce() -> T) -> T
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_ansi(false)
        .with_writer(make_writer)
        .finish();
    tracing::subscriber::with_default(subscriber, f)
}

/// Wire the hub and server from settings. Requires `auth.jwtSecret`.
fn build_server(settings: &RelaySettings) -> Result<RelayServer> {
    let Some(secret) = settings.auth.jwt_secret.as_deref().filter(|s| !s.is_empty()) else {
        bail!("auth.jwtSecret is not set (settings file or RELAY_JWT_SECRET)");
    };
    let authenticator = JwtAuthenticator::new(secret.as_bytes(), settings.auth.jwt_leeway_secs);

    let hub = RealtimeHub::new(
        RealtimeConfig::from_settings(settings),
        Arc::new(authenticator),
        Arc::new(OwnershipEntitlements::new()),
    );
    Ok(RelayServer::new(
        ServerConfig::from_settings(settings),
        Arc::new(hub),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = with_bootstrap_logging(std::io::stderr, || load_settings(&cli))?;
    init_subscriber(&settings.logging.level, settings.logging.format);

    let metrics = relay_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;
    let server = build_server(&settings)?.with_metrics(metrics);

    let handle = server.start().await.context("Failed to start server")?;
    tracing::info!(addr = %handle.addr, "relay listening on ws://{}", handle.addr);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    let closed = server
        .shutdown()
        .graceful_shutdown(server.hub(), handle.tasks, None)
        .await;
    tracing::info!(closed, "Shutdown complete");
    Ok(())
}

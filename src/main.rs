use std::sync::Arc;

use clap::Parser;
use color_eyre::Result;
use serial_harbor::{cli, config::Config, logging, registry::SessionRegistry, server};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

use tracing::{debug, error, info, warn};

#[cfg(unix)]
async fn hangup() {
    match signal(SignalKind::hangup()) {
        Ok(mut hangup) => {
            hangup.recv().await;
        }
        Err(e) => {
            warn!(%e, "Cannot listen for hangups");
            std::future::pending::<()>().await
        }
    }
}

#[cfg(not(unix))]
async fn hangup() {
    std::future::pending::<()>().await
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let mut cli = cli::Cli::parse();

    if let Some(command) = cli.command.take() {
        cli::handle_command(command)?;

        return Ok(());
    }

    let config = if let Some(config_path) = &cli.config {
        Config::new_from_path(config_path)?
    } else {
        Config::default()
    };
    let config = cli.apply_overrides(config);
    config.validate()?;

    let file_logging = config
        .log_dir
        .clone()
        .map(|dir| config.log_level().map(|level| (level, dir)))
        .transpose()?;
    logging::init(config.log_level()?, file_logging).await;
    debug!(?cli.config, "Configuration loaded");

    let registry = Arc::new(SessionRegistry::new(config.transport_settings()));
    let port = config.port;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C, quitting")
        }
        _ = hangup() => {
            info!("Told to hang up, quitting")
        }
        result = server::run_on_port(config, registry.clone(), port) => {
            error!(?result, "Server returned");
            registry.disconnect(None).await;
            logging::shutdown();
            return Err(color_eyre::eyre::eyre!("Server stopped unexpectedly"));
        }
    }

    registry.disconnect(None).await;
    info!("All sessions closed");

    logging::shutdown();

    Ok(())
}

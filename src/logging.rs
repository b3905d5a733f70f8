use std::path::PathBuf;

use tokio::sync::OnceCell;
use tracing::Level;
use tracing::{debug, info, metadata::LevelFilter, trace};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Name of the rolling log file (a date suffix is added per day).
pub const LOG_FILE_NAME: &str = "serial-harbor.log";

fn stdout_filter(level: Level) -> (EnvFilter, &'static str) {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, "RUST_LOG"),
        Err(_) => (
            EnvFilter::default().add_directive(LevelFilter::from(level).into()),
            "configured level",
        ),
    }
}

fn do_init(stdout_level: Level, file_logging: Option<(Level, PathBuf)>) {
    let (filter, filtered_by) = stdout_filter(stdout_level);
    let stdout = tracing_subscriber::fmt::layer().with_filter(filter);

    let log_dir = file_logging.as_ref().map(|(_, dir)| dir.clone());
    let file = file_logging.map(|(level, dir)| {
        tracing_subscriber::fmt::layer()
            .with_writer(RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_NAME))
            .with_ansi(false)
            .with_filter(LevelFilter::from(level))
    });

    if let Err(e) = tracing_subscriber::registry()
        .with(stdout)
        .with(file)
        .try_init()
    {
        eprintln!("Could not initialize logging: {e}");
        return;
    }

    debug!(filtered_by, ?log_dir, "Logging to stdout");
}

/// Set up stdout logging, plus a daily rolling file if `file_logging` names a directory.
///
/// Only the first call does anything, later calls (e.g. from several tests) are ignored.
pub async fn init(stdout_level: Level, file_logging: Option<(Level, PathBuf)>) {
    static LOGGING: OnceCell<()> = OnceCell::const_new();

    LOGGING
        .get_or_init(|| async move {
            do_init(stdout_level, file_logging);
            info!("Logging initialized");
        })
        .await;
}

/// Counterpart to [`init`], call before exiting.
pub fn shutdown() {
    trace!("Shutting down");
}

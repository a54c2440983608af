use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::NaiveDate;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, fmt};

use crate::error::{Error, Result};

/// `indra_YYYYMMDD.log` in the working directory.
pub fn default_log_file(today: NaiveDate) -> PathBuf {
    PathBuf::from(format!("indra_{}.log", today.format("%Y%m%d")))
}

/// Accepts the usual level names, case-insensitive, plus `warning` and `critical`.
pub fn parse_level(level: &str) -> Result<LevelFilter> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" | "warning" => Ok(LevelFilter::WARN),
        "error" | "critical" => Ok(LevelFilter::ERROR),
        "off" => Ok(LevelFilter::OFF),
        other => Err(Error::config(format!("unknown log level: {other}"))),
    }
}

/// Console plus append-only file logging at `level`.
pub fn init_logging(level: LevelFilter, log_file: &Path) -> Result<()> {
    let file = File::options()
        .create(true)
        .append(true)
        .open(log_file)
        .map_err(|e| Error::config(format!("cannot open log file {}: {e}", log_file.display())))?;

    let file_layer = fmt::layer()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_names(true)
        .with_filter(level);
    let stdout_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(false)
        .compact()
        .with_filter(level);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer)
        .try_init()
        .map_err(|e| Error::config(format!("cannot install logger: {e}")))
}

//! Logging setup
//!
//! Output goes to a file named `<log_path>.<YYYYmmdd-HHMMSS>` through a
//! non-blocking writer, and to stdout when `log_console` is set or no log
//! path is configured. `RUST_LOG` overrides the configured level.

use std::fs::OpenOptions;

use chrono::{DateTime, Local};
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use rtcpilot_core::LogConfig;

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("failed to open log file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid log level {0:?}")]
    Level(String),

    #[error("logging already initialized")]
    AlreadyInitialized,
}

/// Log file name for a process started at `started`
pub fn log_file_name(base: &str, started: DateTime<Local>) -> String {
    format!("{}.{}", base, started.format("%Y%m%d-%H%M%S"))
}

/// Filter from `RUST_LOG`, falling back to the configured level
pub fn env_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let level = match level.trim().to_ascii_lowercase().as_str() {
        "" => "info".to_string(),
        l @ ("trace" | "debug" | "info" | "warn" | "error") => l.to_string(),
        other => return Err(LoggingError::Level(other.to_string())),
    };
    EnvFilter::try_new(&level).map_err(|_| LoggingError::Level(level))
}

/// Install the global subscriber
///
/// Keep the returned guard alive for the life of the process or buffered
/// file output is lost.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>, LoggingError> {
    let filter = env_filter(&config.log_level)?;

    let (file_layer, guard) = if config.log_path.is_empty() {
        (None, None)
    } else {
        let path = log_file_name(&config.log_path, Local::now());
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| LoggingError::File {
                path: path.clone(),
                source,
            })?;
        let (writer, guard) = tracing_appender::non_blocking(file);
        let layer = fmt::layer().with_writer(writer).with_ansi(false);
        (Some(layer), Some(guard))
    };

    let console_layer = (config.log_console || config.log_path.is_empty())
        .then(|| fmt::layer().with_target(false));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_log_file_name() {
        let started = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 2).unwrap();
        assert_eq!(
            log_file_name("/var/log/rtcpilot.log", started),
            "/var/log/rtcpilot.log.20240309-070502"
        );
    }

    #[test]
    fn test_level_names() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        assert!(env_filter("info").is_ok());
        assert!(env_filter("DEBUG").is_ok());
        assert!(env_filter("").is_ok());
        assert!(matches!(env_filter("loud"), Err(LoggingError::Level(_))));
    }
}

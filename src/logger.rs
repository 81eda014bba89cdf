//! Logging setup using the tracing ecosystem.
//!
//! Output goes to stdout by default or to an append-mode file when a path is
//! configured. The configured [`LogLevel`] becomes the default tracing
//! filter; the `RUST_LOG` environment variable overrides it.

use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;
use crate::error::{Error, Result};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initializes the tracing subscriber.
///
/// Call once at startup; subsequent calls are no-ops. Tracing has no notice
/// level, so `Notice` maps to `info`.
///
/// # Errors
///
/// Returns [`Error::Io`] if the log file cannot be opened, or
/// [`Error::Config`] if a subscriber is already installed elsewhere.
pub fn init(level: LogLevel, logfile: Option<&str>) -> Result<()> {
    if LOGGER_INITIALIZED.get().is_some() {
        return Ok(());
    }

    let filter = match level {
        LogLevel::Debug => "debug",
        LogLevel::Info | LogLevel::Notice => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match logfile {
        None => {
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_ansi(true)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))?;
        }
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))?;
        }
    }

    LOGGER_INITIALIZED.get_or_init(|| ());
    Ok(())
}

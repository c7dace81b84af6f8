//! Daemon logging: console output plus a rolling `cmm.log` file.
//!
//! Defaults come from the environment:
//! - `CMM_LOG_DIR` - log directory (default `~/cmm/logs`)
//! - `CMM_LOG_CONSOLE` - console output on/off (default on)
//! - `CMM_LOG_FILE` - file logging on/off (default on)
//! - `CMM_LOG_LEVEL` - level for both sinks (default `info`)
//!
//! `RUST_LOG` overrides the level with a full filter directive when set.

use std::path::PathBuf;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_dir: PathBuf,
    pub console_output: bool,
    pub file_logging: bool,
    pub level: Level,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        Self {
            log_dir: PathBuf::from(format!("{home}/cmm/logs")),
            console_output: true,
            file_logging: true,
            level: Level::INFO,
        }
    }
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let log_dir = std::env::var("CMM_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.log_dir);
        let console_output = std::env::var("CMM_LOG_CONSOLE")
            .map(|v| v.to_lowercase() != "false" && v != "0")
            .unwrap_or(true);
        let file_logging = std::env::var("CMM_LOG_FILE")
            .map(|v| v.to_lowercase() != "false" && v != "0")
            .unwrap_or(true);
        let level = std::env::var("CMM_LOG_LEVEL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.level);
        Self {
            log_dir,
            console_output,
            file_logging,
            level,
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }
}

/// Keeps the non-blocking file writer alive; dropping it flushes buffered
/// output.
pub struct LoggingGuard {
    _file_guards: Vec<WorkerGuard>,
}

/// Install the global subscriber. Call once, early, and hold the guard for
/// the lifetime of the process.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<LoggingGuard> {
    let mut file_guards = Vec::new();
    let mut layers = Vec::new();

    if config.console_output {
        let layer = fmt::layer()
            .with_target(true)
            .with_filter(env_filter(config.level))
            .boxed();
        layers.push(layer);
    }

    if config.file_logging {
        std::fs::create_dir_all(&config.log_dir)?;
        let appender =
            RollingFileAppender::new(Rotation::DAILY, &config.log_dir, "cmm.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        file_guards.push(guard);
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true)
            .with_filter(env_filter(config.level))
            .boxed();
        layers.push(layer);
    }

    Registry::default().with(layers).init();
    Ok(LoggingGuard {
        _file_guards: file_guards,
    })
}

fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()))
}

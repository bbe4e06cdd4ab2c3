//! Logging setup using tracing.

use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log level configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Parse a log level from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// Where log lines are written.
#[derive(Debug, Clone, Default)]
pub enum LogTarget {
    /// Human-readable lines on stdout.
    #[default]
    Stdout,
    /// Stderr, for processes whose stdout is a protocol channel.
    Stderr,
    /// Append to a file, without ANSI colors.
    File(PathBuf),
}

/// Logging configuration.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub target: LogTarget,
    /// Whether to include file/line info in logs.
    pub include_location: bool,
}

/// Build the filter directive for a level.
///
/// HTTP client internals are kept at `warn` unless the level is `trace`.
pub fn filter_directive(level: LogLevel) -> String {
    match level {
        LogLevel::Trace => "trace".to_string(),
        other => format!(
            "{},hyper=warn,reqwest=warn,h2=warn,tower_http=info",
            other.as_str()
        ),
    }
}

/// Initialize logging with the given configuration.
///
/// `RUST_LOG` takes precedence over the configured level. Safe to call more
/// than once; later calls are ignored.
pub fn init(config: LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(config.level)));

    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.target {
        LogTarget::Stdout => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .try_init(),
        LogTarget::Stderr => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false)
                    .with_target(true),
            )
            .try_init(),
        LogTarget::File(path) => {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
            {
                Ok(file) => registry
                    .with(
                        fmt::layer()
                            .with_writer(std::sync::Mutex::new(file))
                            .with_ansi(false)
                            .with_target(true),
                    )
                    .try_init(),
                Err(_) => registry
                    .with(fmt::layer().with_writer(std::io::stderr).with_ansi(false))
                    .try_init(),
            }
        }
    };

    // A subscriber may already be installed (tests, embedding).
    let _ = result;
}

/// Get the default log file path.
pub fn default_log_path() -> Option<PathBuf> {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .map(|p| p.join("agentbox").join("logs").join("agentbox.log"))
}

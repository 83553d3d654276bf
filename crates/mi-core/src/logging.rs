//! Tracing subscriber setup.
//!
//! Binaries call [`init`] once at startup with the `[logging]` section of their
//! configuration. `RUST_LOG`, when set, takes precedence over the configured level.
//!
//! # Example
//! ```no_run
//! use mi_core::logging::{self, LoggingConfig, OutputFormat};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LoggingConfig {
//!     level: "debug".into(),
//!     format: OutputFormat::Json,
//!     ..Default::default()
//! };
//! logging::init(&config)?;
//! tracing::info!(instrument = "sbe43", "Console started");
//! # Ok(())
//! # }
//! ```

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line, colored (development)
    #[default]
    Pretty,
    /// Single-line, uncolored
    Compact,
    /// One JSON object per line (log aggregation)
    Json,
}

/// `[logging]` configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    #[serde(default = "default_level")]
    pub level: String,
    /// Line format
    #[serde(default)]
    pub format: OutputFormat,
    /// ANSI colors for the pretty format
    #[serde(default = "default_true")]
    pub ansi: bool,
    /// Include source file and line number
    #[serde(default)]
    pub file_and_line: bool,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: OutputFormat::default(),
            ansi: true,
            file_and_line: false,
        }
    }
}

/// Installs the global subscriber.
///
/// Idempotent: if a subscriber is already installed (tests, embedding hosts) this
/// returns `Ok(())`.
pub fn init(config: &LoggingConfig) -> ProtocolResult<()> {
    let level = parse_log_level(&config.level)?;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(config.file_and_line)
            .with_line_number(config.file_and_line)
            .with_ansi(config.ansi)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_file(config.file_and_line)
            .with_line_number(config.file_and_line)
            .with_ansi(false)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_file(config.file_and_line)
            .with_line_number(config.file_and_line)
            .boxed(),
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(layer.with_filter(env_filter))
        .try_init()
    {
        tracing::debug!(error = %e, "Tracing subscriber already installed, keeping it");
    }
    Ok(())
}

/// Parses a log level name, case-insensitive.
pub fn parse_log_level(level: &str) -> ProtocolResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(ProtocolError::Configuration(format!(
            "invalid log level '{level}', must be one of: trace, debug, info, warn, error"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("WARN"), Ok(Level::WARN)));
        assert!(matches!(parse_log_level("Debug"), Ok(Level::DEBUG)));
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: LoggingConfig = toml::from_str("format = \"json\"").unwrap();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, OutputFormat::Json);
        assert!(config.ansi);
    }

    #[test]
    fn init_rejects_unknown_level() {
        let config = LoggingConfig {
            level: "loud".into(),
            ..Default::default()
        };
        assert!(matches!(init(&config), Err(ProtocolError::Configuration(_))));
    }

    #[test]
    fn init_twice_keeps_first_subscriber() {
        let config = LoggingConfig {
            format: OutputFormat::Compact,
            ..Default::default()
        };
        init(&config).unwrap();
        init(&LoggingConfig::default()).unwrap();
    }
}

//! Tracing subscriber setup.
//!
//! Library code only emits `tracing` events and spans; binaries and tests
//! decide where they go. [`init`] installs a `tracing-subscriber` registry
//! with an [`EnvFilter`] (`RUST_LOG` wins over the configured level) and one
//! of three output formats.
//!
//! # Example
//! ```no_run
//! use echem_daq::config::AppConfig;
//! use echem_daq::logging::{self, LoggingConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load_default()?;
//! logging::init(&LoggingConfig::from_app_config(&config)?)?;
//! tracing::info!("Application started");
//! # Ok(())
//! # }
//! ```

use crate::config::{AppConfig, LogFormat};
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Logging setup errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoggingError {
    /// Unrecognised level name
    #[error("Invalid log level '{0}'. Must be one of: trace, debug, info, warn, error")]
    InvalidLevel(String),

    /// A global subscriber could not be installed
    #[error("Failed to initialize tracing: {0}")]
    Init(String),
}

/// Subscriber options.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Output format
    pub format: LogFormat,
    /// Emit span NEW and CLOSE events
    pub with_span_events: bool,
    /// Include file and line numbers
    pub with_file_and_line: bool,
    /// Include thread names
    pub with_thread_names: bool,
    /// Colors (pretty format only)
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: false,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Options with the default format at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Options from the `application` section.
    ///
    /// # Errors
    ///
    /// [`LoggingError::InvalidLevel`] for an unknown level name.
    pub fn from_app_config(config: &AppConfig) -> Result<Self, LoggingError> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: config.application.log_format,
            ..Default::default()
        })
    }

    /// Set output format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span events.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }
}

/// Install the global subscriber.
///
/// Idempotent: if a global subscriber is already set (tests, embedding
/// applications) this returns `Ok(())`.
///
/// # Errors
///
/// [`LoggingError::Init`] if installation fails for another reason.
pub fn init(config: &LoggingConfig) -> Result<(), LoggingError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let base = fmt::layer()
        .with_span_events(span_events)
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line)
        .with_thread_names(config.with_thread_names);

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Pretty => base.pretty().with_ansi(config.with_ansi).boxed(),
        LogFormat::Compact => base.compact().with_ansi(false).boxed(),
        LogFormat::Json => base.json().boxed(),
    };

    match tracing_subscriber::registry()
        .with(layer.with_filter(env_filter))
        .try_init()
    {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("already been set") => Ok(()),
        Err(e) => Err(LoggingError::Init(e.to_string())),
    }
}

/// Parse a level name, case-insensitively.
///
/// # Errors
///
/// [`LoggingError::InvalidLevel`] for an unknown name.
pub fn parse_log_level(level: &str) -> Result<Level, LoggingError> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(LoggingError::InvalidLevel(level.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("trace"), Ok(Level::TRACE));
        assert_eq!(parse_log_level("Debug"), Ok(Level::DEBUG));
        assert_eq!(parse_log_level("INFO"), Ok(Level::INFO));
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn config_follows_application_section() {
        let mut app = AppConfig::default();
        app.application.log_level = "warn".to_string();
        app.application.log_format = LogFormat::Json;
        let config = LoggingConfig::from_app_config(&app).unwrap();
        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.format, LogFormat::Json);
    }

    #[test]
    fn init_is_idempotent() {
        let config = LoggingConfig::new(Level::DEBUG).with_span_events(true);
        assert!(init(&config).is_ok());
        assert!(init(&config.with_format(LogFormat::Json)).is_ok());
    }
}

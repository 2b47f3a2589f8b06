//! Configuration using Figment.
//!
//! Configuration is layered:
//! 1. Built-in defaults (mirroring `config/echem_daq.toml`)
//! 2. A TOML file
//! 3. Environment variables prefixed with `ECHEM_DAQ_`, sections separated
//!    by a double underscore
//!
//! # Example
//! ```no_run
//! use echem_daq::config::AppConfig;
//!
//! // ECHEM_DAQ_TRANSPORT__COMMAND_TIMEOUT_MS=2000 overrides the file.
//! let config = AppConfig::load("config/echem_daq.toml")?;
//! config.validate()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), echem_daq::config::ConfigError>(())
//! ```

use crate::handler::HandleSettings;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/echem_daq.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "ECHEM_DAQ_";

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A source could not be read or parsed
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    /// Values parsed but failed validation
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// `[application]`
    pub application: ApplicationConfig,
    /// `[transport]`
    pub transport: TransportConfig,
    /// `[firmware]`
    pub firmware: FirmwareConfig,
    /// Ports tried by `connect_all` in addition to discovered ones
    pub ports: Vec<String>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored (development)
    Pretty,
    /// Single-line, no colors
    #[default]
    Compact,
    /// Structured JSON (log aggregation)
    Json,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Logging output format
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "echem-daq".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
        }
    }
}

/// Device communication settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Serial line rate
    pub baud_rate: u32,
    /// Bound on every request, in milliseconds
    pub command_timeout_ms: u64,
    /// Events buffered per subscriber
    pub event_capacity: usize,
    /// Device notifications queued per connection
    pub notification_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            command_timeout_ms: 5_000,
            event_capacity: 4_096,
            notification_capacity: 1_024,
        }
    }
}

impl TransportConfig {
    /// Request timeout as a duration.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Settings for instrument handles.
    pub fn handle_settings(&self) -> HandleSettings {
        HandleSettings {
            command_timeout: self.command_timeout(),
            event_capacity: self.event_capacity,
        }
    }
}

/// Firmware compatibility and update settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareConfig {
    /// Oldest firmware a session may be opened with
    pub min_supported: u32,
    /// Firmware version installed by `update_firmware`
    pub bundled_version: u32,
    /// Firmware image on disk; when set it must exist for an update
    pub image: Option<PathBuf>,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            min_supported: 100,
            bundled_version: 120,
            image: None,
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl AppConfig {
    /// Load from `path` layered over the defaults, then the environment.
    ///
    /// A missing file is not an error; the defaults and environment apply.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Load`] if the file or an override fails to parse.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::figment(path.as_ref())
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))
    }

    /// Load from [`DEFAULT_CONFIG_PATH`].
    ///
    /// # Errors
    ///
    /// See [`AppConfig::load`].
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load(DEFAULT_CONFIG_PATH)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the first offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.application.log_level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        let transport = &self.transport;
        for (name, value) in [
            ("baud_rate", u64::from(transport.baud_rate)),
            ("command_timeout_ms", transport.command_timeout_ms),
            ("event_capacity", transport.event_capacity as u64),
            ("notification_capacity", transport.notification_capacity as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!(
                    "transport.{name} must be greater than zero"
                )));
            }
        }

        if self.firmware.min_supported > self.firmware.bundled_version {
            return Err(ConfigError::Invalid(format!(
                "firmware.min_supported ({}) exceeds firmware.bundled_version ({})",
                self.firmware.min_supported, self.firmware.bundled_version
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for port in &self.ports {
            if !seen.insert(port) {
                return Err(ConfigError::Invalid(format!("Duplicate port: {port}")));
            }
        }
        Ok(())
    }
}

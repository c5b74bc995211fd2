//! Configuration loading traits and types.
//!
//! Every Blitz binary reads a single TOML file. Types that derive
//! `Deserialize` get [`ConfigLoader::load`] for free.
//!
//! # Usage
//!
//! ```rust,no_run
//! use blitz_common::config::{ConfigError, ConfigLoader, SharedConfig};
//! use serde::Deserialize;
//! use std::path::Path;
//!
//! #[derive(Debug, Deserialize)]
//! struct ToolConfig {
//!     shared: SharedConfig,
//!     port: String,
//! }
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = ToolConfig::load(Path::new("tool.toml"))?;
//!     println!("Service: {}", config.shared.service_name);
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Error type for configuration loading and validation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, per-frame tracing.
    Trace,
    /// Debug information useful during commissioning.
    Debug,
    /// General information about machine operation.
    #[default]
    Info,
    /// Link degradation and recoverable faults.
    Warn,
    /// Startup failures and unrecoverable faults.
    Error,
}

impl LogLevel {
    /// Directive string accepted by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

fn default_service_name() -> String {
    "blitz-hal".to_string()
}

/// Common fields embedded in every application configuration.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "blitz-hal-bench-02"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Application instance identifier.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            service_name: default_service_name(),
        }
    }
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if `service_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if the file is unreadable or not valid TOML
///
/// Semantic validation is left to the loaded type.
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML text.
    fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[derive(Debug, Deserialize)]
    struct Wrapper {
        shared: SharedConfig,
        #[serde(default)]
        port: Option<String>,
    }

    #[test]
    fn log_level_round_trips_lowercase() {
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct Level {
            level: LogLevel,
        }

        let text = toml::to_string(&Level {
            level: LogLevel::Warn,
        })
        .unwrap();
        assert!(text.contains("warn"));
        assert_eq!(
            toml::from_str::<Level>("level = \"trace\"").unwrap().level,
            LogLevel::Trace
        );
        assert_eq!(LogLevel::Debug.as_filter(), "debug");
    }

    #[test]
    fn empty_service_name_is_rejected() {
        let config = SharedConfig {
            log_level: LogLevel::Info,
            service_name: "  ".to_string(),
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
        assert!(SharedConfig::default().validate().is_ok());
    }

    #[test]
    fn missing_file_is_reported() {
        let result = Wrapper::load(Path::new("/nonexistent/blitz/machine.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound)));
    }

    #[test]
    fn broken_toml_is_a_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[shared\nservice_name = ").unwrap();

        let result = Wrapper::load(file.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn loads_from_file_with_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"port = "/dev/ttyUSB0"

[shared]
log_level = "debug"
"#
        )
        .unwrap();
        file.flush().unwrap();

        let config = Wrapper::load(file.path()).unwrap();
        assert_eq!(config.shared.log_level, LogLevel::Debug);
        assert_eq!(config.shared.service_name, "blitz-hal");
        assert_eq!(config.port.as_deref(), Some("/dev/ttyUSB0"));
    }
}

//! Debug Context Configuration
//!
//! Configuration can be set programmatically or loaded from environment
//! variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `HDEBUG_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `HDEBUG_FATAL_EXIT_CODE` | Exit status when a violation terminates the process (1-255) | 86 |
//! | `HDEBUG_CLOSED_QUARANTINE` | Closed slots withheld from reuse | 1024 |
//! | `HDEBUG_INITIAL_CAPACITY` | Handle slots allocated up front | 256 |
//! | `HDEBUG_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | warn |
//!
//! # Example
//!
//! ```rust
//! use hdebug_runtime::config::DebugConfig;
//!
//! let config = DebugConfig::builder()
//!     .closed_quarantine(0)
//!     .fatal_exit_code(70)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.closed_quarantine, 0);
//! ```

use std::env;

use thiserror::Error;

use crate::hook::FATAL_EXIT_CODE;

/// Log level for debug-context diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// No logging.
    Off,
    /// Error messages only.
    Error,
    /// Warnings and errors; every violation is a warning.
    #[default]
    Warn,
    /// Informational messages.
    Info,
    /// Frame push/pop.
    Debug,
    /// Every handle operation.
    Trace,
}

impl LogLevel {
    /// Parse a log level from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to a string representation, usable as a tracing filter.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Configuration of a debug context.
#[derive(Debug, Clone)]
pub struct DebugConfig {
    /// Exit status used when a violation terminates the process.
    /// Default: [`FATAL_EXIT_CODE`].
    pub fatal_exit_code: i32,

    /// Number of closed slots kept out of reuse, oldest recycled first.
    /// Default: 1024. Zero recycles immediately.
    pub closed_quarantine: usize,

    /// Handle slots allocated up front.
    /// Default: 256.
    pub initial_capacity: usize,

    /// Log level for diagnostics.
    /// Default: Warn.
    pub log_level: LogLevel,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            fatal_exit_code: FATAL_EXIT_CODE,
            closed_quarantine: 1024,
            initial_capacity: 256,
            log_level: LogLevel::Warn,
        }
    }
}

impl DebugConfig {
    /// Create a new builder for DebugConfig.
    pub fn builder() -> DebugConfigBuilder {
        DebugConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are unset or invalid leave the default in place.
    pub fn from_env() -> Self {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Load configuration from `HDEBUG_*` variables supplied by `var`.
    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_var::<i32>(&var, "HDEBUG_FATAL_EXIT_CODE") {
            if valid_exit_code(val) {
                config.fatal_exit_code = val;
            }
        }

        if let Some(val) = parse_var::<usize>(&var, "HDEBUG_CLOSED_QUARANTINE") {
            config.closed_quarantine = val;
        }

        if let Some(val) = parse_var::<usize>(&var, "HDEBUG_INITIAL_CAPACITY") {
            config.initial_capacity = val;
        }

        if let Some(level) = var("HDEBUG_LOG_LEVEL").and_then(|val| LogLevel::from_str(&val)) {
            config.log_level = level;
        }

        config
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !valid_exit_code(self.fatal_exit_code) {
            return Err(ConfigError::InvalidValue {
                field: "fatal_exit_code".into(),
                message: "must be between 1 and 255".into(),
            });
        }

        if self.initial_capacity > u32::MAX as usize {
            return Err(ConfigError::InvalidValue {
                field: "initial_capacity".into(),
                message: "exceeds the handle slot space".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
}

/// Builder for DebugConfig.
#[derive(Debug, Clone, Default)]
pub struct DebugConfigBuilder {
    config: DebugConfig,
}

impl DebugConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fatal exit status.
    pub fn fatal_exit_code(mut self, code: i32) -> Self {
        self.config.fatal_exit_code = code;
        self
    }

    /// Set the closed-slot quarantine length.
    pub fn closed_quarantine(mut self, len: usize) -> Self {
        self.config.closed_quarantine = len;
        self
    }

    /// Set the number of slots allocated up front.
    pub fn initial_capacity(mut self, slots: usize) -> Self {
        self.config.initial_capacity = slots;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = level;
        self
    }

    /// Build the configuration, validating it.
    pub fn build(self) -> Result<DebugConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(self) -> DebugConfig {
        self.config
    }
}

fn valid_exit_code(code: i32) -> bool {
    (1..=255).contains(&code)
}

fn parse_var<T: std::str::FromStr>(
    var: impl Fn(&str) -> Option<String>,
    name: &str,
) -> Option<T> {
    var(name).and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = DebugConfig::default();
        assert_eq!(config.fatal_exit_code, FATAL_EXIT_CODE);
        assert_eq!(config.closed_quarantine, 1024);
        assert_eq!(config.initial_capacity, 256);
        assert_eq!(config.log_level, LogLevel::Warn);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = DebugConfig::builder()
            .fatal_exit_code(3)
            .closed_quarantine(16)
            .initial_capacity(8)
            .log_level(LogLevel::Trace)
            .build()
            .unwrap();

        assert_eq!(config.fatal_exit_code, 3);
        assert_eq!(config.closed_quarantine, 16);
        assert_eq!(config.initial_capacity, 8);
        assert_eq!(config.log_level, LogLevel::Trace);
    }

    #[test]
    fn test_builder_rejects_exit_code() {
        assert!(DebugConfig::builder().fatal_exit_code(0).build().is_err());
        assert!(DebugConfig::builder().fatal_exit_code(256).build().is_err());
        assert!(DebugConfig::builder().fatal_exit_code(-1).build().is_err());

        let unchecked = DebugConfig::builder().fatal_exit_code(0).build_unchecked();
        assert_eq!(unchecked.fatal_exit_code, 0);
    }

    #[test]
    fn test_log_level_from_str() {
        assert_eq!(LogLevel::from_str("off"), Some(LogLevel::Off));
        assert_eq!(LogLevel::from_str("ERROR"), Some(LogLevel::Error));
        assert_eq!(LogLevel::from_str("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_str("Info"), Some(LogLevel::Info));
        assert_eq!(LogLevel::from_str("4"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::from_str("trace"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::from_str("loud"), None);
    }

    #[test]
    fn test_config_error_display() {
        let err = DebugConfig::builder()
            .fatal_exit_code(0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("fatal_exit_code"));
        assert!(err.to_string().contains("between 1 and 255"));
    }

    #[test]
    fn test_from_vars_with_no_vars() {
        let config = DebugConfig::from_vars(|_| None);
        assert_eq!(config.fatal_exit_code, FATAL_EXIT_CODE);
        assert_eq!(config.closed_quarantine, 1024);
        assert_eq!(config.initial_capacity, 256);
        assert_eq!(config.log_level, LogLevel::Warn);
    }

    #[test]
    fn test_from_vars() {
        let vars: HashMap<&str, &str> = [
            ("HDEBUG_FATAL_EXIT_CODE", "70"),
            ("HDEBUG_CLOSED_QUARANTINE", " 0 "),
            ("HDEBUG_INITIAL_CAPACITY", "16"),
            ("HDEBUG_LOG_LEVEL", "TRACE"),
        ]
        .into_iter()
        .collect();

        let config = DebugConfig::from_vars(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.fatal_exit_code, 70);
        assert_eq!(config.closed_quarantine, 0);
        assert_eq!(config.initial_capacity, 16);
        assert_eq!(config.log_level, LogLevel::Trace);
    }

    #[test]
    fn test_from_vars_ignores_invalid_values() {
        let vars: HashMap<&str, &str> = [
            ("HDEBUG_FATAL_EXIT_CODE", "0"),
            ("HDEBUG_CLOSED_QUARANTINE", "lots"),
            ("HDEBUG_LOG_LEVEL", "loud"),
        ]
        .into_iter()
        .collect();

        let config = DebugConfig::from_vars(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.fatal_exit_code, FATAL_EXIT_CODE);
        assert_eq!(config.closed_quarantine, 1024);
        assert_eq!(config.log_level, LogLevel::Warn);
    }
}

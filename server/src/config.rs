//! Server configuration module.
//!
//! Parses configuration from environment variables for the Eventcast server.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `PORT` | No | 8080 | HTTP server port |
//! | `EVENTCAST_SEND_TIMEOUT_MS` | No | 5000 | Upper bound for one send to one connection |
//! | `EVENTCAST_OUTBOUND_BUFFER` | No | 64 | Frames queued per connection before sends block (1..=65536) |

use std::env;
use std::time::Duration;

use thiserror::Error;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 8080;

/// Default per-connection send timeout (5 seconds).
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default per-connection outbound queue capacity.
const DEFAULT_OUTBOUND_BUFFER: usize = 64;

/// Largest accepted per-connection outbound queue capacity.
const MAX_OUTBOUND_BUFFER: usize = 65_536;

const ENV_PORT: &str = "PORT";
const ENV_SEND_TIMEOUT_MS: &str = "EVENTCAST_SEND_TIMEOUT_MS";
const ENV_OUTBOUND_BUFFER: &str = "EVENTCAST_OUTBOUND_BUFFER";

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),

    /// Configuration validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Server configuration parsed from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port.
    pub port: u16,

    /// Maximum time a single send to a single connection may take before the
    /// connection is considered dead.
    pub send_timeout: Duration,

    /// Capacity of each connection's outbound frame queue.
    pub outbound_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
        }
    }
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Port number is not a valid u16
    /// - A numeric variable is not a number
    /// - The send timeout or outbound buffer is zero
    /// - The outbound buffer exceeds 65536 frames
    ///
    /// # Example
    ///
    /// ```no_run
    /// use eventcast_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = parse_port()?;
        let send_timeout = parse_u64_env(ENV_SEND_TIMEOUT_MS)?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_SEND_TIMEOUT);
        let outbound_buffer = match parse_u64_env(ENV_OUTBOUND_BUFFER)? {
            Some(value) => usize::try_from(value).map_err(|_| ConfigError::InvalidFormat {
                var: ENV_OUTBOUND_BUFFER.to_string(),
                message: format!("{value} does not fit in usize"),
            })?,
            None => DEFAULT_OUTBOUND_BUFFER,
        };

        let config = Self {
            port,
            send_timeout,
            outbound_buffer,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Both the send timeout and the outbound buffer must be non-zero, and the
    /// outbound buffer may not exceed [`MAX_OUTBOUND_BUFFER`].
    fn validate(&self) -> Result<(), ConfigError> {
        if self.send_timeout.is_zero() {
            return Err(ConfigError::ValidationError(format!(
                "{ENV_SEND_TIMEOUT_MS} must be greater than zero"
            )));
        }

        if self.outbound_buffer == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{ENV_OUTBOUND_BUFFER} must be greater than zero"
            )));
        }

        if self.outbound_buffer > MAX_OUTBOUND_BUFFER {
            return Err(ConfigError::ValidationError(format!(
                "{ENV_OUTBOUND_BUFFER} must be at most {MAX_OUTBOUND_BUFFER}, got {}",
                self.outbound_buffer
            )));
        }

        Ok(())
    }
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var(ENV_PORT) {
        Ok(port_str) => Ok(port_str.trim().parse()?),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: ENV_PORT.to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

/// Parse an optional unsigned integer environment variable.
///
/// Returns `None` if the variable is unset or empty.
fn parse_u64_env(name: &str) -> Result<Option<u64>, ConfigError> {
    match env::var(name) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|err| ConfigError::InvalidFormat {
                var: name.to_string(),
                message: format!("expected a non-negative integer, got '{value}': {err}"),
            }),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: name.to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    /// Helper to temporarily set environment variables for testing.
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old_value = env::var(key).ok();
            self.vars.push((key.to_string(), old_value));
            env::set_var(key, value);
        }

        fn remove(&mut self, key: &str) {
            let old_value = env::var(key).ok();
            self.vars.push((key.to_string(), old_value));
            env::remove_var(key);
        }

        fn clear_all(&mut self) {
            self.remove(ENV_PORT);
            self.remove(ENV_SEND_TIMEOUT_MS);
            self.remove(ENV_OUTBOUND_BUFFER);
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.iter().rev() {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    #[serial]
    fn test_config_defaults() {
        let mut guard = EnvGuard::new();
        guard.clear_all();

        let config = Config::from_env().expect("should parse config");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.send_timeout, DEFAULT_SEND_TIMEOUT);
        assert_eq!(config.outbound_buffer, DEFAULT_OUTBOUND_BUFFER);
    }

    #[test]
    #[serial]
    fn test_config_custom_values() {
        let mut guard = EnvGuard::new();
        guard.clear_all();
        guard.set(ENV_PORT, "9090");
        guard.set(ENV_SEND_TIMEOUT_MS, "250");
        guard.set(ENV_OUTBOUND_BUFFER, "8");

        let config = Config::from_env().expect("should parse config");
        assert_eq!(config.port, 9090);
        assert_eq!(config.send_timeout, Duration::from_millis(250));
        assert_eq!(config.outbound_buffer, 8);
    }

    #[test]
    #[serial]
    fn test_config_empty_numeric_values_use_defaults() {
        let mut guard = EnvGuard::new();
        guard.clear_all();
        guard.set(ENV_SEND_TIMEOUT_MS, "");
        guard.set(ENV_OUTBOUND_BUFFER, "  ");

        let config = Config::from_env().expect("should parse config");
        assert_eq!(config.send_timeout, DEFAULT_SEND_TIMEOUT);
        assert_eq!(config.outbound_buffer, DEFAULT_OUTBOUND_BUFFER);
    }

    #[test]
    #[serial]
    fn test_config_rejects_zero_send_timeout() {
        let mut guard = EnvGuard::new();
        guard.clear_all();
        guard.set(ENV_SEND_TIMEOUT_MS, "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(ref m) if m.contains(ENV_SEND_TIMEOUT_MS)));
    }

    #[test]
    #[serial]
    fn test_config_rejects_zero_outbound_buffer() {
        let mut guard = EnvGuard::new();
        guard.clear_all();
        guard.set(ENV_OUTBOUND_BUFFER, "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(ref m) if m.contains(ENV_OUTBOUND_BUFFER)));
    }

    #[test]
    #[serial]
    fn test_config_rejects_oversized_outbound_buffer() {
        let mut guard = EnvGuard::new();
        guard.clear_all();
        guard.set(ENV_OUTBOUND_BUFFER, "18446744073709551615");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::ValidationError(_) | ConfigError::InvalidFormat { .. }
        ));
    }

    #[test]
    #[serial]
    fn test_config_outbound_buffer_cap_is_inclusive() {
        let mut guard = EnvGuard::new();
        guard.clear_all();
        guard.set(ENV_OUTBOUND_BUFFER, &MAX_OUTBOUND_BUFFER.to_string());

        let config = Config::from_env().expect("should parse config");
        assert_eq!(config.outbound_buffer, MAX_OUTBOUND_BUFFER);

        guard.set(ENV_OUTBOUND_BUFFER, &(MAX_OUTBOUND_BUFFER + 1).to_string());
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(ref m) if m.contains(ENV_OUTBOUND_BUFFER)));
    }

    #[test]
    #[serial]
    fn test_config_rejects_non_numeric_send_timeout() {
        let mut guard = EnvGuard::new();
        guard.clear_all();
        guard.set(ENV_SEND_TIMEOUT_MS, "soon");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFormat { ref var, .. } if var == ENV_SEND_TIMEOUT_MS));
    }

    #[test]
    #[serial]
    fn test_parse_port_default() {
        let mut guard = EnvGuard::new();
        guard.remove(ENV_PORT);

        let port = parse_port().expect("should parse port");
        assert_eq!(port, DEFAULT_PORT);
    }

    #[test]
    #[serial]
    fn test_parse_port_custom() {
        let mut guard = EnvGuard::new();
        guard.set(ENV_PORT, "3000");

        let port = parse_port().expect("should parse port");
        assert_eq!(port, 3000);
    }

    #[test]
    #[serial]
    fn test_parse_port_invalid() {
        let mut guard = EnvGuard::new();
        guard.set(ENV_PORT, "not-a-number");

        let result = parse_port();
        assert!(matches!(result.unwrap_err(), ConfigError::InvalidPort(_)));
    }

    #[test]
    #[serial]
    fn test_parse_port_out_of_range() {
        let mut guard = EnvGuard::new();
        guard.set(ENV_PORT, "99999");

        assert!(parse_port().is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }
}

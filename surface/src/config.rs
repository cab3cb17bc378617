//! Surface configuration module.
//!
//! Parses configuration from environment variables for timer clients.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `POMOSYNC_REQUEST_TIMEOUT_MS` | No | 2000 | How long to wait for the engine to answer |
//! | `POMOSYNC_WRITE_DEBOUNCE_MS` | No | 50 | Write-behind window for start/pause intents |
//! | `POMOSYNC_READ_DEBOUNCE_MS` | No | 100 | Window for coalescing incoming state changes |

use std::env;
use std::time::Duration;

use pomosync_engine::config::ConfigError;

/// Default engine request timeout in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 2000;

/// Default write-behind window in milliseconds.
pub const DEFAULT_WRITE_DEBOUNCE_MS: u64 = 50;

/// Default read-side debounce window in milliseconds.
pub const DEFAULT_READ_DEBOUNCE_MS: u64 = 100;

const REQUEST_TIMEOUT_VAR: &str = "POMOSYNC_REQUEST_TIMEOUT_MS";
const WRITE_DEBOUNCE_VAR: &str = "POMOSYNC_WRITE_DEBOUNCE_MS";
const READ_DEBOUNCE_VAR: &str = "POMOSYNC_READ_DEBOUNCE_MS";

/// Timing parameters of a timer client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceConfig {
    pub request_timeout: Duration,
    pub write_debounce: Duration,
    pub read_debounce: Duration,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            write_debounce: Duration::from_millis(DEFAULT_WRITE_DEBOUNCE_MS),
            read_debounce: Duration::from_millis(DEFAULT_READ_DEBOUNCE_MS),
        }
    }
}

impl SurfaceConfig {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if the request timeout is not a
    /// positive integer, or a debounce window is not a non-negative integer.
    pub fn from_env() -> Result<Self, ConfigError> {
        let request_timeout = match env_millis(REQUEST_TIMEOUT_VAR)? {
            Some(0) => {
                return Err(ConfigError::invalid(
                    REQUEST_TIMEOUT_VAR,
                    "must be greater than zero",
                ))
            }
            Some(ms) => ms,
            None => DEFAULT_REQUEST_TIMEOUT_MS,
        };
        let write_debounce = env_millis(WRITE_DEBOUNCE_VAR)?.unwrap_or(DEFAULT_WRITE_DEBOUNCE_MS);
        let read_debounce = env_millis(READ_DEBOUNCE_VAR)?.unwrap_or(DEFAULT_READ_DEBOUNCE_MS);

        Ok(Self {
            request_timeout: Duration::from_millis(request_timeout),
            write_debounce: Duration::from_millis(write_debounce),
            read_debounce: Duration::from_millis(read_debounce),
        })
    }
}

fn env_millis(name: &str) -> Result<Option<u64>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse::<u64>().map(Some).map_err(|_| {
            ConfigError::invalid(name, format!("expected milliseconds, got '{raw}'"))
        }),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => {
            Err(ConfigError::invalid(name, "contains invalid unicode"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    /// Clears every `POMOSYNC_` variable for the duration of a test.
    fn with_clean_env<F: FnOnce()>(f: F) {
        let saved: Vec<(String, String)> = env::vars()
            .filter(|(key, _)| key.starts_with("POMOSYNC_"))
            .collect();
        for (key, _) in &saved {
            env::remove_var(key);
        }

        f();

        for key in [REQUEST_TIMEOUT_VAR, WRITE_DEBOUNCE_VAR, READ_DEBOUNCE_VAR] {
            env::remove_var(key);
        }
        for (key, value) in saved {
            env::set_var(key, value);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        with_clean_env(|| {
            let config = SurfaceConfig::from_env().unwrap();
            assert_eq!(config, SurfaceConfig::default());
            assert_eq!(config.write_debounce, Duration::from_millis(50));
            assert_eq!(config.read_debounce, Duration::from_millis(100));
            assert_eq!(config.request_timeout, Duration::from_secs(2));
        });
    }

    #[test]
    #[serial]
    fn test_overrides() {
        with_clean_env(|| {
            env::set_var(REQUEST_TIMEOUT_VAR, "500");
            env::set_var(WRITE_DEBOUNCE_VAR, "0");
            env::set_var(READ_DEBOUNCE_VAR, "250");

            let config = SurfaceConfig::from_env().unwrap();
            assert_eq!(config.request_timeout, Duration::from_millis(500));
            assert_eq!(config.write_debounce, Duration::ZERO);
            assert_eq!(config.read_debounce, Duration::from_millis(250));
        });
    }

    #[test]
    #[serial]
    fn test_zero_timeout_rejected() {
        with_clean_env(|| {
            env::set_var(REQUEST_TIMEOUT_VAR, "0");
            let err = SurfaceConfig::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == REQUEST_TIMEOUT_VAR));
        });
    }

    #[test]
    #[serial]
    fn test_invalid_number_rejected() {
        with_clean_env(|| {
            env::set_var(READ_DEBOUNCE_VAR, "soon");
            assert!(SurfaceConfig::from_env().is_err());
        });
    }
}

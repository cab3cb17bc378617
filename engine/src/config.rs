//! Engine configuration module.
//!
//! Parses configuration from environment variables for the timer engine.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `POMOSYNC_DATA_DIR` | No | platform data dir | Root directory of the file-backed store |
//! | `POMOSYNC_TICK_MS` | No | 1000 | Interval between timer wakes |
//! | `POMOSYNC_BADGE_THROTTLE_MS` | No | 500 | Minimum interval between badge refreshes |
//! | `POMOSYNC_SESSION_LOG_CAPACITY` | No | 1000 | Maximum retained session log entries |

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;

pub use crate::error::ConfigError;

/// Default interval between timer wakes.
pub const DEFAULT_TICK_MS: u64 = 1000;

/// Default minimum interval between badge refreshes.
pub const DEFAULT_BADGE_THROTTLE_MS: u64 = 500;

/// Default number of retained session log entries.
pub const DEFAULT_SESSION_LOG_CAPACITY: usize = 1000;

const DATA_DIR_VAR: &str = "POMOSYNC_DATA_DIR";
const TICK_VAR: &str = "POMOSYNC_TICK_MS";
const BADGE_THROTTLE_VAR: &str = "POMOSYNC_BADGE_THROTTLE_MS";
const SESSION_LOG_CAPACITY_VAR: &str = "POMOSYNC_SESSION_LOG_CAPACITY";

/// Timing and retention parameters of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Interval between timer wakes. One wake removes one second.
    pub tick_interval: Duration,

    /// Minimum interval between non-final badge refreshes.
    pub badge_throttle: Duration,

    /// Maximum number of session log entries kept.
    pub session_log_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(DEFAULT_TICK_MS),
            badge_throttle: Duration::from_millis(DEFAULT_BADGE_THROTTLE_MS),
            session_log_capacity: DEFAULT_SESSION_LOG_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if a variable is set but is not a
    /// positive integer.
    pub fn from_env() -> Result<Self, ConfigError> {
        let tick_ms = parse_positive(TICK_VAR)?.unwrap_or(DEFAULT_TICK_MS);
        let throttle_ms = parse_positive(BADGE_THROTTLE_VAR)?.unwrap_or(DEFAULT_BADGE_THROTTLE_MS);
        let capacity = match parse_positive(SESSION_LOG_CAPACITY_VAR)? {
            Some(value) => usize::try_from(value)
                .map_err(|_| ConfigError::invalid(SESSION_LOG_CAPACITY_VAR, "value is too large"))?,
            None => DEFAULT_SESSION_LOG_CAPACITY,
        };

        Ok(Self {
            tick_interval: Duration::from_millis(tick_ms),
            badge_throttle: Duration::from_millis(throttle_ms),
            session_log_capacity: capacity,
        })
    }
}

/// Resolve the store's root directory.
///
/// Uses `POMOSYNC_DATA_DIR` when set, otherwise the platform data directory.
///
/// # Errors
///
/// Returns [`ConfigError::NoDataDirectory`] if the variable is unset and the
/// platform offers no data directory.
pub fn data_dir_from_env() -> Result<PathBuf, ConfigError> {
    match env::var(DATA_DIR_VAR) {
        Ok(dir) if !dir.trim().is_empty() => Ok(PathBuf::from(dir)),
        Ok(_) => Err(ConfigError::invalid(DATA_DIR_VAR, "cannot be empty")),
        Err(env::VarError::NotUnicode(_)) => {
            Err(ConfigError::invalid(DATA_DIR_VAR, "contains invalid unicode"))
        }
        Err(env::VarError::NotPresent) => ProjectDirs::from("", "", "pomosync")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .ok_or(ConfigError::NoDataDirectory),
    }
}

/// Parse an optional positive integer environment variable.
pub(crate) fn parse_positive(name: &str) -> Result<Option<u64>, ConfigError> {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(0) => Err(ConfigError::invalid(name, "must be greater than zero")),
            Ok(value) => Ok(Some(value)),
            Err(_) => Err(ConfigError::invalid(
                name,
                format!("expected a positive integer, got '{raw}'"),
            )),
        },
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

    /// Restores touched environment variables on drop.
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            self.vars.push((key.to_string(), env::var(key).ok()));
            env::set_var(key, value);
        }

        fn remove(&mut self, key: &str) {
            self.vars.push((key.to_string(), env::var(key).ok()));
            env::remove_var(key);
        }

        fn clean() -> Self {
            let mut guard = Self::new();
            for key in [DATA_DIR_VAR, TICK_VAR, BADGE_THROTTLE_VAR, SESSION_LOG_CAPACITY_VAR] {
                guard.remove(key);
            }
            guard
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
    fn test_defaults_when_unset() {
        let _guard = EnvGuard::clean();

        let config = EngineConfig::from_env().expect("should parse config");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.tick_interval, Duration::from_secs(1));
        assert_eq!(config.badge_throttle, Duration::from_millis(500));
        assert_eq!(config.session_log_capacity, 1000);
    }

    #[test]
    #[serial]
    fn test_overrides_from_env() {
        let mut guard = EnvGuard::clean();
        guard.set(TICK_VAR, "250");
        guard.set(BADGE_THROTTLE_VAR, " 100 ");
        guard.set(SESSION_LOG_CAPACITY_VAR, "50");

        let config = EngineConfig::from_env().expect("should parse config");
        assert_eq!(config.tick_interval, Duration::from_millis(250));
        assert_eq!(config.badge_throttle, Duration::from_millis(100));
        assert_eq!(config.session_log_capacity, 50);
    }

    #[test]
    #[serial]
    fn test_zero_is_rejected() {
        let mut guard = EnvGuard::clean();
        guard.set(TICK_VAR, "0");

        let err = EngineConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == TICK_VAR));
    }

    #[test]
    #[serial]
    fn test_garbage_is_rejected() {
        let mut guard = EnvGuard::clean();
        guard.set(SESSION_LOG_CAPACITY_VAR, "lots");

        let err = EngineConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("lots"));
    }

    #[test]
    #[serial]
    fn test_data_dir_override() {
        let mut guard = EnvGuard::clean();
        guard.set(DATA_DIR_VAR, "/tmp/pomosync-test");

        let dir = data_dir_from_env().expect("should resolve dir");
        assert_eq!(dir, PathBuf::from("/tmp/pomosync-test"));
    }

    #[test]
    #[serial]
    fn test_empty_data_dir_is_rejected() {
        let mut guard = EnvGuard::clean();
        guard.set(DATA_DIR_VAR, "  ");

        assert!(matches!(
            data_dir_from_env(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}

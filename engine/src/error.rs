//! Error types for the pomosync engine.
//!
//! # Error Types
//!
//! - [`ConfigError`] - Environment configuration problems
//! - [`StoreError`] - Failures reading or writing the key-value store
//! - [`AlertError`] - A notification or badge could not be delivered
//! - [`RequestError`] - A request to the engine got no usable answer
//! - [`EngineError`] - Top-level error encompassing all of the above
//!
//! Storage failures abort the operation that hit them. Alert failures are
//! logged by the engine and never abort a transition.

use std::error::Error;
use std::fmt;
use std::time::Duration;

use thiserror::Error as ThisError;

/// Errors that occur while loading configuration from the environment.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A configuration value failed to parse or is out of range.
    #[error("invalid configuration value for '{key}': {message}")]
    InvalidValue {
        /// The environment variable holding the bad value.
        key: String,
        /// Description of why the value is invalid.
        message: String,
    },

    /// No platform data directory could be determined.
    #[error("could not determine a data directory; set POMOSYNC_DATA_DIR")]
    NoDataDirectory,
}

impl ConfigError {
    /// Creates a new invalid value error.
    pub fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Errors raised by the key-value store and its backends.
#[derive(ThisError, Debug)]
pub enum StoreError {
    /// Filesystem failure in a file-backed store.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A value could not be encoded, or a stored file is not valid JSON.
    #[error("storage encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// A stored value does not decode into the expected type.
    #[error("stored value under '{key}' has an unexpected shape: {source}")]
    Shape {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Backend-specific failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Creates a new backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}

/// A notification or badge update could not be delivered.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum AlertError {
    #[error("alert delivery failed: {0}")]
    Delivery(String),
}

/// Why a request to the engine produced no usable response.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The engine's request channel is closed.
    #[error("timer engine is not running")]
    EngineUnavailable,

    /// The engine dropped the request without answering.
    #[error("timer engine dropped the request without responding")]
    NoResponse,

    /// No answer arrived within the deadline.
    #[error("timer engine did not respond within {0:?}")]
    Timeout(Duration),

    /// The engine answered with a response of the wrong kind.
    #[error("timer engine sent an unexpected response")]
    UnexpectedResponse,
}

/// Top-level error type for the pomosync engine.
#[derive(Debug)]
pub enum EngineError {
    /// Configuration error during startup.
    Config(ConfigError),

    /// The store could not be read or written.
    Store(StoreError),

    /// A request to the engine failed.
    Request(RequestError),

    /// Notification delivery failed.
    Alert(AlertError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "configuration error: {err}"),
            Self::Store(err) => write!(f, "store error: {err}"),
            Self::Request(err) => write!(f, "request error: {err}"),
            Self::Alert(err) => write!(f, "alert error: {err}"),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Store(err) => Some(err),
            Self::Request(err) => Some(err),
            Self::Alert(err) => Some(err),
        }
    }
}

impl From<ConfigError> for EngineError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<RequestError> for EngineError {
    fn from(err: RequestError) -> Self {
        Self::Request(err)
    }
}

impl From<AlertError> for EngineError {
    fn from(err: AlertError) -> Self {
        Self::Alert(err)
    }
}

impl EngineError {
    /// Returns `true` if retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::Io(_))
                | Self::Request(RequestError::Timeout(_))
                | Self::Alert(_)
        )
    }
}

/// A specialized Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

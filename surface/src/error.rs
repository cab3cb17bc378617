//! Error types for pomosync surfaces.

use thiserror::Error;

use pomosync_engine::config::ConfigError;
use pomosync_engine::messages::RequestError;
use pomosync_engine::store::StoreError;

use crate::debounce::DebouncerError;

/// Errors that can occur in a timer client.
///
/// Facade operations also record a short, user-facing message in the
/// client's view; this type carries the underlying cause.
#[derive(Error, Debug)]
pub enum SurfaceError {
    /// The engine did not answer a request.
    #[error("engine error: {0}")]
    Engine(#[from] RequestError),

    /// The engine answered but reported failure.
    #[error("engine rejected the request")]
    Rejected,

    /// The shared store could not be read or written.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration-related error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The write-behind queue is gone.
    #[error("debounce error: {0}")]
    Debounce(#[from] DebouncerError),

    /// An intent was issued before any state was loaded.
    #[error("no timer state loaded")]
    NotLoaded,
}

/// Result type alias for surface operations.
pub type Result<T> = std::result::Result<T, SurfaceError>;

//! pomosync Surface - timer clients for user-facing hosts.
//!
//! A surface is anything that shows the timer and accepts intents: a popup,
//! a full-page view, a terminal. Each one holds a [`TimerClient`] that mirrors
//! the shared timer state and writes intents back to the store the engine
//! watches.
//!
//! # Modules
//!
//! - [`facade`]: The per-surface client and its observable view
//! - [`debounce`]: Keyed debouncing for write-behind and incoming changes
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types for client operations

pub mod config;
pub mod debounce;
pub mod error;
pub mod facade;

pub use config::SurfaceConfig;
pub use debounce::{Debouncer, DebouncerError};
pub use error::{Result, SurfaceError};
pub use facade::{ClientView, TimerClient};

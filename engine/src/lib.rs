//! pomosync Engine - background Pomodoro timer.
//!
//! This crate provides the single authority that advances the timer:
//! - Ticking the shared timer state once per wake while it runs
//! - Completing sessions: crediting tasks, logging focus time, picking breaks
//! - Raising end-of-session notifications and a countdown badge
//! - Serving state requests from any number of surfaces
//!
//! # Architecture
//!
//! All state lives in a two-scope key-value [`store`]. Surfaces write their
//! intents (start, pause, task selection) to the store and the engine reacts
//! to the change feed; a surface that goes away never stops the timer.

pub mod alarm;
pub mod alerts;
pub mod config;
pub mod durations;
pub mod engine;
pub mod error;
pub mod messages;
pub mod session_log;
pub mod settings;
pub mod store;
pub mod tasks;
pub mod types;

pub use engine::{EngineRuntime, TickOutcome, TimerEngine};
pub use error::{EngineError, Result};
pub use messages::{Ack, EngineHandle, TimerRequest, TimerResponse};
pub use store::{Scope, Store};

//! User-facing alerts: end-of-session notifications and the countdown badge.
//!
//! Delivery goes through the [`Notifier`] trait so each host decides how to
//! render alerts. [`TracingNotifier`] writes them to the log and is the
//! default for headless hosts; [`RecordingNotifier`] keeps them in memory.

use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

pub use crate::error::AlertError;
use crate::types::TimerState;

/// Badge color while the timer runs.
pub const BADGE_RUNNING_COLOR: &str = "#10b981";

/// Badge color while the timer is paused or idle.
pub const BADGE_PAUSED_COLOR: &str = "#6b7280";

/// An end-of-session notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
}

impl Notification {
    /// Notification for a completed focus session.
    pub fn focus_complete(pomodoros: u32) -> Self {
        let plural = if pomodoros > 1 { "s" } else { "" };
        Self {
            title: "Focus Session Complete! 🎉".to_string(),
            message: format!(
                "Great job! You've completed {pomodoros} Pomodoro{plural}. Time for a break!"
            ),
        }
    }

    /// Notification for a completed break.
    pub fn break_complete() -> Self {
        Self {
            title: "Break Complete! ⚡".to_string(),
            message: "Break time is over. Ready to focus again?".to_string(),
        }
    }
}

/// Countdown badge: remaining time and a running/paused color.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Badge {
    pub text: String,
    pub color: &'static str,
}

impl Badge {
    pub fn for_state(state: &TimerState) -> Self {
        Self {
            text: state.clock_text(),
            color: if state.is_running {
                BADGE_RUNNING_COLOR
            } else {
                BADGE_PAUSED_COLOR
            },
        }
    }
}

/// Delivers alerts to the user.
pub trait Notifier: Send + Sync + fmt::Debug {
    fn show_notification(&self, notification: &Notification) -> Result<(), AlertError>;

    fn set_badge(&self, badge: &Badge) -> Result<(), AlertError>;
}

/// Writes alerts to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn show_notification(&self, notification: &Notification) -> Result<(), AlertError> {
        info!(title = %notification.title, message = %notification.message, "Notification");
        Ok(())
    }

    fn set_badge(&self, badge: &Badge) -> Result<(), AlertError> {
        debug!(text = %badge.text, color = badge.color, "Badge");
        Ok(())
    }
}

/// Keeps every alert in memory, for hosts that render them later.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notifications: Mutex<Vec<Notification>>,
    badges: Mutex<Vec<Badge>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn badges(&self) -> Vec<Badge> {
        self.badges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last_badge(&self) -> Option<Badge> {
        self.badges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

impl Notifier for RecordingNotifier {
    fn show_notification(&self, notification: &Notification) -> Result<(), AlertError> {
        self.notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification.clone());
        Ok(())
    }

    fn set_badge(&self, badge: &Badge) -> Result<(), AlertError> {
        self.badges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(badge.clone());
        Ok(())
    }
}

/// Limits badge refreshes to one per interval.
#[derive(Debug)]
pub struct BadgeThrottle {
    interval: Duration,
    last_update: Option<Instant>,
}

impl BadgeThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_update: None,
        }
    }

    /// Claims the next refresh slot if the interval has elapsed.
    pub fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        match self.last_update {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_update = Some(now);
                true
            }
        }
    }

    /// Records an unthrottled refresh.
    pub fn force(&mut self) {
        self.last_update = Some(Instant::now());
    }
}

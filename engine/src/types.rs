//! Persisted record types shared by the engine and every surface.
//!
//! All records serialize to camelCase JSON so that a record written by one
//! component round-trips through any other. Every struct that lives in the
//! store tolerates missing fields: absent values fall back to their defaults
//! instead of failing the whole record.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Shortest session length a settings update can set (one minute).
pub const MIN_SESSION_SECS: u64 = 60;

/// Default focus session length (25 minutes).
pub const DEFAULT_FOCUS_SECS: u64 = 25 * 60;

/// Default short break length (5 minutes).
pub const DEFAULT_SHORT_BREAK_SECS: u64 = 5 * 60;

/// Default long break length (10 minutes).
pub const DEFAULT_LONG_BREAK_SECS: u64 = 10 * 60;

/// Default daily focus goal (8 hours).
pub const DEFAULT_DAILY_GOAL_SECS: u64 = 8 * 60 * 60;

/// Every n-th completed focus session is followed by a long break.
pub const LONG_BREAK_INTERVAL: u32 = 4;

/// The three session kinds the timer alternates between.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerMode {
    #[default]
    Focus,
    ShortBreak,
    LongBreak,
}

impl TimerMode {
    /// Returns `true` for either break kind.
    #[inline]
    pub fn is_break(self) -> bool {
        !matches!(self, Self::Focus)
    }

    /// Wire name of the mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Focus => "focus",
            Self::ShortBreak => "short_break",
            Self::LongBreak => "long_break",
        }
    }
}

impl fmt::Display for TimerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The canonical timer record.
///
/// There is exactly one logical instance, persisted in the local scope. The
/// engine's tick and completion transitions and the facades' intent handlers
/// all perform whole-record read-modify-write cycles on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimerState {
    /// Seconds remaining in the current session.
    pub time: u64,

    /// Whether the wake chain should be decrementing `time`.
    pub is_running: bool,

    /// Current session kind.
    pub mode: TimerMode,

    /// Completed focus sessions, drives short/long break selection.
    pub cycle: u32,

    /// Quick to-do list embedded in the timer record.
    pub todos: Vec<Todo>,

    /// Lifetime count of completed focus sessions.
    pub pomodoros: u32,

    /// Seconds spent running in focus mode.
    pub focus_seconds: u64,

    /// Seconds spent running in focus mode, feeding analytics.
    pub total_focus_time: u64,

    /// Daily focus goal in seconds.
    pub daily_goal: u64,

    /// Consecutive-day streak, maintained by the report surface.
    pub streak: u32,

    /// Task the current session is attributed to, if any.
    pub selected_task_id: Option<String>,

    /// Remaining focus seconds per task, kept when switching away mid-session.
    pub paused_task_times: BTreeMap<String, u64>,
}

impl Default for TimerState {
    fn default() -> Self {
        Self {
            time: DEFAULT_FOCUS_SECS,
            is_running: false,
            mode: TimerMode::Focus,
            cycle: 0,
            todos: Vec::new(),
            pomodoros: 0,
            focus_seconds: 0,
            total_focus_time: 0,
            daily_goal: DEFAULT_DAILY_GOAL_SECS,
            streak: 0,
            selected_task_id: None,
            paused_task_times: BTreeMap::new(),
        }
    }
}

impl TimerState {
    /// Advances the timer by one second.
    ///
    /// Focus counters only move while in focus mode. Returns `true` when this
    /// tick brought `time` to exactly zero, i.e. the session is complete.
    pub fn tick(&mut self) -> bool {
        if self.time == 0 {
            return false;
        }
        self.time -= 1;
        if self.mode == TimerMode::Focus {
            self.focus_seconds += 1;
            self.total_focus_time += 1;
        }
        self.time == 0
    }

    /// Stores the remaining time under the selected task when in focus mode.
    ///
    /// Returns `true` if an entry was written.
    pub fn remember_paused_time(&mut self) -> bool {
        match (&self.selected_task_id, self.mode) {
            (Some(task_id), TimerMode::Focus) => {
                self.paused_task_times.insert(task_id.clone(), self.time);
                true
            }
            _ => false,
        }
    }

    /// Remaining time formatted as `m:ss`.
    pub fn clock_text(&self) -> String {
        format!("{}:{:02}", self.time / 60, self.time % 60)
    }
}

/// An entry in the embedded quick to-do list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Todo {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default = "default_estimated_pomodoros")]
    pub estimated_pomodoros: u32,
    #[serde(default)]
    pub completed_pomodoros: u32,
}

fn default_estimated_pomodoros() -> u32 {
    1
}

impl Todo {
    /// Creates an open to-do with a fresh identifier.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            completed: false,
            created_at: Utc::now(),
            completed_at: None,
            estimated_pomodoros: default_estimated_pomodoros(),
            completed_pomodoros: 0,
        }
    }

    /// Flips completion, stamping or clearing `completed_at`.
    pub fn toggle(&mut self, now: DateTime<Utc>) {
        self.completed = !self.completed;
        self.completed_at = self.completed.then_some(now);
    }
}

/// User-configurable timer behaviour, persisted in the sync scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimerSettings {
    /// Focus session length in seconds.
    pub focus_duration: u64,

    /// Short break length in seconds.
    pub short_break_duration: u64,

    /// Long break length in seconds.
    pub long_break_duration: u64,

    /// Start the break automatically when a focus session completes.
    pub auto_start_breaks: bool,

    /// Start the next focus session automatically when a break completes.
    pub auto_start_pomodoros: bool,

    /// Gate for end-of-session notifications.
    pub notifications: bool,

    /// Whether surfaces should play a sound with notifications.
    pub sound: bool,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            focus_duration: DEFAULT_FOCUS_SECS,
            short_break_duration: DEFAULT_SHORT_BREAK_SECS,
            long_break_duration: DEFAULT_LONG_BREAK_SECS,
            auto_start_breaks: false,
            auto_start_pomodoros: false,
            notifications: true,
            sound: true,
        }
    }
}

impl TimerSettings {
    /// Configured length of a session of the given kind, in seconds.
    ///
    /// Never zero, so a fresh session always has something to count down.
    pub fn duration_for(&self, mode: TimerMode) -> u64 {
        let secs = match mode {
            TimerMode::Focus => self.focus_duration,
            TimerMode::ShortBreak => self.short_break_duration,
            TimerMode::LongBreak => self.long_break_duration,
        };
        secs.max(1)
    }
}

/// A task owned by the task directory.
///
/// The engine only reads the duration overrides and credits completed
/// pomodoros; it never creates or deletes tasks. Fields written by other
/// surfaces that this crate does not model are kept in `extra` so that a
/// read-modify-write never drops them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub project: String,

    /// Focus override in minutes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pomodoro_duration: Option<f64>,

    /// Short break override in minutes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_break_duration: Option<f64>,

    /// Long break override in minutes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_break_duration: Option<f64>,

    /// Planned number of pomodoros; zero means open-ended.
    #[serde(default)]
    pub pomodoro_count: u32,

    #[serde(default)]
    pub completed_pomodoros: u32,

    #[serde(default)]
    pub completed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Task {
    /// Creates an open task with a fresh identifier and no overrides.
    pub fn new(title: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            project: project.into(),
            pomodoro_duration: None,
            short_break_duration: None,
            long_break_duration: None,
            pomodoro_count: 0,
            completed_pomodoros: 0,
            completed: false,
            completed_at: None,
            extra: Map::new(),
        }
    }

    /// Raw override in minutes for the given session kind, unvalidated.
    pub fn override_minutes(&self, mode: TimerMode) -> Option<f64> {
        match mode {
            TimerMode::Focus => self.pomodoro_duration,
            TimerMode::ShortBreak => self.short_break_duration,
            TimerMode::LongBreak => self.long_break_duration,
        }
    }

    /// Credits one completed pomodoro.
    ///
    /// Marks the task completed once a positive target has been reached.
    /// Returns `true` if this call completed the task.
    pub fn record_pomodoro(&mut self, now: DateTime<Utc>) -> bool {
        self.completed_pomodoros += 1;
        let reached = self.pomodoro_count > 0 && self.completed_pomodoros >= self.pomodoro_count;
        if reached && !self.completed {
            self.completed = true;
            self.completed_at = Some(now);
            return true;
        }
        false
    }

    /// Flips completion, stamping or clearing `completed_at`.
    pub fn toggle(&mut self, now: DateTime<Utc>) {
        self.completed = !self.completed;
        self.completed_at = self.completed.then_some(now);
    }
}

/// One completed focus session, as consumed by analytics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLogEntry {
    pub task_id: String,
    pub title: String,
    pub project: String,
    /// Session length in minutes; task overrides may be fractional.
    pub minutes: f64,
    pub finished_at: DateTime<Utc>,
}

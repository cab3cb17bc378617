//! Session length resolution.
//!
//! One set of rules decides how long a session lasts, shared by the engine's
//! transitions and every surface so that they never disagree on the clock.

use crate::types::{Task, TimerMode, TimerSettings, TimerState, LONG_BREAK_INTERVAL};

/// Validated task override for `mode`, in seconds.
///
/// Only finite, strictly positive minute values count. Fractional minutes are
/// rounded to the nearest second.
pub fn task_override(task: &Task, mode: TimerMode) -> Option<u64> {
    task.override_minutes(mode)
        .filter(|minutes| minutes.is_finite() && *minutes > 0.0)
        .map(|minutes| (minutes * 60.0).round() as u64)
        .filter(|secs| *secs > 0)
}

/// Length of a fresh session: the task override if valid, else the setting.
pub fn session_duration(mode: TimerMode, settings: &TimerSettings, task: Option<&Task>) -> u64 {
    task.and_then(|task| task_override(task, mode))
        .unwrap_or_else(|| settings.duration_for(mode))
}

/// Time an idle timer should show.
///
/// In focus mode with a selected task, a positive remaining time remembered
/// for that task wins over a fresh session.
pub fn idle_duration(state: &TimerState, settings: &TimerSettings, task: Option<&Task>) -> u64 {
    if state.mode == TimerMode::Focus {
        let paused = state
            .selected_task_id
            .as_ref()
            .and_then(|id| state.paused_task_times.get(id))
            .copied()
            .filter(|secs| *secs > 0);
        if let Some(secs) = paused {
            return secs;
        }
    }
    session_duration(state.mode, settings, task)
}

/// Break kind following the focus session that brought the count to `cycle`.
pub fn next_break_mode(cycle: u32) -> TimerMode {
    if cycle > 0 && cycle % LONG_BREAK_INTERVAL == 0 {
        TimerMode::LongBreak
    } else {
        TimerMode::ShortBreak
    }
}

/// Minutes credited to the session log for one completed focus session.
///
/// A valid task override is logged as given, fractions included. The settings
/// fallback is rounded to whole minutes.
pub fn session_minutes(settings: &TimerSettings, task: Option<&Task>) -> f64 {
    task.filter(|task| task_override(task, TimerMode::Focus).is_some())
        .and_then(|task| task.override_minutes(TimerMode::Focus))
        .unwrap_or_else(|| (settings.focus_duration as f64 / 60.0).round())
}

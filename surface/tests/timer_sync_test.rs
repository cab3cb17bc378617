//! Integration tests for the engine and its surfaces sharing one store.
//!
//! Each test runs a real engine task and one or more clients on a paused
//! tokio clock, so a 60 second focus session finishes instantly.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pomosync_engine::alerts::RecordingNotifier;
use pomosync_engine::config::EngineConfig;
use pomosync_engine::session_log::SessionLog;
use pomosync_engine::settings::SettingsRepository;
use pomosync_engine::store::keys;
use pomosync_engine::tasks::TaskDirectory;
use pomosync_engine::types::{SessionLogEntry, Task, TimerMode, TimerSettings, TimerState};
use pomosync_engine::{EngineRuntime, Scope, Store, TimerEngine};
use pomosync_surface::config::SurfaceConfig;
use pomosync_surface::facade::TimerClient;

// =============================================================================
// Test Helpers
// =============================================================================

struct Fixture {
    store: Store,
    notifier: Arc<RecordingNotifier>,
    runtime: EngineRuntime,
    client: TimerClient,
}

/// Settings with one-minute focus sessions and short breaks.
fn quick_settings() -> TimerSettings {
    TimerSettings {
        focus_duration: 60,
        short_break_duration: 30,
        long_break_duration: 90,
        ..TimerSettings::default()
    }
}

async fn start_fixture(settings: TimerSettings, config: EngineConfig) -> Fixture {
    let store = Store::in_memory();
    SettingsRepository::new(store.clone())
        .save(&settings)
        .await
        .unwrap();
    store
        .set(
            Scope::Local,
            keys::TIMER_STATE,
            &TimerState {
                time: settings.focus_duration,
                ..TimerState::default()
            },
        )
        .await
        .unwrap();

    let notifier = Arc::new(RecordingNotifier::new());
    let runtime = TimerEngine::spawn(store.clone(), notifier.clone(), config);
    let client = TimerClient::new(store.clone(), runtime.handle(), SurfaceConfig::default());
    client.load().await.unwrap();

    Fixture {
        store,
        notifier,
        runtime,
        client,
    }
}

async fn stored_state(store: &Store) -> TimerState {
    store
        .get(Scope::Local, keys::TIMER_STATE)
        .await
        .unwrap()
        .unwrap()
}

async fn add_task(store: &Store, task: Task) -> Task {
    TaskDirectory::new(store.clone()).add(task).await.unwrap()
}

async fn wait(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

// =============================================================================
// Session Lifecycle
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_full_focus_session_with_task() {
    let fx = start_fixture(quick_settings(), EngineConfig::default()).await;
    let mut task = Task::new("Essay", "School");
    task.pomodoro_count = 1;
    let task = add_task(&fx.store, task).await;

    fx.client.select_task(Some(task.id.clone())).await.unwrap();
    fx.client.start().await.unwrap();
    wait(62).await;

    let state = stored_state(&fx.store).await;
    assert_eq!(state.mode, TimerMode::ShortBreak);
    assert_eq!(state.time, 30);
    assert!(!state.is_running, "breaks do not auto-start by default");
    assert_eq!(state.pomodoros, 1);
    assert_eq!(state.cycle, 1);
    assert_eq!(state.focus_seconds, 60);
    assert!(state.paused_task_times.is_empty());

    let task = TaskDirectory::new(fx.store.clone())
        .get(&task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.completed_pomodoros, 1);
    assert!(task.completed, "reaching the planned count completes the task");

    let entries = SessionLog::with_default_capacity(fx.store.clone())
        .entries()
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].task_id, task.id);
    assert_eq!(entries[0].minutes, 1.0);

    let notifications = fx.notifier.notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].title, "Focus Session Complete! 🎉");

    assert_eq!(fx.client.state(), Some(state));
    assert!(!fx.runtime.engine().is_chain_active());
}

#[tokio::test(start_paused = true)]
async fn test_anonymous_session_is_logged() {
    let fx = start_fixture(quick_settings(), EngineConfig::default()).await;

    fx.client.start().await.unwrap();
    wait(62).await;

    let entries = SessionLog::with_default_capacity(fx.store.clone())
        .entries()
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].is_anonymous());
    assert_eq!(entries[0].title, "Anonymous Focus Session");
}

#[tokio::test(start_paused = true)]
async fn test_auto_start_runs_into_break() {
    let settings = TimerSettings {
        auto_start_breaks: true,
        ..quick_settings()
    };
    let fx = start_fixture(settings, EngineConfig::default()).await;

    fx.client.start().await.unwrap();
    wait(62).await;

    let state = stored_state(&fx.store).await;
    assert_eq!(state.mode, TimerMode::ShortBreak);
    assert!(state.is_running);
    assert!(state.time < 30, "break is already counting down");

    wait(30).await;
    let state = stored_state(&fx.store).await;
    assert_eq!(state.mode, TimerMode::Focus);
    assert_eq!(state.time, 60);
    assert!(!state.is_running);
    assert_eq!(fx.notifier.notifications()[1].title, "Break Complete! ⚡");
}

#[tokio::test(start_paused = true)]
async fn test_fourth_focus_session_earns_long_break() {
    let fx = start_fixture(quick_settings(), EngineConfig::default()).await;
    fx.store
        .set(
            Scope::Local,
            keys::TIMER_STATE,
            &TimerState {
                time: 3,
                is_running: true,
                cycle: 3,
                pomodoros: 3,
                ..TimerState::default()
            },
        )
        .await
        .unwrap();
    wait(5).await;

    let state = stored_state(&fx.store).await;
    assert_eq!(state.mode, TimerMode::LongBreak);
    assert_eq!(state.time, 90);
    assert_eq!(state.cycle, 4);
    assert_eq!(state.pomodoros, 4);
    assert!(!state.is_running);
}

#[tokio::test(start_paused = true)]
async fn test_skip_break_leaves_log_unchanged() {
    let fx = start_fixture(quick_settings(), EngineConfig::default()).await;
    fx.client.start().await.unwrap();
    wait(62).await;
    assert_eq!(fx.client.state().unwrap().mode, TimerMode::ShortBreak);

    fx.client.skip_break().await.unwrap();

    let state = stored_state(&fx.store).await;
    assert_eq!(state.mode, TimerMode::Focus);
    assert_eq!(state.time, 60);
    assert_eq!(state.pomodoros, 1);
    let entries = SessionLog::with_default_capacity(fx.store.clone())
        .entries()
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(fx.notifier.notifications().len(), 1);
}

// =============================================================================
// Task Overrides
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_task_focus_override_with_settings_break() {
    let fx = start_fixture(quick_settings(), EngineConfig::default()).await;
    let mut task = Task::new("Deep work", "Research");
    task.pomodoro_duration = Some(2.0);
    let task = add_task(&fx.store, task).await;

    fx.client.select_task(Some(task.id.clone())).await.unwrap();
    assert_eq!(fx.client.state().unwrap().time, 120);

    fx.client.start().await.unwrap();
    wait(122).await;

    let state = stored_state(&fx.store).await;
    assert_eq!(state.mode, TimerMode::ShortBreak);
    assert_eq!(state.time, 30, "break length comes from settings");

    let entries = SessionLog::with_default_capacity(fx.store.clone())
        .entries()
        .await
        .unwrap();
    assert_eq!(entries[0].minutes, 2.0);
    assert_eq!(entries[0].project, "Research");
}

#[tokio::test(start_paused = true)]
async fn test_switching_tasks_keeps_each_tasks_time() {
    let fx = start_fixture(TimerSettings::default(), EngineConfig::default()).await;
    let first = add_task(&fx.store, Task::new("First", "A")).await;
    let mut second = Task::new("Second", "B");
    second.pomodoro_duration = Some(10.0);
    let second = add_task(&fx.store, second).await;

    fx.client.select_task(Some(first.id.clone())).await.unwrap();
    fx.client.start().await.unwrap();
    wait(5).await;

    fx.client.select_task(Some(second.id.clone())).await.unwrap();
    let state = stored_state(&fx.store).await;
    assert!(!state.is_running, "switching tasks pauses the timer");
    assert_eq!(state.time, 600);
    let first_left = state.paused_task_times[&first.id];
    assert!(first_left < 1500 && first_left >= 1494, "got {first_left}");

    fx.client.select_task(Some(first.id.clone())).await.unwrap();
    assert_eq!(stored_state(&fx.store).await.time, first_left);

    fx.client.select_task(None).await.unwrap();
    assert_eq!(stored_state(&fx.store).await.time, 1500);
}

// =============================================================================
// Reset And Log Capacity
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_reset_during_short_break() {
    let fx = start_fixture(quick_settings(), EngineConfig::default()).await;
    fx.store
        .set(
            Scope::Local,
            keys::TIMER_STATE,
            &TimerState {
                mode: TimerMode::ShortBreak,
                time: 12,
                is_running: true,
                pomodoros: 1,
                cycle: 1,
                ..TimerState::default()
            },
        )
        .await
        .unwrap();
    fx.client.load().await.unwrap();
    wait(3).await;

    fx.client.reset().await.unwrap();

    let state = fx.client.state().unwrap();
    assert_eq!(state.mode, TimerMode::ShortBreak);
    assert_eq!(state.time, 30);
    assert!(!state.is_running);
    assert_eq!(state.pomodoros, 1);
    assert_eq!(stored_state(&fx.store).await, state);

    wait(5).await;
    assert_eq!(stored_state(&fx.store).await.time, 30, "reset stops ticking");
}

#[tokio::test(start_paused = true)]
async fn test_session_log_drops_oldest_at_capacity() {
    let config = EngineConfig {
        session_log_capacity: 3,
        ..EngineConfig::default()
    };
    let fx = start_fixture(quick_settings(), config).await;
    let log = SessionLog::new(fx.store.clone(), 3);
    for minutes in [11.0, 12.0, 13.0] {
        log.append(SessionLogEntry::anonymous(minutes, Utc::now()))
            .await
            .unwrap();
    }

    fx.client.start().await.unwrap();
    wait(62).await;

    let minutes: Vec<f64> = log.entries().await.unwrap().iter().map(|e| e.minutes).collect();
    assert_eq!(minutes, vec![12.0, 13.0, 1.0]);
}

// =============================================================================
// Multiple Surfaces
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_two_surfaces_follow_the_same_timer() {
    let fx = start_fixture(quick_settings(), EngineConfig::default()).await;
    let popup = TimerClient::new(fx.store.clone(), fx.runtime.handle(), SurfaceConfig::default());
    popup.load().await.unwrap();

    popup.start().await.unwrap();
    wait(10).await;

    let full_page = fx.client.state().unwrap();
    let popup_state = popup.state().unwrap();
    assert!(full_page.is_running);
    assert_eq!(full_page.time, popup_state.time);
    assert!(full_page.time <= 51);

    fx.client.pause().await.unwrap();
    fx.client.flush_writes().await;
    wait(1).await;

    let popup_state = popup.state().unwrap();
    assert!(!popup_state.is_running);
    let frozen = popup_state.time;
    wait(5).await;
    assert_eq!(popup.state().unwrap().time, frozen);
}

#[tokio::test(start_paused = true)]
async fn test_timer_keeps_running_without_surfaces() {
    let fx = start_fixture(quick_settings(), EngineConfig::default()).await;
    fx.client.start().await.unwrap();
    fx.client.flush_writes().await;
    drop(fx.client);

    wait(20).await;

    let state = stored_state(&fx.store).await;
    assert!(state.is_running);
    assert!(state.time <= 41);
}

#[tokio::test(start_paused = true)]
async fn test_settings_change_from_another_surface_reaches_idle_view() {
    let fx = start_fixture(quick_settings(), EngineConfig::default()).await;

    SettingsRepository::new(fx.store.clone())
        .save(&TimerSettings {
            focus_duration: 45 * 60,
            ..quick_settings()
        })
        .await
        .unwrap();
    wait(1).await;

    let view = fx.client.view();
    assert_eq!(view.settings.unwrap().focus_duration, 2700);
    assert_eq!(view.state.unwrap().time, 2700);
    assert_eq!(stored_state(&fx.store).await.time, 2700);
}

//! The background timer engine.
//!
//! The engine is the only component that advances time. It owns the wake
//! chain, performs session-completion transitions, credits tasks, appends to
//! the session log and raises alerts. Surfaces talk to it through
//! [`EngineHandle`] requests and through the shared [`Store`].
//!
//! # Architecture
//!
//! [`TimerEngine::spawn`] starts a single task that serves, through one
//! `tokio::select!` loop:
//!
//! - wakes from the [`WakeScheduler`] (one tick each)
//! - requests from [`EngineHandle`]s
//! - the store's change feed (reactive start/stop, settings reconciliation)
//!
//! so every engine mutation is serialized.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use pomosync_engine::alerts::TracingNotifier;
//! use pomosync_engine::config::EngineConfig;
//! use pomosync_engine::engine::TimerEngine;
//! use pomosync_engine::store::Store;
//!
//! # tokio_test::block_on(async {
//! let runtime = TimerEngine::spawn(Store::in_memory(), Arc::new(TracingNotifier), EngineConfig::default());
//! let state = runtime.handle().get_timer_state().await.unwrap();
//! assert!(!state.is_running);
//! runtime.shutdown().await;
//! # });
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::alarm::{Wake, WakeScheduler};
use crate::alerts::{Badge, BadgeThrottle, Notification, Notifier};
use crate::config::EngineConfig;
use crate::durations;
use crate::error::{Result, StoreError};
use crate::messages::{
    Ack, EngineHandle, PendingRequest, TimerRequest, TimerResponse, DEFAULT_REQUEST_TIMEOUT,
};
use crate::session_log::SessionLog;
use crate::settings::SettingsRepository;
use crate::store::{keys, Scope, StorageChange, Store};
use crate::tasks::TaskDirectory;
use crate::types::{SessionLogEntry, Task, TimerMode, TimerSettings, TimerState};

/// What a wake did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Superseded by a later schedule or a cancel; nothing happened.
    Stale,
    /// The timer was not running; the chain has been stopped.
    Idle,
    /// One second elapsed.
    Ticked(TimerState),
    /// The session ended; carries the state of the next session.
    Completed(TimerState),
    /// The timer state could not be read or written; the chain has been stopped.
    Failed,
}

enum TickStep {
    Idle,
    Ticked(TimerState),
    Finished(TimerState),
}

pub struct TimerEngine {
    store: Store,
    settings: SettingsRepository,
    tasks: TaskDirectory,
    session_log: SessionLog,
    alarm: WakeScheduler,
    notifier: Arc<dyn Notifier>,
    badge: Mutex<BadgeThrottle>,
    chain_active: AtomicBool,
    config: EngineConfig,
}

impl std::fmt::Debug for TimerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerEngine")
            .field("chain_active", &self.is_chain_active())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TimerEngine {
    pub fn new(
        store: Store,
        alarm: WakeScheduler,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        Self {
            settings: SettingsRepository::new(store.clone()),
            tasks: TaskDirectory::new(store.clone()),
            session_log: SessionLog::new(store.clone(), config.session_log_capacity),
            badge: Mutex::new(BadgeThrottle::new(config.badge_throttle)),
            chain_active: AtomicBool::new(false),
            store,
            alarm,
            notifier,
            config,
        }
    }

    /// Starts the engine task and returns its runtime handle.
    ///
    /// Seeds missing settings and state, then resumes ticking if the stored
    /// state says the timer is running. Must be called within a tokio runtime.
    pub fn spawn(store: Store, notifier: Arc<dyn Notifier>, config: EngineConfig) -> EngineRuntime {
        let (alarm, wakes) = WakeScheduler::new();
        let (handle, requests) = EngineHandle::channel(DEFAULT_REQUEST_TIMEOUT);
        // Subscribe before the task starts so no early write is missed.
        let changes = store.subscribe();
        let engine = Arc::new(Self::new(store, alarm, notifier, config));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(Arc::clone(&engine).run(wakes, requests, changes, shutdown_rx));
        info!("Timer engine started");

        EngineRuntime {
            engine,
            handle,
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether the wake chain is active.
    pub fn is_chain_active(&self) -> bool {
        self.chain_active.load(Ordering::SeqCst)
    }

    /// Whether a wake is currently pending.
    pub fn has_pending_wake(&self) -> bool {
        self.alarm.is_scheduled()
    }

    /// Seeds default settings and state where none are stored.
    pub async fn on_install(&self) -> Result<()> {
        self.settings.seed_defaults().await?;
        if self
            .store
            .get_raw(Scope::Local, keys::TIMER_STATE)
            .await?
            .is_none()
        {
            self.persist_state(&TimerState::default()).await?;
            info!("Seeded initial timer state");
        }
        Ok(())
    }

    /// Activates the chain and schedules the first wake.
    pub fn start_chain(&self) {
        self.chain_active.store(true, Ordering::SeqCst);
        let generation = self.alarm.schedule(self.config.tick_interval);
        debug!(generation, "Wake chain started");
    }

    /// Deactivates the chain and cancels any pending wake.
    pub fn stop_chain(&self) {
        let was_active = self.chain_active.swap(false, Ordering::SeqCst);
        self.alarm.cancel();
        if was_active {
            debug!("Wake chain stopped");
        }
    }

    /// Handles one wake: ticks, then re-arms while the chain is active.
    pub async fn handle_wake(&self, wake: Wake) -> TickOutcome {
        if !self.alarm.is_current(wake) {
            trace!(generation = wake.generation, "Ignoring stale wake");
            return TickOutcome::Stale;
        }

        let outcome = match self.tick().await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(error = %err, "Timer tick failed, stopping wake chain");
                self.stop_chain();
                return TickOutcome::Failed;
            }
        };

        if self.is_chain_active() {
            self.alarm.schedule(self.config.tick_interval);
        }
        outcome
    }

    /// Advances the stored timer by one second.
    ///
    /// A timer that is absent, not running, or already at zero is left
    /// untouched and stops the chain.
    pub async fn tick(&self) -> Result<TickOutcome> {
        let step = self
            .store
            .update(Scope::Local, keys::TIMER_STATE, |state: Option<TimerState>| {
                match state {
                    Some(mut state) if state.is_running && state.time > 0 => {
                        if state.tick() {
                            // Completion persists the next session instead.
                            (None, TickStep::Finished(state))
                        } else {
                            (Some(state.clone()), TickStep::Ticked(state))
                        }
                    }
                    _ => (None, TickStep::Idle),
                }
            })
            .await?;

        match step {
            TickStep::Idle => {
                debug!("Wake with idle timer, stopping wake chain");
                self.stop_chain();
                Ok(TickOutcome::Idle)
            }
            TickStep::Ticked(state) => {
                trace!(time = state.time, mode = %state.mode, "Tick");
                self.refresh_badge(&state, false);
                Ok(TickOutcome::Ticked(state))
            }
            TickStep::Finished(state) => {
                let next = self.complete_session(state).await?;
                Ok(TickOutcome::Completed(next))
            }
        }
    }

    /// Moves a finished session on to the next one and persists it.
    async fn complete_session(&self, finished: TimerState) -> Result<TimerState> {
        let settings = self.settings.load().await;
        let now = Utc::now();
        let mut next = finished.clone();
        next.is_running = false;

        match finished.mode {
            TimerMode::Focus => {
                next.pomodoros += 1;
                next.cycle += 1;

                let task = match finished.selected_task_id.as_deref() {
                    Some(task_id) => {
                        next.paused_task_times.remove(task_id);
                        self.credit_task(task_id, now).await
                    }
                    None => None,
                };
                self.log_session(&settings, task.as_ref(), now).await;

                next.mode = durations::next_break_mode(next.cycle);
                next.time = durations::session_duration(next.mode, &settings, task.as_ref());
                if settings.notifications {
                    self.notify(&Notification::focus_complete(next.pomodoros));
                }
                next.is_running = settings.auto_start_breaks;
            }
            TimerMode::ShortBreak | TimerMode::LongBreak => {
                let task = self.selected_task(&finished).await;
                next.mode = TimerMode::Focus;
                next.time = durations::session_duration(TimerMode::Focus, &settings, task.as_ref());
                if settings.notifications {
                    self.notify(&Notification::break_complete());
                }
                next.is_running = settings.auto_start_pomodoros;
            }
        }

        self.persist_state(&next).await?;
        if !next.is_running {
            self.stop_chain();
        }
        self.refresh_badge(&next, true);

        info!(
            finished = %finished.mode,
            next = %next.mode,
            pomodoros = next.pomodoros,
            cycle = next.cycle,
            auto_started = next.is_running,
            "Session complete"
        );
        Ok(next)
    }

    /// Credits the selected task, falling back to a plain lookup on failure.
    async fn credit_task(&self, task_id: &str, now: DateTime<Utc>) -> Option<Task> {
        match self.tasks.record_completed_pomodoro(task_id, now).await {
            Ok(Some(task)) => {
                debug!(task_id, completed_pomodoros = task.completed_pomodoros, "Credited task");
                Some(task)
            }
            Ok(None) => {
                warn!(task_id, "Selected task no longer exists");
                None
            }
            Err(err) => {
                warn!(task_id, error = %err, "Could not credit task");
                self.tasks.get(task_id).await.ok().flatten()
            }
        }
    }

    async fn log_session(&self, settings: &TimerSettings, task: Option<&Task>, now: DateTime<Utc>) {
        let minutes = durations::session_minutes(settings, task);
        let entry = match task {
            Some(task) => SessionLogEntry::for_task(task, minutes, now),
            None => SessionLogEntry::anonymous(minutes, now),
        };
        if let Err(err) = self.session_log.append(entry).await {
            warn!(error = %err, "Could not append session log entry");
        }
    }

    async fn selected_task(&self, state: &TimerState) -> Option<Task> {
        let task_id = state.selected_task_id.as_deref()?;
        match self.tasks.get(task_id).await {
            Ok(task) => task,
            Err(err) => {
                warn!(task_id, error = %err, "Could not read selected task");
                None
            }
        }
    }

    /// Reacts to a write made by anyone, the engine included.
    pub async fn on_storage_change(&self, change: &StorageChange) {
        if change.is(Scope::Local, keys::TIMER_STATE) {
            let running = change
                .new_as::<TimerState>()
                .is_some_and(|state| state.is_running);
            self.sync_chain(running);
        } else if change.is(Scope::Sync, keys::TIMER_SETTINGS) {
            let settings = change.new_as::<TimerSettings>().unwrap_or_default();
            if let Err(err) = self.reconcile_idle_settings(&settings).await {
                warn!(error = %err, "Could not apply new settings to idle timer");
            }
        }
    }

    /// Starts or stops the chain to match the stored running flag.
    fn sync_chain(&self, running: bool) {
        match (running, self.is_chain_active()) {
            (true, false) => self.start_chain(),
            (false, true) => self.stop_chain(),
            _ => {}
        }
    }

    /// Re-reads the stored state after missed change notifications.
    async fn resync(&self) {
        match self.load_state().await {
            Ok(state) => self.sync_chain(state.is_some_and(|s| s.is_running)),
            Err(err) => warn!(error = %err, "Could not re-read timer state"),
        }
    }

    /// Rewrites an idle timer's remaining time for new settings.
    ///
    /// Returns `true` if the stored state changed.
    pub async fn reconcile_idle_settings(&self, settings: &TimerSettings) -> Result<bool> {
        let Some(mut state) = self.load_state().await? else {
            return Ok(false);
        };
        if state.is_running {
            return Ok(false);
        }

        let task = self.selected_task(&state).await;
        let expected = durations::idle_duration(&state, settings, task.as_ref());
        if expected == state.time {
            return Ok(false);
        }

        debug!(from = state.time, to = expected, mode = %state.mode, "Reconciled idle timer");
        state.time = expected;
        self.persist_state(&state).await?;
        self.refresh_badge(&state, true);
        Ok(true)
    }

    /// Resumes ticking after a restart if the timer was left running.
    pub async fn resume_if_running(&self) -> Result<bool> {
        let running = self.load_state().await?.is_some_and(|state| state.is_running);
        if running && !self.is_chain_active() {
            info!("Resuming running timer");
            self.start_chain();
        }
        Ok(running)
    }

    /// The stored state, or defaults when none is stored.
    pub async fn get_state(&self) -> Result<TimerState> {
        Ok(self.load_state().await?.unwrap_or_default())
    }

    /// Replaces the stored state.
    pub async fn update_state(&self, state: &TimerState) -> Result<()> {
        self.persist_state(state).await?;
        Ok(())
    }

    /// Stops the timer and rewinds the current mode to its full length.
    pub async fn reset(&self) -> Result<TimerState> {
        let mut state = self.get_state().await?;
        let settings = self.settings.load().await;
        let task = self.selected_task(&state).await;

        state.time = durations::session_duration(state.mode, &settings, task.as_ref());
        state.is_running = false;
        if let Some(task_id) = state.selected_task_id.as_deref() {
            state.paused_task_times.remove(task_id);
        }

        self.persist_state(&state).await?;
        self.stop_chain();
        self.refresh_badge(&state, true);
        info!(mode = %state.mode, time = state.time, "Timer reset");
        Ok(state)
    }

    /// Serves one request. `None` means the request goes unanswered.
    pub async fn handle_request(&self, request: TimerRequest) -> Option<TimerResponse> {
        match request {
            TimerRequest::GetTimerState => match self.get_state().await {
                Ok(state) => Some(TimerResponse::State(state)),
                Err(err) => {
                    error!(error = %err, "Could not read timer state for request");
                    None
                }
            },
            TimerRequest::UpdateTimerState { state } => {
                Some(TimerResponse::Ack(ack(self.update_state(&state).await, "update")))
            }
            TimerRequest::ResetTimer => {
                Some(TimerResponse::Ack(ack(self.reset().await.map(|_| ()), "reset")))
            }
        }
    }

    async fn load_state(&self) -> std::result::Result<Option<TimerState>, StoreError> {
        self.store.get(Scope::Local, keys::TIMER_STATE).await
    }

    async fn persist_state(&self, state: &TimerState) -> std::result::Result<(), StoreError> {
        self.store.set(Scope::Local, keys::TIMER_STATE, state).await
    }

    fn notify(&self, notification: &Notification) {
        if let Err(err) = self.notifier.show_notification(notification) {
            warn!(error = %err, title = %notification.title, "Could not show notification");
        }
    }

    fn refresh_badge(&self, state: &TimerState, force: bool) {
        {
            let mut throttle = self.badge.lock().unwrap_or_else(PoisonError::into_inner);
            if force {
                throttle.force();
            } else if !throttle.try_acquire() {
                return;
            }
        }
        if let Err(err) = self.notifier.set_badge(&Badge::for_state(state)) {
            warn!(error = %err, "Could not update badge");
        }
    }

    async fn run(
        self: Arc<Self>,
        mut wakes: mpsc::Receiver<Wake>,
        mut requests: mpsc::Receiver<PendingRequest>,
        mut changes: broadcast::Receiver<StorageChange>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        if let Err(err) = self.on_install().await {
            warn!(error = %err, "Could not seed initial data");
        }
        if let Err(err) = self.resume_if_running().await {
            warn!(error = %err, "Could not check for a running timer");
        }

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("Engine shutdown requested");
                    break;
                }

                Some(wake) = wakes.recv() => {
                    self.handle_wake(wake).await;
                }

                Some(pending) = requests.recv() => {
                    let request = pending.request().clone();
                    trace!(?request, "Serving request");
                    match self.handle_request(request).await {
                        Some(response) => pending.respond(response),
                        None => drop(pending),
                    }
                }

                change = changes.recv() => match change {
                    Ok(change) => self.on_storage_change(&change).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Engine fell behind on storage changes, re-syncing");
                        self.resync().await;
                    }
                    Err(RecvError::Closed) => {
                        debug!("Storage change feed closed");
                        break;
                    }
                },
            }
        }

        self.stop_chain();
        info!("Timer engine stopped");
    }
}

fn ack(result: Result<()>, action: &'static str) -> Ack {
    match result {
        Ok(()) => Ack::OK,
        Err(err) => {
            error!(error = %err, action, "Request failed");
            Ack::FAILED
        }
    }
}

/// A running engine task.
///
/// Dropping the runtime stops the engine.
#[derive(Debug)]
pub struct EngineRuntime {
    engine: Arc<TimerEngine>,
    handle: EngineHandle,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl EngineRuntime {
    /// A new handle for sending requests to the engine.
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub fn engine(&self) -> &Arc<TimerEngine> {
        &self.engine
    }

    /// Stops the engine task and waits for it to finish.
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(err) = (&mut self.task).await {
            warn!(error = %err, "Engine task ended abnormally");
        }
    }
}

impl Drop for EngineRuntime {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

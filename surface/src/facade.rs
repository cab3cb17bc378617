//! Per-surface timer client.
//!
//! A [`TimerClient`] gives one surface an observable [`ClientView`] of the
//! shared timer and turns user intents into store writes. It never advances
//! time itself; the engine does that and the client follows along through the
//! store's change feed.
//!
//! # Write paths
//!
//! - Start and pause update the view at once and persist through a
//!   write-behind [`Debouncer`], so a burst of clicks costs one write.
//! - Every other intent persists directly, after any queued write-behind
//!   value has landed so the two paths never reorder.
//!
//! # Read path
//!
//! After the first [`TimerClient::load`] the client follows the change feed.
//! Timer state changes pass through a second debouncer before reaching the
//! view; settings changes reload settings and re-derive an idle timer's time.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use pomosync_engine::alerts::TracingNotifier;
//! use pomosync_engine::config::EngineConfig;
//! use pomosync_engine::{Store, TimerEngine};
//! use pomosync_surface::config::SurfaceConfig;
//! use pomosync_surface::facade::TimerClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Store::in_memory();
//!     let engine = TimerEngine::spawn(store.clone(), Arc::new(TracingNotifier), EngineConfig::default());
//!     let client = TimerClient::new(store, engine.handle(), SurfaceConfig::default());
//!
//!     client.load().await?;
//!     client.start().await?;
//!     client.flush_writes().await;
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use pomosync_engine::durations;
use pomosync_engine::settings::{SettingsPatch, SettingsRepository};
use pomosync_engine::store::{keys, Scope, StorageChange, Store};
use pomosync_engine::tasks::TaskDirectory;
use pomosync_engine::types::{Task, TimerMode, TimerSettings, TimerState, Todo};
use pomosync_engine::EngineHandle;

use crate::config::SurfaceConfig;
use crate::debounce::Debouncer;
use crate::error::{Result, SurfaceError};

/// Capacity of the channels between the debouncers and their consumers.
const DEBOUNCE_OUTPUT_CAPACITY: usize = 16;

/// What a surface renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientView {
    /// Latest known timer state; `None` until the first load succeeds.
    pub state: Option<TimerState>,
    pub settings: Option<TimerSettings>,
    pub is_loading: bool,
    /// Short description of the last failed operation.
    pub error: Option<String>,
}

impl Default for ClientView {
    fn default() -> Self {
        Self {
            state: None,
            settings: None,
            is_loading: true,
            error: None,
        }
    }
}

type StateWrite = (u64, TimerState);

struct ClientInner {
    store: Store,
    engine: EngineHandle,
    settings: SettingsRepository,
    tasks: TaskDirectory,
    config: SurfaceConfig,
    view: watch::Sender<ClientView>,
    writes: Debouncer<&'static str, StateWrite>,
    // Sequence numbers of queued and persisted write-behind values.
    queued: AtomicU64,
    written: Arc<watch::Sender<u64>>,
    listening: AtomicBool,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let listeners = self
            .listeners
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.drain(..) {
            listener.abort();
        }
    }
}

/// One surface's handle on the shared timer.
///
/// Clones share the same view, debouncers and subscription.
#[derive(Clone)]
pub struct TimerClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for TimerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerClient")
            .field("view", &*self.inner.view.borrow())
            .field("listening", &self.inner.listening.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl TimerClient {
    /// Creates a client. Must be called within a tokio runtime.
    pub fn new(store: Store, engine: EngineHandle, config: SurfaceConfig) -> Self {
        let engine = engine.with_timeout(config.request_timeout);
        let (write_tx, write_rx) = mpsc::channel(DEBOUNCE_OUTPUT_CAPACITY);
        let writes = Debouncer::new(config.write_debounce, write_tx);
        let (written, _) = watch::channel(0);
        let written = Arc::new(written);
        let (view, _) = watch::channel(ClientView::default());

        let inner = Arc::new(ClientInner {
            settings: SettingsRepository::new(store.clone()),
            tasks: TaskDirectory::new(store.clone()),
            store: store.clone(),
            engine,
            config,
            view,
            writes,
            queued: AtomicU64::new(0),
            written: Arc::clone(&written),
            listening: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
        });

        tokio::spawn(persist_write_behind(
            store,
            write_rx,
            written,
            Arc::downgrade(&inner),
        ));

        Self { inner }
    }

    /// Subscribes to view updates.
    pub fn subscribe(&self) -> watch::Receiver<ClientView> {
        self.inner.view.subscribe()
    }

    /// Snapshot of the current view.
    pub fn view(&self) -> ClientView {
        self.inner.view.borrow().clone()
    }

    /// Latest known timer state, if loaded.
    pub fn state(&self) -> Option<TimerState> {
        self.inner.view.borrow().state.clone()
    }

    /// Whether this client follows the store's change feed.
    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::SeqCst)
    }

    /// Loads settings and state, then starts following changes.
    ///
    /// Repeated loads refresh the view but never subscribe twice.
    pub async fn load(&self) -> Result<()> {
        self.inner.view.send_modify(|view| {
            view.is_loading = true;
            view.error = None;
        });

        let settings = self.fetch_settings().await;
        let state = match self.inner.engine.get_timer_state().await {
            Ok(state) => state,
            Err(err) => {
                error!(error = %err, "Failed to load timer state");
                self.inner.view.send_modify(|view| {
                    view.is_loading = false;
                    view.error = Some("Failed to load timer state".to_string());
                });
                return Err(err.into());
            }
        };

        let state = self.reconcile_idle(state, &settings).await?;
        self.inner.view.send_modify(|view| {
            view.state = Some(state);
            view.is_loading = false;
        });

        self.ensure_listening();
        Ok(())
    }

    /// Reloads settings and re-derives an idle timer's time from them.
    pub async fn load_settings(&self) -> Result<()> {
        let settings = self.fetch_settings().await;
        let Some(state) = self.state() else {
            return Ok(());
        };
        let state = self.reconcile_idle(state, &settings).await?;
        self.publish_state(state);
        Ok(())
    }

    /// Starts the timer.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.loaded_state()?;
        state.is_running = true;
        self.write_behind(state, "Failed to start timer").await
    }

    /// Pauses the timer, remembering the selected task's remaining time.
    pub async fn pause(&self) -> Result<()> {
        let mut state = self.loaded_state()?;
        state.remember_paused_time();
        state.is_running = false;
        self.write_behind(state, "Failed to pause timer").await
    }

    /// Asks the engine to rewind the current mode, then reloads.
    pub async fn reset(&self) -> Result<()> {
        self.flush_writes().await;
        match self.inner.engine.reset_timer().await {
            Ok(ack) if ack.success => {}
            Ok(_) => return self.fail("Failed to reset timer", SurfaceError::Rejected),
            Err(err) => return self.fail("Failed to reset timer", err),
        }
        self.load().await
    }

    /// Ends a break early. Counters and the session log are left alone.
    pub async fn skip_break(&self) -> Result<()> {
        let state = self.loaded_state()?;
        if !state.mode.is_break() {
            return Ok(());
        }

        let settings = self.inner.settings.load().await;
        let task = self.lookup_task(state.selected_task_id.as_deref()).await;
        let next = TimerState {
            mode: TimerMode::Focus,
            time: durations::session_duration(TimerMode::Focus, &settings, task.as_ref()),
            is_running: false,
            ..state
        };
        self.commit(next, "Failed to skip break").await
    }

    /// Attributes the timer to another task, or to none.
    ///
    /// A running focus session's remaining time is kept for the outgoing task.
    /// The timer is always left paused.
    pub async fn select_task(&self, task_id: Option<String>) -> Result<()> {
        let state = self.loaded_state()?;
        let mut next = state.clone();
        if state.is_running {
            next.remember_paused_time();
        }
        next.selected_task_id = task_id;

        let task = self.lookup_task(next.selected_task_id.as_deref()).await;
        let settings = self.current_settings();
        next.time = match next.mode {
            TimerMode::Focus => durations::idle_duration(&next, &settings, task.as_ref()),
            mode => task
                .as_ref()
                .and_then(|task| durations::task_override(task, mode))
                .unwrap_or(next.time),
        };
        next.is_running = false;

        debug!(task_id = ?next.selected_task_id, time = next.time, "Selected task");
        self.commit(next, "Failed to set selected task").await
    }

    /// Merges and stores new settings.
    pub async fn update_settings(&self, patch: SettingsPatch) -> Result<()> {
        let mut settings = self.inner.settings.load().await;
        patch.apply(&mut settings);
        if let Err(err) = self.inner.settings.save(&settings).await {
            return self.fail("Failed to update settings", err);
        }
        self.inner
            .view
            .send_modify(|view| view.settings = Some(settings.clone()));

        if !patch.touches_durations() {
            return Ok(());
        }
        if let Some(state) = self.state() {
            let state = self.reconcile_idle(state, &settings).await?;
            self.publish_state(state);
        }
        Ok(())
    }

    /// Adds a to-do. Blank text is ignored.
    pub async fn add_todo(&self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let mut state = self.loaded_state()?;
        state.todos.push(Todo::new(text));
        self.commit(state, "Failed to add todo").await
    }

    pub async fn toggle_todo(&self, id: &str) -> Result<()> {
        let mut state = self.loaded_state()?;
        let Some(todo) = state.todos.iter_mut().find(|todo| todo.id == id) else {
            return Ok(());
        };
        todo.toggle(Utc::now());
        self.commit(state, "Failed to toggle todo").await
    }

    pub async fn delete_todo(&self, id: &str) -> Result<()> {
        let mut state = self.loaded_state()?;
        let before = state.todos.len();
        state.todos.retain(|todo| todo.id != id);
        if state.todos.len() == before {
            return Ok(());
        }
        self.commit(state, "Failed to delete todo").await
    }

    /// Replaces a to-do's text. Blank text is ignored.
    pub async fn update_todo(&self, id: &str, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let mut state = self.loaded_state()?;
        let Some(todo) = state.todos.iter_mut().find(|todo| todo.id == id) else {
            return Ok(());
        };
        todo.text = text.to_string();
        self.commit(state, "Failed to update todo").await
    }

    /// Sets the daily focus goal, in seconds.
    pub async fn set_daily_goal(&self, seconds: u64) -> Result<()> {
        let mut state = self.loaded_state()?;
        state.daily_goal = seconds;
        self.commit(state, "Failed to set daily goal").await
    }

    /// Waits until every queued write-behind value has been persisted.
    pub async fn flush_writes(&self) {
        let target = self.inner.queued.load(Ordering::SeqCst);
        if *self.inner.written.borrow() >= target {
            return;
        }
        if let Err(err) = self.inner.writes.flush().await {
            warn!(error = %err, "Could not flush pending timer writes");
            return;
        }

        let mut written = self.inner.written.subscribe();
        let timed_out = tokio::time::timeout(
            self.inner.config.request_timeout,
            written.wait_for(|seq| *seq >= target),
        )
        .await
        .is_err();
        if timed_out {
            warn!(target, "Timed out waiting for pending timer writes");
        }
    }

    fn loaded_state(&self) -> Result<TimerState> {
        self.state().ok_or(SurfaceError::NotLoaded)
    }

    fn current_settings(&self) -> TimerSettings {
        self.inner.view.borrow().settings.clone().unwrap_or_default()
    }

    fn publish_state(&self, state: TimerState) {
        self.inner.view.send_modify(|view| view.state = Some(state));
    }

    /// Logs `err`, records `message` in the view and returns the error.
    fn fail<T>(&self, message: &'static str, err: impl Into<SurfaceError>) -> Result<T> {
        let err = err.into();
        error!(error = %err, "{message}");
        self.inner
            .view
            .send_modify(|view| view.error = Some(message.to_string()));
        Err(err)
    }

    async fn fetch_settings(&self) -> TimerSettings {
        let settings = self.inner.settings.load().await;
        self.inner
            .view
            .send_modify(|view| view.settings = Some(settings.clone()));
        settings
    }

    async fn lookup_task(&self, task_id: Option<&str>) -> Option<Task> {
        let task_id = task_id?;
        match self.inner.tasks.get(task_id).await {
            Ok(task) => task,
            Err(err) => {
                warn!(task_id, error = %err, "Could not read task");
                None
            }
        }
    }

    /// Brings an idle timer's time in line with settings and task overrides.
    async fn reconcile_idle(&self, state: TimerState, settings: &TimerSettings) -> Result<TimerState> {
        if state.is_running {
            return Ok(state);
        }
        let task = self.lookup_task(state.selected_task_id.as_deref()).await;
        let expected = durations::idle_duration(&state, settings, task.as_ref());
        if expected == state.time {
            return Ok(state);
        }

        debug!(from = state.time, to = expected, "Correcting idle timer");
        let next = TimerState {
            time: expected,
            ..state
        };
        self.flush_writes().await;
        if let Err(err) = self
            .inner
            .store
            .set(Scope::Local, keys::TIMER_STATE, &next)
            .await
        {
            return self.fail("Failed to update settings", err);
        }
        Ok(next)
    }

    /// Optimistically shows `state` and queues it for a debounced write.
    async fn write_behind(&self, state: TimerState, failure: &'static str) -> Result<()> {
        self.publish_state(state.clone());
        let seq = self.inner.queued.fetch_add(1, Ordering::SeqCst) + 1;
        if let Err(err) = self.inner.writes.send(keys::TIMER_STATE, (seq, state)).await {
            return self.fail(failure, err);
        }
        Ok(())
    }

    /// Persists `state` now and shows it.
    async fn commit(&self, state: TimerState, failure: &'static str) -> Result<()> {
        self.flush_writes().await;
        if let Err(err) = self
            .inner
            .store
            .set(Scope::Local, keys::TIMER_STATE, &state)
            .await
        {
            return self.fail(failure, err);
        }
        self.publish_state(state);
        Ok(())
    }

    fn ensure_listening(&self) {
        if self.inner.listening.swap(true, Ordering::SeqCst) {
            return;
        }

        let changes = self.inner.store.subscribe();
        let (state_tx, state_rx) = mpsc::channel(DEBOUNCE_OUTPUT_CAPACITY);
        let debouncer = Debouncer::new(self.inner.config.read_debounce, state_tx);
        let client = Arc::downgrade(&self.inner);

        let feed = tokio::spawn(follow_changes(client.clone(), changes, debouncer));
        let apply = tokio::spawn(apply_remote_states(client, state_rx));
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([feed, apply]);
        debug!("Following timer changes");
    }
}

/// Persists debounced start/pause intents in order.
async fn persist_write_behind(
    store: Store,
    mut writes: mpsc::Receiver<(&'static str, StateWrite)>,
    written: Arc<watch::Sender<u64>>,
    client: Weak<ClientInner>,
) {
    while let Some((key, (seq, state))) = writes.recv().await {
        match store.set(Scope::Local, key, &state).await {
            Ok(()) => trace!(seq, running = state.is_running, "Persisted timer intent"),
            Err(err) => {
                error!(error = %err, "Could not persist timer intent");
                if let Some(inner) = client.upgrade() {
                    inner
                        .view
                        .send_modify(|view| view.error = Some("Failed to save timer state".to_string()));
                }
            }
        }
        written.send_modify(|done| *done = (*done).max(seq));
    }
}

/// Routes store changes to the read-side debouncer and settings reloads.
async fn follow_changes(
    client: Weak<ClientInner>,
    mut changes: broadcast::Receiver<StorageChange>,
    debouncer: Debouncer<&'static str, TimerState>,
) {
    loop {
        let state = match changes.recv().await {
            Ok(change) if change.is(Scope::Local, keys::TIMER_STATE) => change.new_as::<TimerState>(),
            Ok(change) if change.is(Scope::Sync, keys::TIMER_SETTINGS) => {
                let Some(inner) = client.upgrade() else { break };
                // Failures are already recorded in the view.
                let _ = TimerClient { inner }.load_settings().await;
                None
            }
            Ok(_) => None,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Client fell behind on timer changes, re-reading state");
                let Some(inner) = client.upgrade() else { break };
                match inner.store.get::<TimerState>(Scope::Local, keys::TIMER_STATE).await {
                    Ok(state) => state,
                    Err(err) => {
                        warn!(error = %err, "Could not re-read timer state");
                        None
                    }
                }
            }
            Err(RecvError::Closed) => break,
        };

        if let Some(state) = state {
            if debouncer.send(keys::TIMER_STATE, state).await.is_err() {
                break;
            }
        }
    }
    trace!("Stopped following timer changes");
}

/// Applies debounced remote states to the view.
async fn apply_remote_states(
    client: Weak<ClientInner>,
    mut states: mpsc::Receiver<(&'static str, TimerState)>,
) {
    while let Some((_, state)) = states.recv().await {
        let Some(inner) = client.upgrade() else { break };
        trace!(time = state.time, running = state.is_running, "Applying remote timer state");
        inner.view.send_modify(|view| view.state = Some(state));
    }
}

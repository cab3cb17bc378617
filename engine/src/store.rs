//! Two-scope key-value store with change notifications.
//!
//! The store is the only channel through which the engine and the surfaces
//! share state. Values are JSON documents addressed by a [`Scope`] and a key.
//! Every write is announced on a broadcast channel as a [`StorageChange`],
//! including to the writer's own subscribers.
//!
//! # Architecture
//!
//! - [`StorageBackend`] - Synchronous persistence trait
//! - [`MemoryBackend`] - In-process map, used by tests and embedded hosts
//! - [`JsonFileBackend`] - One JSON file per key under `<root>/<scope>/<key>.json`
//! - [`Store`] - Clonable handle adding typed access, atomic updates and the
//!   change feed
//!
//! # Example
//!
//! ```rust
//! use pomosync_engine::store::{keys, Scope, Store};
//! use pomosync_engine::types::TimerSettings;
//!
//! # tokio_test::block_on(async {
//! let store = Store::in_memory();
//! let mut changes = store.subscribe();
//!
//! store.set(Scope::Sync, keys::TIMER_SETTINGS, &TimerSettings::default()).await.unwrap();
//!
//! let change = changes.recv().await.unwrap();
//! assert!(change.is(Scope::Sync, keys::TIMER_SETTINGS));
//! # });
//! ```

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::{debug, trace, warn};

pub use crate::error::StoreError;

/// Default capacity of the change feed.
///
/// Subscribers that fall further behind receive `RecvError::Lagged` and are
/// expected to re-read the keys they care about.
pub const DEFAULT_CHANGE_CAPACITY: usize = 256;

/// Well-known store keys.
pub mod keys {
    /// Canonical [`TimerState`](crate::types::TimerState), local scope.
    pub const TIMER_STATE: &str = "timerState";

    /// [`TimerSettings`](crate::types::TimerSettings), sync scope.
    pub const TIMER_SETTINGS: &str = "timerSettings";

    /// Task directory, a list of [`Task`](crate::types::Task), sync scope.
    pub const TASKS: &str = "tasks";

    /// Session log, a list of [`SessionLogEntry`](crate::types::SessionLogEntry), local scope.
    pub const POMODORO_LOG: &str = "pomodoroLog";
}

/// Storage scope of a key.
///
/// `Local` holds per-installation data, `Sync` holds data that follows the
/// user between installations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Local,
    Sync,
}

impl Scope {
    /// Directory and wire name of the scope.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Sync => "sync",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single write, as seen by change subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageChange {
    pub scope: Scope,
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

impl StorageChange {
    /// Returns `true` if this change concerns the given scope and key.
    pub fn is(&self, scope: Scope, key: &str) -> bool {
        self.scope == scope && self.key == key
    }

    /// Decodes the new value, returning `None` when absent or undecodable.
    pub fn new_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.new_value
            .as_ref()
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}

/// Persistence for raw JSON values.
///
/// Implementations must be cheap enough to call from async code; values are
/// small documents.
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// Reads the value stored under `key`, or `None` if absent.
    fn read(&self, scope: Scope, key: &str) -> Result<Option<Value>, StoreError>;

    /// Replaces the value stored under `key`.
    fn write(&self, scope: Scope, key: &str, value: &Value) -> Result<(), StoreError>;
}

/// In-process backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<(Scope, String), Value>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn read(&self, scope: Scope, key: &str) -> Result<Option<Value>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(&(scope, key.to_string())).cloned())
    }

    fn write(&self, scope: Scope, key: &str, value: &Value) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert((scope, key.to_string()), value.clone());
        Ok(())
    }
}

/// File-backed store: one pretty-printed JSON file per key.
///
/// Writes go to a temporary sibling file that is then renamed over the
/// target, so readers never observe a half-written document.
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    root: PathBuf,
}

impl JsonFileBackend {
    /// Opens (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the scope directories cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for scope in [Scope::Local, Scope::Sync] {
            fs::create_dir_all(root.join(scope.as_str()))?;
        }
        debug!(root = %root.display(), "Opened file store");
        Ok(Self { root })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, scope: Scope, key: &str) -> PathBuf {
        self.root.join(scope.as_str()).join(format!("{key}.json"))
    }
}

impl StorageBackend for JsonFileBackend {
    fn read(&self, scope: Scope, key: &str) -> Result<Option<Value>, StoreError> {
        match fs::read(self.path_for(scope, key)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, scope: Scope, key: &str, value: &Value) -> Result<(), StoreError> {
        let path = self.path_for(scope, key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

struct StoreInner {
    backend: Arc<dyn StorageBackend>,
    changes: Sender<StorageChange>,
    // Serializes read-old/write/announce so notifications follow write order.
    write_lock: tokio::sync::Mutex<()>,
}

/// Shared handle to the key-value store.
///
/// `Store` is `Clone`; all clones share the backend and the change feed.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("backend", &self.inner.backend)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl Store {
    /// Creates a store over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        let (changes, _) = broadcast::channel(DEFAULT_CHANGE_CAPACITY);
        Self {
            inner: Arc::new(StoreInner {
                backend,
                changes,
                write_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Creates a store backed by memory only.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Opens a file-backed store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory layout cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Ok(Self::new(Arc::new(JsonFileBackend::open(root)?)))
    }

    /// Subscribes to all subsequent writes.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<StorageChange> {
        self.inner.changes.subscribe()
    }

    /// Number of live change subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.changes.receiver_count()
    }

    /// Reads the raw value under `key`.
    ///
    /// A stored document that is not valid JSON is reported as absent.
    pub async fn get_raw(&self, scope: Scope, key: &str) -> Result<Option<Value>, StoreError> {
        match self.inner.backend.read(scope, key) {
            Err(StoreError::Json(err)) => {
                warn!(%scope, key, error = %err, "Ignoring corrupt stored value");
                Ok(None)
            }
            other => other,
        }
    }

    /// Reads and decodes the value under `key`.
    ///
    /// A value that does not decode into `T` is reported as absent, so callers
    /// fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error only when the backend itself fails.
    pub async fn get<T: DeserializeOwned>(
        &self,
        scope: Scope,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        let Some(raw) = self.get_raw(scope, key).await? else {
            return Ok(None);
        };
        Ok(decode(scope, key, raw))
    }

    /// Replaces the value under `key` and announces the change.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        scope: Scope,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let new_value = serde_json::to_value(value)?;
        let _guard = self.inner.write_lock.lock().await;
        let old_value = self.get_raw(scope, key).await.unwrap_or_else(|err| {
            warn!(%scope, key, error = %err, "Could not read previous value");
            None
        });
        self.commit(scope, key, old_value, new_value)
    }

    /// Atomically reads, transforms and optionally rewrites the value under `key`.
    ///
    /// `apply` receives the current decoded value and returns the value to
    /// store (or `None` to leave the key untouched) along with a result for
    /// the caller. No other write through this store can interleave.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Shape`] without calling `apply` when a value is
    /// stored but does not decode into `T`. Unlike [`Store::get`], an update
    /// never treats such a value as absent, since that would overwrite it.
    pub async fn update<T, R, F>(&self, scope: Scope, key: &str, apply: F) -> Result<R, StoreError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> (Option<T>, R),
    {
        let _guard = self.inner.write_lock.lock().await;
        let old_value = self.get_raw(scope, key).await?;
        let current: Option<T> = match &old_value {
            Some(raw) => {
                let value = serde_json::from_value(raw.clone()).map_err(|source| {
                    StoreError::Shape {
                        key: key.to_string(),
                        source,
                    }
                })?;
                Some(value)
            }
            None => None,
        };

        let (next, result) = apply(current);
        if let Some(next) = next {
            let new_value = serde_json::to_value(&next)?;
            self.commit(scope, key, old_value, new_value)?;
        }
        Ok(result)
    }

    fn commit(
        &self,
        scope: Scope,
        key: &str,
        old_value: Option<Value>,
        new_value: Value,
    ) -> Result<(), StoreError> {
        self.inner.backend.write(scope, key, &new_value)?;

        let change = StorageChange {
            scope,
            key: key.to_string(),
            old_value,
            new_value: Some(new_value),
        };
        match self.inner.changes.send(change) {
            Ok(receivers) => trace!(%scope, key, receivers, "Announced storage change"),
            Err(_) => trace!(%scope, key, "Storage change with no subscribers"),
        }
        Ok(())
    }
}

/// An element of a stored list that may or may not decode.
///
/// Lists written by other surfaces (or older versions) can hold entries this
/// build does not understand. Reading a list as `Vec<Lenient<T>>` keeps such
/// entries as raw JSON, so rewriting the list preserves them in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Lenient<T> {
    Decoded(T),
    Raw(Value),
}

impl<T> Lenient<T> {
    pub fn decoded(&self) -> Option<&T> {
        match self {
            Self::Decoded(value) => Some(value),
            Self::Raw(_) => None,
        }
    }

    pub fn decoded_mut(&mut self) -> Option<&mut T> {
        match self {
            Self::Decoded(value) => Some(value),
            Self::Raw(_) => None,
        }
    }

    pub fn into_decoded(self) -> Option<T> {
        match self {
            Self::Decoded(value) => Some(value),
            Self::Raw(_) => None,
        }
    }
}

/// Drops the entries of a lenient list that did not decode.
pub fn decoded_entries<T>(list: Vec<Lenient<T>>) -> Vec<T> {
    let total = list.len();
    let decoded: Vec<T> = list.into_iter().filter_map(Lenient::into_decoded).collect();
    if decoded.len() < total {
        warn!(skipped = total - decoded.len(), "Skipping stored entries with unexpected shape");
    }
    decoded
}

fn decode<T: DeserializeOwned>(scope: Scope, key: &str, raw: Value) -> Option<T> {
    match serde_json::from_value(raw) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(%scope, key, error = %err, "Stored value has unexpected shape, using defaults");
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::{TimerSettings, TimerState};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    /// Backend whose reads and writes can be made to fail on demand.
    #[derive(Debug, Default)]
    pub(crate) struct FlakyBackend {
        inner: MemoryBackend,
        pub(crate) fail_reads: AtomicBool,
        pub(crate) fail_writes: AtomicBool,
    }

    impl StorageBackend for FlakyBackend {
        fn read(&self, scope: Scope, key: &str) -> Result<Option<Value>, StoreError> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(StoreError::backend("read failure injected"));
            }
            self.inner.read(scope, key)
        }

        fn write(&self, scope: Scope, key: &str, value: &Value) -> Result<(), StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::backend("write failure injected"));
            }
            self.inner.write(scope, key, value)
        }
    }

    #[tokio::test]
    async fn get_absent_key_is_none() {
        let store = Store::in_memory();
        let value: Option<TimerState> = store.get(Scope::Local, keys::TIMER_STATE).await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn scopes_are_separate() {
        let store = Store::in_memory();
        store.set(Scope::Local, "k", &json!(1)).await.unwrap();
        store.set(Scope::Sync, "k", &json!(2)).await.unwrap();

        assert_eq!(store.get_raw(Scope::Local, "k").await.unwrap(), Some(json!(1)));
        assert_eq!(store.get_raw(Scope::Sync, "k").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn writer_sees_its_own_change() {
        let store = Store::in_memory();
        let mut rx = store.subscribe();

        store.set(Scope::Local, "k", &json!("a")).await.unwrap();
        store.set(Scope::Local, "k", &json!("b")).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.old_value, None);
        assert_eq!(first.new_value, Some(json!("a")));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.old_value, Some(json!("a")));
        assert_eq!(second.new_value, Some(json!("b")));
    }

    #[tokio::test]
    async fn undecodable_value_reads_as_absent() {
        let store = Store::in_memory();
        store
            .set(Scope::Sync, keys::TIMER_SETTINGS, &json!("not an object"))
            .await
            .unwrap();

        let settings: Option<TimerSettings> =
            store.get(Scope::Sync, keys::TIMER_SETTINGS).await.unwrap();
        assert!(settings.is_none());
    }

    #[tokio::test]
    async fn update_skips_write_when_closure_returns_none() {
        let store = Store::in_memory();
        let mut rx = store.subscribe();

        let seen = store
            .update(Scope::Local, "counter", |current: Option<u32>| (None, current))
            .await
            .unwrap();
        assert_eq!(seen, None);
        assert!(rx.try_recv().is_err());

        let next = store
            .update(Scope::Local, "counter", |current: Option<u32>| {
                let next = current.unwrap_or(0) + 1;
                (Some(next), next)
            })
            .await
            .unwrap();
        assert_eq!(next, 1);
        assert_eq!(rx.recv().await.unwrap().new_value, Some(json!(1)));
    }

    #[tokio::test]
    async fn update_refuses_values_it_cannot_decode() {
        let store = Store::in_memory();
        store.set(Scope::Local, "counter", &json!("twelve")).await.unwrap();
        let mut rx = store.subscribe();

        let result = store
            .update(Scope::Local, "counter", |current: Option<u32>| {
                (Some(current.unwrap_or(0) + 1), ())
            })
            .await;
        assert!(matches!(result, Err(StoreError::Shape { ref key, .. }) if key == "counter"));
        assert!(rx.try_recv().is_err());
        assert_eq!(
            store.get_raw(Scope::Local, "counter").await.unwrap(),
            Some(json!("twelve"))
        );
    }

    #[tokio::test]
    async fn lenient_lists_rewrite_unknown_entries_verbatim() {
        let store = Store::in_memory();
        store
            .set(Scope::Local, "list", &json!([1, "two", 3]))
            .await
            .unwrap();

        store
            .update(Scope::Local, "list", |list: Option<Vec<Lenient<u32>>>| {
                let mut list = list.unwrap_or_default();
                for value in list.iter_mut().filter_map(Lenient::decoded_mut) {
                    *value *= 10;
                }
                list.push(Lenient::Decoded(4));
                (Some(list), ())
            })
            .await
            .unwrap();

        assert_eq!(
            store.get_raw(Scope::Local, "list").await.unwrap(),
            Some(json!([10, "two", 30, 4]))
        );
        let list: Vec<Lenient<u32>> = store.get(Scope::Local, "list").await.unwrap().unwrap();
        assert_eq!(decoded_entries(list), vec![10, 30, 4]);
    }

    #[tokio::test]
    async fn backend_failures_propagate() {
        let backend = Arc::new(FlakyBackend::default());
        let store = Store::new(backend.clone());

        backend.fail_writes.store(true, Ordering::SeqCst);
        assert!(store.set(Scope::Local, "k", &json!(1)).await.is_err());

        backend.fail_writes.store(false, Ordering::SeqCst);
        backend.fail_reads.store(true, Ordering::SeqCst);
        assert!(matches!(
            store.get_raw(Scope::Local, "k").await,
            Err(StoreError::Backend(_))
        ));
    }

    #[tokio::test]
    async fn file_store_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            let state = TimerState {
                time: 99,
                ..TimerState::default()
            };
            store.set(Scope::Local, keys::TIMER_STATE, &state).await.unwrap();
        }

        assert!(dir.path().join("local").join("timerState.json").exists());

        let reopened = Store::open(dir.path()).unwrap();
        let state: TimerState = reopened
            .get(Scope::Local, keys::TIMER_STATE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.time, 99);
    }

    #[tokio::test]
    async fn corrupt_file_reads_as_absent() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        fs::write(dir.path().join("sync").join("timerSettings.json"), b"{ nope").unwrap();

        assert_eq!(store.get_raw(Scope::Sync, keys::TIMER_SETTINGS).await.unwrap(), None);
    }
}

//! Bounded log of completed focus sessions, persisted in the local scope.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::DEFAULT_SESSION_LOG_CAPACITY;
use crate::error::StoreError;
use crate::store::{decoded_entries, keys, Lenient, Scope, Store};
use crate::types::{SessionLogEntry, Task};

/// Task id recorded for sessions without a selected task.
pub const ANONYMOUS_TASK_ID: &str = "anonymous";

/// Title recorded for sessions without a selected task.
pub const ANONYMOUS_TITLE: &str = "Anonymous Focus Session";

/// Project recorded for sessions without a selected task.
pub const ANONYMOUS_PROJECT: &str = "Uncategorized";

impl SessionLogEntry {
    /// Entry attributed to `task`.
    pub fn for_task(task: &Task, minutes: f64, finished_at: DateTime<Utc>) -> Self {
        Self {
            task_id: task.id.clone(),
            title: task.title.clone(),
            project: task.project.clone(),
            minutes,
            finished_at,
        }
    }

    /// Entry for a session with no (or no longer existing) task.
    pub fn anonymous(minutes: f64, finished_at: DateTime<Utc>) -> Self {
        Self {
            task_id: ANONYMOUS_TASK_ID.to_string(),
            title: ANONYMOUS_TITLE.to_string(),
            project: ANONYMOUS_PROJECT.to_string(),
            minutes,
            finished_at,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.task_id == ANONYMOUS_TASK_ID
    }
}

/// Append-only, capacity-bounded session log.
#[derive(Debug, Clone)]
pub struct SessionLog {
    store: Store,
    capacity: usize,
}

impl SessionLog {
    /// Creates a log keeping at most `capacity` entries (minimum one).
    pub fn new(store: Store, capacity: usize) -> Self {
        Self {
            store,
            capacity: capacity.max(1),
        }
    }

    pub fn with_default_capacity(store: Store) -> Self {
        Self::new(store, DEFAULT_SESSION_LOG_CAPACITY)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// All entries that decode, oldest first.
    pub async fn entries(&self) -> Result<Vec<SessionLogEntry>, StoreError> {
        let log = self
            .store
            .get::<Vec<Lenient<SessionLogEntry>>>(Scope::Local, keys::POMODORO_LOG)
            .await?
            .unwrap_or_default();
        Ok(decoded_entries(log))
    }

    /// Appends an entry, evicting the oldest beyond capacity.
    ///
    /// Entries written by other versions that do not decode keep their place
    /// and count toward capacity. Returns the resulting length of the log.
    pub async fn append(&self, entry: SessionLogEntry) -> Result<usize, StoreError> {
        let capacity = self.capacity;
        let append = |log: Option<Vec<Lenient<SessionLogEntry>>>| {
            let mut log = log.unwrap_or_default();
            push_capped(&mut log, Lenient::Decoded(entry), capacity);
            let len = log.len();
            (Some(log), len)
        };
        let len = self
            .store
            .update(Scope::Local, keys::POMODORO_LOG, append)
            .await?;
        debug!(len, capacity, "Appended session log entry");
        Ok(len)
    }

    /// Total focus minutes logged at or after `since`.
    pub async fn focus_minutes_since(&self, since: DateTime<Utc>) -> Result<f64, StoreError> {
        Ok(self
            .entries()
            .await?
            .iter()
            .filter(|entry| entry.finished_at >= since)
            .map(|entry| entry.minutes)
            .sum())
    }
}

fn push_capped<T>(log: &mut Vec<T>, entry: T, capacity: usize) {
    log.push(entry);
    if log.len() > capacity {
        let excess = log.len() - capacity;
        log.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn numbered(n: u32) -> SessionLogEntry {
        SessionLogEntry::anonymous(f64::from(n), Utc::now())
    }

    #[tokio::test]
    async fn append_and_read_back() {
        let log = SessionLog::with_default_capacity(Store::in_memory());
        let task = Task::new("Essay", "School");

        log.append(SessionLogEntry::for_task(&task, 25.0, Utc::now())).await.unwrap();
        log.append(numbered(10)).await.unwrap();

        let entries = log.entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].title, "Essay");
        assert!(!entries[0].is_anonymous());
        assert_eq!(entries[1].task_id, ANONYMOUS_TASK_ID);
        assert_eq!(entries[1].project, ANONYMOUS_PROJECT);
    }

    #[tokio::test]
    async fn full_log_evicts_oldest_entry() {
        let store = Store::in_memory();
        let seeded: Vec<_> = (0..1000).map(numbered).collect();
        store.set(Scope::Local, keys::POMODORO_LOG, &seeded).await.unwrap();

        let log = SessionLog::with_default_capacity(store);
        let len = log.append(numbered(1000)).await.unwrap();
        assert_eq!(len, 1000);

        let entries = log.entries().await.unwrap();
        assert_eq!(entries.first().map(|e| e.minutes), Some(1.0));
        assert_eq!(entries.last().map(|e| e.minutes), Some(1000.0));
    }

    #[test]
    fn push_capped_trims_oversized_logs() {
        let mut log: Vec<_> = (0..5).map(numbered).collect();
        push_capped(&mut log, numbered(5), 3);
        let minutes: Vec<_> = log.iter().map(|e| e.minutes).collect();
        assert_eq!(minutes, vec![3.0, 4.0, 5.0]);
    }

    #[tokio::test]
    async fn fractional_minutes_survive_a_round_trip() {
        let log = SessionLog::with_default_capacity(Store::in_memory());
        log.append(SessionLogEntry::anonymous(12.5, Utc::now())).await.unwrap();
        assert_eq!(log.entries().await.unwrap()[0].minutes, 12.5);
    }

    #[tokio::test]
    async fn append_keeps_entries_it_cannot_decode() {
        let store = Store::in_memory();
        let mut seeded: Vec<_> = (1..=5)
            .map(|n| serde_json::to_value(numbered(n)).unwrap())
            .collect();
        seeded.push(json!({
            "taskId": "t1",
            "title": "Essay",
            "project": "School",
            "minutes": 12.5,
            "finishedAt": "2026-10-17T09:00:00Z",
        }));
        seeded.push(json!({ "minutes": "soon" }));
        store.set(Scope::Local, keys::POMODORO_LOG, &seeded).await.unwrap();

        let log = SessionLog::with_default_capacity(store.clone());
        assert_eq!(log.append(numbered(25)).await.unwrap(), 8);

        let raw = store.get_raw(Scope::Local, keys::POMODORO_LOG).await.unwrap().unwrap();
        let raw = raw.as_array().unwrap();
        assert_eq!(raw.len(), 8);
        assert_eq!(raw[6], json!({ "minutes": "soon" }));

        let entries = log.entries().await.unwrap();
        assert_eq!(entries.len(), 7);
        assert_eq!(entries[5].minutes, 12.5);
        assert_eq!(entries[6].minutes, 25.0);
    }

    #[tokio::test]
    async fn focus_minutes_since_filters_by_time() {
        let log = SessionLog::new(Store::in_memory(), 10);
        let now = Utc::now();
        log.append(SessionLogEntry::anonymous(25.0, now - Duration::days(2))).await.unwrap();
        log.append(SessionLogEntry::anonymous(30.5, now)).await.unwrap();

        assert_eq!(log.focus_minutes_since(now - Duration::hours(1)).await.unwrap(), 30.5);
        assert_eq!(log.focus_minutes_since(now - Duration::days(3)).await.unwrap(), 55.5);
    }
}

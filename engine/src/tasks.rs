//! Task directory persisted in the sync scope.
//!
//! The directory is a single list under the `tasks` key. Every mutation is an
//! atomic read-modify-write of the whole list through [`Store::update`].
//! Entries that do not decode are hidden from callers but written back
//! unchanged.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::{decoded_entries, keys, Lenient, Scope, Store};
use crate::types::Task;

#[derive(Debug, Clone)]
pub struct TaskDirectory {
    store: Store,
}

impl TaskDirectory {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// All tasks, empty when none are stored.
    pub async fn list(&self) -> Result<Vec<Task>, StoreError> {
        let tasks = self
            .store
            .get::<Vec<Lenient<Task>>>(Scope::Sync, keys::TASKS)
            .await?
            .unwrap_or_default();
        Ok(decoded_entries(tasks))
    }

    pub async fn get(&self, id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.list().await?.into_iter().find(|task| task.id == id))
    }

    /// Appends a task and returns it.
    pub async fn add(&self, task: Task) -> Result<Task, StoreError> {
        let id = task.id.clone();
        self.modify(|tasks| {
            tasks.push(Lenient::Decoded(task.clone()));
            Some(())
        })
        .await?;
        debug!(task_id = %id, "Added task");
        Ok(task)
    }

    /// Replaces the task with the same id. Returns `false` if there is none.
    pub async fn update(&self, task: Task) -> Result<bool, StoreError> {
        let replaced = self
            .modify(|tasks| {
                let slot = find_mut(tasks, &task.id)?;
                *slot = task.clone();
                Some(())
            })
            .await?;
        Ok(replaced.is_some())
    }

    /// Removes a task. Returns `false` if there was none.
    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let removed = self
            .modify(|tasks| {
                let index = tasks
                    .iter()
                    .position(|entry| entry.decoded().is_some_and(|task| task.id == id))?;
                Some(tasks.remove(index))
            })
            .await?;
        Ok(removed.is_some())
    }

    /// Flips a task's completion.
    pub async fn toggle(&self, id: &str, now: DateTime<Utc>) -> Result<Option<Task>, StoreError> {
        self.modify(|tasks| {
            let task = find_mut(tasks, id)?;
            task.toggle(now);
            Some(task.clone())
        })
        .await
    }

    /// Credits one completed pomodoro to a task.
    ///
    /// Returns the updated task, or `None` if no task has that id.
    pub async fn record_completed_pomodoro(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        let updated = self
            .modify(|tasks| {
                let task = find_mut(tasks, id)?;
                if task.record_pomodoro(now) {
                    info!(task_id = %task.id, title = %task.title, "Task reached its pomodoro target");
                }
                Some(task.clone())
            })
            .await?;
        Ok(updated)
    }

    /// Applies `edit` to the task list, writing only when it returns `Some`.
    async fn modify<R>(
        &self,
        edit: impl FnOnce(&mut Vec<Lenient<Task>>) -> Option<R>,
    ) -> Result<Option<R>, StoreError> {
        self.store
            .update(Scope::Sync, keys::TASKS, |tasks: Option<Vec<Lenient<Task>>>| {
                let mut tasks = tasks.unwrap_or_default();
                match edit(&mut tasks) {
                    Some(result) => (Some(tasks), Some(result)),
                    None => (None, None),
                }
            })
            .await
    }
}

fn find_mut<'a>(tasks: &'a mut [Lenient<Task>], id: &str) -> Option<&'a mut Task> {
    tasks
        .iter_mut()
        .filter_map(Lenient::decoded_mut)
        .find(|task| task.id == id)
}

//! Timer settings persisted in the sync scope.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::store::{keys, Scope, Store};
use crate::types::{TimerSettings, MIN_SESSION_SECS};

/// Typed access to the `timerSettings` key.
#[derive(Debug, Clone)]
pub struct SettingsRepository {
    store: Store,
}

impl SettingsRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Stored settings, or `None` if absent or unreadable as settings.
    pub async fn try_load(&self) -> Result<Option<TimerSettings>, StoreError> {
        self.store.get(Scope::Sync, keys::TIMER_SETTINGS).await
    }

    /// Stored settings, falling back to defaults on absence or failure.
    pub async fn load(&self) -> TimerSettings {
        match self.try_load().await {
            Ok(settings) => settings.unwrap_or_default(),
            Err(err) => {
                warn!(error = %err, "Could not read timer settings, using defaults");
                TimerSettings::default()
            }
        }
    }

    pub async fn save(&self, settings: &TimerSettings) -> Result<(), StoreError> {
        self.store.set(Scope::Sync, keys::TIMER_SETTINGS, settings).await
    }

    /// Writes default settings unless some value is already stored.
    ///
    /// Returns `true` if defaults were written.
    pub async fn seed_defaults(&self) -> Result<bool, StoreError> {
        if self.store.get_raw(Scope::Sync, keys::TIMER_SETTINGS).await?.is_some() {
            return Ok(false);
        }
        self.save(&TimerSettings::default()).await?;
        info!("Seeded default timer settings");
        Ok(true)
    }
}

/// A partial settings update. Unset fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub focus_duration: Option<u64>,
    pub short_break_duration: Option<u64>,
    pub long_break_duration: Option<u64>,
    pub auto_start_breaks: Option<bool>,
    pub auto_start_pomodoros: Option<bool>,
    pub notifications: Option<bool>,
    pub sound: Option<bool>,
}

impl SettingsPatch {
    /// Returns `true` if the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Returns `true` if any session length is part of the patch.
    pub fn touches_durations(&self) -> bool {
        self.focus_duration.is_some()
            || self.short_break_duration.is_some()
            || self.long_break_duration.is_some()
    }

    /// Merges the patch into `settings`.
    ///
    /// Session lengths shorter than [`MIN_SESSION_SECS`] are raised to it.
    pub fn apply(&self, settings: &mut TimerSettings) {
        if let Some(v) = self.focus_duration {
            settings.focus_duration = v.max(MIN_SESSION_SECS);
        }
        if let Some(v) = self.short_break_duration {
            settings.short_break_duration = v.max(MIN_SESSION_SECS);
        }
        if let Some(v) = self.long_break_duration {
            settings.long_break_duration = v.max(MIN_SESSION_SECS);
        }
        if let Some(v) = self.auto_start_breaks {
            settings.auto_start_breaks = v;
        }
        if let Some(v) = self.auto_start_pomodoros {
            settings.auto_start_pomodoros = v;
        }
        if let Some(v) = self.notifications {
            settings.notifications = v;
        }
        if let Some(v) = self.sound {
            settings.sound = v;
        }
    }
}

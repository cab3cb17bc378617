//! One-shot wake scheduling for the timer chain.
//!
//! At most one wake is pending at a time. Scheduling replaces the pending
//! wake, and every wake carries the generation it was scheduled under so that
//! a wake which raced with a cancel or reschedule can be recognised and
//! ignored.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Capacity of the wake channel.
const WAKE_CHANNEL_CAPACITY: usize = 16;

/// A delivered wake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wake {
    pub generation: u64,
}

#[derive(Debug)]
pub struct WakeScheduler {
    wake_tx: mpsc::Sender<Wake>,
    generation: AtomicU64,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl WakeScheduler {
    /// Creates a scheduler and the receiver its wakes are delivered to.
    pub fn new() -> (Self, mpsc::Receiver<Wake>) {
        let (wake_tx, wake_rx) = mpsc::channel(WAKE_CHANNEL_CAPACITY);
        let scheduler = Self {
            wake_tx,
            generation: AtomicU64::new(0),
            pending: Mutex::new(None),
        };
        (scheduler, wake_rx)
    }

    /// Schedules a wake after `delay`, replacing any pending one.
    ///
    /// Must be called from within a tokio runtime. Returns the generation of
    /// the new wake.
    pub fn schedule(&self, delay: Duration) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let wake_tx = self.wake_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if wake_tx.send(Wake { generation }).await.is_err() {
                trace!(generation, "Wake receiver gone");
            }
        });

        let previous = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        trace!(generation, ?delay, "Scheduled wake");
        generation
    }

    /// Cancels the pending wake, if any, and invalidates in-flight ones.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pending) = pending {
            pending.abort();
        }
    }

    /// Returns `true` if `wake` belongs to the latest schedule.
    pub fn is_current(&self, wake: Wake) -> bool {
        wake.generation == self.generation.load(Ordering::SeqCst)
    }

    /// Returns `true` while a scheduled wake has not fired yet.
    pub fn is_scheduled(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for WakeScheduler {
    fn drop(&mut self) {
        if let Some(pending) = self
            .pending
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pending.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, timeout};

    #[tokio::test(start_paused = true)]
    async fn wake_arrives_after_delay() {
        let (scheduler, mut rx) = WakeScheduler::new();
        let generation = scheduler.schedule(Duration::from_secs(1));
        assert!(scheduler.is_scheduled());

        let wake = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("wake should arrive")
            .expect("channel open");
        assert_eq!(wake.generation, generation);
        assert!(scheduler.is_current(wake));
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_replaces_pending_wake() {
        let (scheduler, mut rx) = WakeScheduler::new();
        scheduler.schedule(Duration::from_secs(1));
        let second = scheduler.schedule(Duration::from_secs(1));

        let wake = rx.recv().await.expect("wake");
        assert_eq!(wake.generation, second);

        advance(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err(), "replaced wake must never fire");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_wake() {
        let (scheduler, mut rx) = WakeScheduler::new();
        scheduler.schedule(Duration::from_secs(1));
        scheduler.cancel();
        assert!(!scheduler.is_scheduled());

        let result = timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(result.is_err(), "cancelled wake must not be delivered");
    }

    #[tokio::test(start_paused = true)]
    async fn wake_from_before_cancel_is_stale() {
        let (scheduler, mut rx) = WakeScheduler::new();
        scheduler.schedule(Duration::from_millis(10));
        let wake = rx.recv().await.expect("wake");

        scheduler.cancel();
        assert!(!scheduler.is_current(wake));
    }
}

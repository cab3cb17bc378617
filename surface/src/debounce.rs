//! Keyed debouncing for timer state traffic.
//!
//! A surface sees bursts in both directions: a user double-clicking start
//! produces several intents, and every engine tick produces a store change.
//! [`Debouncer`] holds the latest value per key and emits it once the key
//! has been quiet for the configured interval.
//!
//! # Architecture
//!
//! A background task owns a map of pending values keyed by `K`:
//!
//! 1. A new value replaces any pending value for its key and restarts that
//!    key's deadline
//! 2. When a deadline passes, the latest value is emitted on the output channel
//! 3. [`Debouncer::flush`] emits everything pending at once
//! 4. Dropping the debouncer flushes everything pending, then ends the task
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tokio::sync::mpsc;
//! use pomosync_surface::debounce::Debouncer;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (output_tx, mut output_rx) = mpsc::channel(16);
//!     let debouncer = Debouncer::new(Duration::from_millis(50), output_tx);
//!
//!     debouncer.send("timerState", 1).await.unwrap();
//!     debouncer.send("timerState", 2).await.unwrap();
//!
//!     assert_eq!(output_rx.recv().await, Some(("timerState", 2)));
//! }
//! ```

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Capacity of the debouncer's input queue.
const INPUT_CAPACITY: usize = 256;

/// Error type for debouncer operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebouncerError {
    /// The debouncer's background task has stopped.
    ChannelClosed,
}

impl std::fmt::Display for DebouncerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ChannelClosed => write!(f, "debouncer channel closed"),
        }
    }
}

impl std::error::Error for DebouncerError {}

enum Input<K, V> {
    Event(K, V),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug)]
struct Pending<V> {
    value: V,
    deadline: Instant,
}

/// Coalesces values by key, emitting only the latest after a quiet interval.
#[derive(Debug)]
pub struct Debouncer<K, V>
where
    K: Clone + Eq + Hash + Send + Debug + 'static,
    V: Send + 'static,
{
    input_tx: mpsc::Sender<Input<K, V>>,
    interval: Duration,
    #[allow(dead_code)]
    task_handle: JoinHandle<()>,
}

impl<K, V> Debug for Input<K, V>
where
    K: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Event(key, _) => f.debug_tuple("Event").field(key).finish(),
            Self::Flush(_) => f.write_str("Flush"),
        }
    }
}

impl<K, V> Debouncer<K, V>
where
    K: Clone + Eq + Hash + Send + Debug + 'static,
    V: Send + 'static,
{
    /// Creates a debouncer emitting on `output_tx`.
    ///
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn new(interval: Duration, output_tx: mpsc::Sender<(K, V)>) -> Self {
        let (input_tx, input_rx) = mpsc::channel(INPUT_CAPACITY);
        let task_handle = tokio::spawn(run_debounce_loop(interval, input_rx, output_tx));
        Self {
            input_tx,
            interval,
            task_handle,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Queues `value` under `key`, replacing any pending value for that key.
    ///
    /// # Errors
    ///
    /// Returns [`DebouncerError::ChannelClosed`] if the background task has
    /// terminated.
    pub async fn send(&self, key: K, value: V) -> Result<(), DebouncerError> {
        self.input_tx
            .send(Input::Event(key, value))
            .await
            .map_err(|_| DebouncerError::ChannelClosed)
    }

    /// Emits every pending value now, returning once they are on the output
    /// channel.
    ///
    /// # Errors
    ///
    /// Returns [`DebouncerError::ChannelClosed`] if the background task has
    /// terminated.
    pub async fn flush(&self) -> Result<(), DebouncerError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.input_tx
            .send(Input::Flush(done_tx))
            .await
            .map_err(|_| DebouncerError::ChannelClosed)?;
        done_rx.await.map_err(|_| DebouncerError::ChannelClosed)
    }
}

async fn run_debounce_loop<K, V>(
    interval: Duration,
    mut input_rx: mpsc::Receiver<Input<K, V>>,
    output_tx: mpsc::Sender<(K, V)>,
) where
    K: Clone + Eq + Hash + Debug,
{
    let mut pending: HashMap<K, Pending<V>> = HashMap::new();
    debug!(interval_ms = interval.as_millis(), "Starting debounce loop");

    loop {
        let next_deadline = pending.values().map(|p| p.deadline).min();

        tokio::select! {
            input = input_rx.recv() => match input {
                Some(Input::Event(key, value)) => {
                    trace!(?key, "Debouncing value");
                    let deadline = Instant::now() + interval;
                    pending.insert(key, Pending { value, deadline });
                }
                Some(Input::Flush(done)) => {
                    emit(&mut pending, &output_tx, None).await;
                    let _ = done.send(());
                }
                None => {
                    debug!(pending = pending.len(), "Debouncer dropped, flushing");
                    emit(&mut pending, &output_tx, None).await;
                    break;
                }
            },

            _ = async {
                match next_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                emit(&mut pending, &output_tx, Some(Instant::now())).await;
            }
        }
    }

    debug!("Debounce loop terminated");
}

/// Emits pending values due by `due`, or all of them when `due` is `None`.
async fn emit<K, V>(
    pending: &mut HashMap<K, Pending<V>>,
    output_tx: &mpsc::Sender<(K, V)>,
    due: Option<Instant>,
) where
    K: Clone + Eq + Hash + Debug,
{
    let ready: Vec<K> = pending
        .iter()
        .filter(|(_, p)| due.map_or(true, |due| p.deadline <= due))
        .map(|(key, _)| key.clone())
        .collect();

    for key in ready {
        if let Some(p) = pending.remove(&key) {
            trace!(?key, "Emitting debounced value");
            if output_tx.send((key.clone(), p.value)).await.is_err() {
                warn!(?key, "Debounce output closed, value dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn debouncer(interval_ms: u64) -> (Debouncer<&'static str, u32>, mpsc::Receiver<(&'static str, u32)>) {
        let (tx, rx) = mpsc::channel(16);
        (Debouncer::new(Duration::from_millis(interval_ms), tx), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_emits_only_latest_value() {
        let (debouncer, mut rx) = debouncer(50);

        debouncer.send("timerState", 1).await.unwrap();
        debouncer.send("timerState", 2).await.unwrap();
        debouncer.send("timerState", 3).await.unwrap();

        let first = timeout(Duration::from_millis(200), rx.recv()).await.unwrap();
        assert_eq!(first, Some(("timerState", 3)));

        let more = timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(more.is_err(), "burst must collapse into one value");
    }

    #[tokio::test(start_paused = true)]
    async fn value_waits_for_quiet_interval() {
        let (debouncer, mut rx) = debouncer(100);
        debouncer.send("timerState", 7).await.unwrap();

        assert!(timeout(Duration::from_millis(60), rx.recv()).await.is_err());
        assert_eq!(
            timeout(Duration::from_millis(100), rx.recv()).await.unwrap(),
            Some(("timerState", 7))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let (debouncer, mut rx) = debouncer(50);
        debouncer.send("timerState", 1).await.unwrap();
        debouncer.send("timerSettings", 2).await.unwrap();

        let mut received = Vec::new();
        for _ in 0..2 {
            received.push(rx.recv().await.unwrap());
        }
        received.sort();
        assert_eq!(received, vec![("timerSettings", 2), ("timerState", 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_emits_immediately() {
        let (debouncer, mut rx) = debouncer(10_000);
        debouncer.send("timerState", 9).await.unwrap();

        debouncer.flush().await.unwrap();
        assert_eq!(rx.try_recv().ok(), Some(("timerState", 9)));
    }

    #[tokio::test(start_paused = true)]
    async fn flush_with_nothing_pending_returns() {
        let (debouncer, mut rx) = debouncer(50);
        debouncer.flush().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn drop_flushes_pending_values() {
        let (debouncer, mut rx) = debouncer(10_000);
        debouncer.send("timerState", 4).await.unwrap();
        drop(debouncer);

        assert_eq!(rx.recv().await, Some(("timerState", 4)));
        assert_eq!(rx.recv().await, None, "output closes after the flush");
    }

    #[test]
    fn error_display() {
        assert_eq!(DebouncerError::ChannelClosed.to_string(), "debouncer channel closed");
    }
}

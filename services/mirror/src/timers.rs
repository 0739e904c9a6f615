//! Keyed single-shot eviction timers.
//!
//! A key has at most one pending timer. Scheduling again for the same key aborts
//! the previous timer and arms a new one for the full delay. Every armed timer
//! carries a generation number; when it fires it only runs its body if the
//! registry still holds that same generation for its key.

use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug)]
struct TimerEntry {
    generation: u64,
    deadline: Instant,
    handle: AbortHandle,
}

#[derive(Debug, Default)]
pub(crate) struct TimerTable {
    next_generation: u64,
    entries: HashMap<String, TimerEntry>,
}

impl TimerTable {
    /// Abort and forget every pending timer
    pub(crate) fn cancel_all(&mut self) -> usize {
        let count = self.entries.len();
        for (_, entry) in self.entries.drain() {
            entry.handle.abort();
        }
        count
    }
}

/// Registry of pending eviction timers
#[derive(Debug, Clone, Default)]
pub struct EvictionTimers {
    inner: Arc<Mutex<TimerTable>>,
}

impl EvictionTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer for `key`, replacing any pending one
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F, Fut>(&self, key: impl Into<String>, after: Duration, on_fire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let deadline = Instant::now() + after;

        let mut table = self.inner.lock();
        table.next_generation += 1;
        let generation = table.next_generation;

        let registry = Arc::clone(&self.inner);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;

            {
                let mut table = registry.lock();
                match table.entries.get(&task_key) {
                    Some(entry) if entry.generation == generation => {
                        table.entries.remove(&task_key);
                    }
                    _ => return,
                }
            }

            trace!(key = %task_key, "Eviction timer fired");
            on_fire().await;
        })
        .abort_handle();

        if let Some(previous) = table.entries.insert(
            key,
            TimerEntry {
                generation,
                deadline,
                handle,
            },
        ) {
            previous.handle.abort();
        }
    }

    /// Abort the pending timer for `key`, returns whether one existed
    pub fn cancel(&self, key: &str) -> bool {
        match self.inner.lock().entries.remove(key) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        self.inner.lock().cancel_all()
    }

    /// Deadline of the pending timer for `key`
    pub fn deadline(&self, key: &str) -> Option<Instant> {
        self.inner.lock().entries.get(key).map(|e| e.deadline)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TimerTable> {
        self.inner.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_and_leaves_registry() {
        let timers = EvictionTimers::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let start = Instant::now();
        timers.schedule("a@b@preview.jpg", Duration::from_secs(30), move || async move {
            let _ = tx.send("fired");
        });
        assert!(timers.contains("a@b@preview.jpg"));
        assert_eq!(
            timers.deadline("a@b@preview.jpg"),
            Some(start + Duration::from_secs(30))
        );

        assert_eq!(rx.recv().await, Some("fired"));
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert!(timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_keeps_single_timer_with_latest_deadline() {
        let timers = EvictionTimers::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let start = Instant::now();
        let first = tx.clone();
        timers.schedule("k", Duration::from_secs(10), move || async move {
            let _ = first.send("first");
        });
        let second = tx.clone();
        timers.schedule("k", Duration::from_secs(20), move || async move {
            let _ = second.send("second");
        });

        assert_eq!(timers.len(), 1);
        assert_eq!(timers.deadline("k"), Some(start + Duration::from_secs(20)));

        assert_eq!(rx.recv().await, Some("second"));
        assert!(start.elapsed() >= Duration::from_secs(20));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
        assert!(timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let timers = EvictionTimers::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<&str>();

        timers.schedule("k", Duration::from_secs(5), move || async move {
            let _ = tx.send("fired");
        });
        assert!(timers.cancel("k"));
        assert!(!timers.cancel("k"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        // The only sender lived in the aborted task, so the channel is closed and empty
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let timers = EvictionTimers::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        for i in 0..5 {
            let tx = tx.clone();
            timers.schedule(format!("key-{i}"), Duration::from_secs(5), move || async move {
                let _ = tx.send(format!("key-{i}"));
            });
        }
        drop(tx);
        assert_eq!(timers.len(), 5);
        assert_eq!(timers.cancel_all(), 5);
        assert!(timers.is_empty());
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_keys_fire_independently() {
        let timers = EvictionTimers::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for (key, secs) in [("late", 20u64), ("early", 5)] {
            let tx = tx.clone();
            timers.schedule(key, Duration::from_secs(secs), move || async move {
                let _ = tx.send(key);
            });
        }

        assert_eq!(rx.recv().await, Some("early"));
        assert!(timers.contains("late"));
        assert_eq!(rx.recv().await, Some("late"));
    }
}

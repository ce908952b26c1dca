//! Coalescing scheduler: at most one pending delayed task per key.
//!
//! Scheduling a key that already has a pending task replaces it. A task that
//! has started running is no longer pending and is never aborted by a later
//! `schedule`/`cancel` on the same key.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;

use crate::inspector::{Causality, EntryLevel, EventCode, Inspector};

#[derive(Debug)]
struct PendingTask {
    id: u64,
    handle: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct SchedulerState {
    pending: HashMap<String, PendingTask>,
    next_id: u64,
}

fn lock(state: &Mutex<SchedulerState>) -> MutexGuard<'_, SchedulerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keyed debounce with an immediate-run bypass.
#[derive(Debug)]
pub struct CoalescingScheduler {
    state: Arc<Mutex<SchedulerState>>,
    inspector: Arc<Inspector>,
}

impl CoalescingScheduler {
    #[must_use]
    pub fn new(inspector: Arc<Inspector>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SchedulerState::default())),
            inspector,
        }
    }

    /// Run `task` after `delay`, replacing any pending task for `key`.
    pub fn schedule<F>(&self, key: &str, delay: Duration, cause: Causality, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let replaced = {
            let mut state = lock(&self.state);
            state.next_id += 1;
            let id = state.next_id;
            let replaced = state.pending.remove(key);
            if let Some(old) = &replaced {
                old.handle.abort();
            }

            let shared = Arc::clone(&self.state);
            let inspector = Arc::clone(&self.inspector);
            let owned_key = key.to_string();
            let fired_cause = cause.clone();
            // The state lock is held until the entry is inserted, so the
            // task cannot observe its own slot before it exists.
            let handle = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let still_pending = {
                    let mut state = lock(&shared);
                    match state.pending.get(&owned_key) {
                        Some(entry) if entry.id == id => {
                            state.pending.remove(&owned_key);
                            true
                        }
                        _ => false,
                    }
                };
                if !still_pending {
                    return;
                }
                inspector.event(
                    EntryLevel::Debug,
                    EventCode::TimerFired,
                    format!("timer {owned_key} fired"),
                    fired_cause,
                );
                task.await;
            });
            state.pending.insert(key.to_string(), PendingTask { id, handle });
            replaced.is_some()
        };

        if replaced {
            self.inspector.event(
                EntryLevel::Debug,
                EventCode::TimerCancelled,
                format!("timer {key} replaced"),
                cause.clone(),
            );
        }
        self.inspector.log(
            EntryLevel::Debug,
            EventCode::TimerScheduled,
            format!("timer {key} scheduled"),
            Some(cause),
            Some(json!({ "delay_ms": delay.as_millis() as u64 })),
        );
    }

    /// Cancel any pending task for `key` and start `task` now.
    pub fn run_now<F>(&self, key: &str, cause: Causality, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel(key, cause.clone());
        self.inspector.log(
            EntryLevel::Debug,
            EventCode::TimerFired,
            format!("timer {key} bypassed"),
            Some(cause),
            Some(json!({ "immediate": true })),
        );
        tokio::spawn(task)
    }

    /// Returns whether a pending task was cancelled.
    pub fn cancel(&self, key: &str, cause: Causality) -> bool {
        let removed = lock(&self.state).pending.remove(key);
        let Some(entry) = removed else {
            return false;
        };
        entry.handle.abort();
        self.inspector.event(
            EntryLevel::Debug,
            EventCode::TimerCancelled,
            format!("timer {key} cancelled"),
            cause,
        );
        true
    }

    #[must_use]
    pub fn is_pending(&self, key: &str) -> bool {
        lock(&self.state).pending.contains_key(key)
    }
}

impl Drop for CoalescingScheduler {
    fn drop(&mut self) {
        for (_, entry) in lock(&self.state).pending.drain() {
            entry.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cause() -> Causality {
        Causality::new("test", "scheduler", "unit")
    }

    fn counting(counter: &Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
        let counter = Arc::clone(counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_pending_task() {
        let inspector = Arc::new(Inspector::default());
        let scheduler = CoalescingScheduler::new(Arc::clone(&inspector));
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            scheduler.schedule("flush", Duration::from_millis(500), cause(), counting(&runs));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(scheduler.is_pending("flush"));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_pending("flush"));
        assert_eq!(inspector.count(EventCode::TimerCancelled), 2);
        assert_eq!(inspector.count(EventCode::TimerFired), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_now_cancels_pending() {
        let inspector = Arc::new(Inspector::default());
        let scheduler = CoalescingScheduler::new(inspector);
        let runs = Arc::new(AtomicUsize::new(0));

        scheduler.schedule("recover", Duration::from_secs(1), cause(), counting(&runs));
        scheduler
            .run_now("recover", cause(), counting(&runs))
            .await
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_reports_whether_pending() {
        let scheduler = CoalescingScheduler::new(Arc::new(Inspector::default()));
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler.schedule("k", Duration::from_secs(1), cause(), counting(&runs));

        assert!(scheduler.cancel("k", cause()));
        assert!(!scheduler.cancel("k", cause()));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let scheduler = CoalescingScheduler::new(Arc::new(Inspector::default()));
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler.schedule("a", Duration::from_millis(10), cause(), counting(&runs));
        scheduler.schedule("b", Duration::from_millis(10), cause(), counting(&runs));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}

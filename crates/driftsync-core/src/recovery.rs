//! Recovery trigger: reacts to "we may have been suspended or the network may
//! have changed" signals by resetting locks, warming the session and flushing.
//!
//! Signals arrive over an mpsc channel. Bursts are coalesced through a
//! [`CoalescingScheduler`]; `Visible` bypasses the debounce. A minimum interval
//! between executed runs keeps near-simultaneous signals from running the
//! protocol twice.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::RecoveryConfig;
use crate::engine::SyncEngine;
use crate::inspector::{Causality, EntryLevel, EventCode};
use crate::record::epoch_ms;
use crate::remote::RemoteStore;
use crate::scheduler::CoalescingScheduler;
use crate::session::AuthProvider;

const MODULE: &str = "recovery";
const OWNER: &str = "recovery";
const RUN_KEY: &str = "recovery";
const SECONDARY_KEY: &str = "recovery-secondary";
const SIGNAL_BUFFER: usize = 64;

/// Online and visibility state as last reported by the host.
#[derive(Debug)]
pub struct Environment {
    online: AtomicBool,
    visible: AtomicBool,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new(true, true)
    }
}

impl Environment {
    #[must_use]
    pub fn new(online: bool, visible: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
            visible: AtomicBool::new(visible),
        }
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }

    /// Returns the previous value.
    pub(crate) fn set_online(&self, online: bool) -> bool {
        self.online.swap(online, Ordering::SeqCst)
    }

    /// Returns the previous value.
    pub(crate) fn set_visible(&self, visible: bool) -> bool {
        self.visible.swap(visible, Ordering::SeqCst)
    }
}

/// Host lifecycle signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum LifecycleSignal {
    /// Foreground/visibility resumed. Highest priority.
    Visible,
    Hidden,
    Online,
    Offline,
    /// Periodic wall-clock sample from the ticker.
    Tick { now_ms: u64 },
}

impl LifecycleSignal {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Visible => "visible",
            Self::Hidden => "hidden",
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Tick { .. } => "tick",
        }
    }
}

/// Flags suspension: consecutive ticks further apart than the threshold.
#[derive(Debug, Clone)]
pub struct TimeJumpDetector {
    threshold_ms: u64,
    last_ms: Option<u64>,
}

impl TimeJumpDetector {
    #[must_use]
    pub fn new(threshold_ms: u64) -> Self {
        Self {
            threshold_ms,
            last_ms: None,
        }
    }

    /// Record a sample; returns the gap when it exceeds the threshold.
    pub fn observe(&mut self, now_ms: u64) -> Option<u64> {
        let gap = self.last_ms.map(|last| now_ms.saturating_sub(last));
        self.last_ms = Some(now_ms);
        gap.filter(|gap| *gap > self.threshold_ms)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drives the recovery protocol for one engine.
pub struct RecoveryTrigger<R, A> {
    engine: SyncEngine<R, A>,
    config: RecoveryConfig,
    scheduler: CoalescingScheduler,
    last_run: Mutex<Option<Instant>>,
    detector: Mutex<TimeJumpDetector>,
}

impl<R, A> std::fmt::Debug for RecoveryTrigger<R, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryTrigger")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<R: RemoteStore, A: AuthProvider> RecoveryTrigger<R, A> {
    #[must_use]
    pub fn new(engine: SyncEngine<R, A>, config: RecoveryConfig) -> Arc<Self> {
        let scheduler = CoalescingScheduler::new(Arc::clone(engine.inspector()));
        let detector = TimeJumpDetector::new(config.time_jump_threshold_ms);
        Arc::new(Self {
            engine,
            config,
            scheduler,
            last_run: Mutex::new(None),
            detector: Mutex::new(detector),
        })
    }

    /// Spawn the signal listener and the tick source.
    pub fn spawn(self: &Arc<Self>) -> RecoveryHandle {
        let (signals, mut rx) = mpsc::channel(SIGNAL_BUFFER);

        let this = Arc::clone(self);
        let listener = tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                this.handle_signal(signal);
            }
        });

        let ticks = signals.clone();
        let period = self.config.tick_interval();
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if ticks.send(LifecycleSignal::Tick { now_ms: epoch_ms() }).await.is_err() {
                    break;
                }
            }
        });

        RecoveryHandle {
            signals,
            listener,
            ticker,
        }
    }

    /// Dispatch one signal. Never blocks; runs are spawned.
    pub fn handle_signal(self: &Arc<Self>, signal: LifecycleSignal) {
        let inspector = self.engine.inspector();
        if !matches!(signal, LifecycleSignal::Tick { .. }) {
            inspector.event(
                EntryLevel::Debug,
                EventCode::RecoverySignal,
                format!("signal {}", signal.name()),
                Causality::new("environment", MODULE, signal.name()),
            );
        }

        match signal {
            LifecycleSignal::Visible => {
                self.engine.set_visible(true);
                let this = Arc::clone(self);
                let _ = self.scheduler.run_now(
                    RUN_KEY,
                    Causality::new(OWNER, MODULE, "visible"),
                    async move { this.execute("visible").await },
                );
            }
            LifecycleSignal::Hidden => self.engine.set_visible(false),
            LifecycleSignal::Online => {
                self.engine.set_online(true);
                self.schedule_run("online");
            }
            LifecycleSignal::Offline => self.engine.set_online(false),
            LifecycleSignal::Tick { now_ms } => {
                let jump = lock(&self.detector).observe(now_ms);
                if let Some(gap_ms) = jump {
                    inspector.log(
                        EntryLevel::Warn,
                        EventCode::TimeJump,
                        format!("wall clock jumped {gap_ms} ms between ticks; assuming suspension"),
                        Some(Causality::new("ticker", MODULE, "time_jump")),
                        Some(json!({ "gap_ms": gap_ms, "threshold_ms": self.config.time_jump_threshold_ms })),
                    );
                    self.schedule_run("time_jump");
                }
            }
        }
    }

    fn schedule_run(self: &Arc<Self>, reason: &'static str) {
        let this = Arc::clone(self);
        self.scheduler.schedule(
            RUN_KEY,
            self.config.debounce(),
            Causality::new(OWNER, MODULE, reason),
            async move { this.execute(reason).await },
        );
    }

    /// Run the protocol once unless another run executed within the minimum
    /// interval.
    pub async fn execute(self: Arc<Self>, reason: &str) {
        let inspector = Arc::clone(self.engine.inspector());
        let cause = Causality::new(OWNER, MODULE, reason);

        let suppressed = {
            let mut last = lock(&self.last_run);
            let too_soon = last.is_some_and(|at| at.elapsed() < self.config.min_interval());
            if !too_soon {
                *last = Some(Instant::now());
            }
            too_soon
        };
        if suppressed {
            inspector.event(
                EntryLevel::Debug,
                EventCode::RecoverySuppressed,
                format!("recovery ({reason}) suppressed; ran less than {} ms ago", self.config.min_interval_ms),
                cause,
            );
            return;
        }

        inspector.event(
            EntryLevel::Info,
            EventCode::RecoveryTrigger,
            format!("recovery triggered by {reason}"),
            cause.clone(),
        );
        inspector.record_trigger(OWNER, reason);

        self.engine.reset_locks_for(OWNER, reason);
        // Failures are logged by the guard; the flush re-checks per item.
        let _ = self.engine.ensure_session(OWNER).await;
        tokio::time::sleep(self.config.stabilize_delay()).await;
        self.engine.request_flush_for(OWNER, reason).wait().await;

        if self.engine.queue_depth().unwrap_or(0) > 0 && self.engine.is_online() {
            let engine = self.engine.clone();
            self.scheduler.schedule(
                SECONDARY_KEY,
                self.config.secondary_retry(),
                Causality::new(OWNER, MODULE, "secondary_retry"),
                async move {
                    engine.request_flush_for(OWNER, "secondary_retry").wait().await;
                },
            );
        }
    }
}

/// Running listener plus tick source. Dropping it stops neither; call
/// [`RecoveryHandle::shutdown`].
#[derive(Debug)]
pub struct RecoveryHandle {
    signals: mpsc::Sender<LifecycleSignal>,
    listener: JoinHandle<()>,
    ticker: JoinHandle<()>,
}

impl RecoveryHandle {
    /// Sender hosts use to report lifecycle signals.
    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<LifecycleSignal> {
        self.signals.clone()
    }

    /// Deliver a signal; returns false once the listener has stopped.
    pub async fn signal(&self, signal: LifecycleSignal) -> bool {
        self.signals.send(signal).await.is_ok()
    }

    pub fn shutdown(self) {
        self.ticker.abort();
        self.listener.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_tick_never_jumps() {
        let mut detector = TimeJumpDetector::new(15_000);
        assert_eq!(detector.observe(1_000_000), None);
        assert_eq!(detector.observe(1_005_000), None);
    }

    #[test]
    fn large_gap_is_reported_once() {
        let mut detector = TimeJumpDetector::new(15_000);
        detector.observe(0);
        assert_eq!(detector.observe(60_000), Some(60_000));
        assert_eq!(detector.observe(65_000), None);
    }

    #[test]
    fn clock_going_backwards_is_not_a_jump() {
        let mut detector = TimeJumpDetector::new(15_000);
        detector.observe(100_000);
        assert_eq!(detector.observe(10_000), None);
        assert_eq!(detector.observe(14_000), None);
    }

    #[test]
    fn environment_swap_returns_previous() {
        let env = Environment::default();
        assert!(env.set_online(false));
        assert!(!env.is_online());
        assert!(!env.set_online(true));
        assert!(env.is_visible());
    }

    #[test]
    fn signals_serialize_tagged() {
        let json = serde_json::to_value(LifecycleSignal::Tick { now_ms: 5 }).unwrap();
        assert_eq!(json["signal"], "tick");
        assert_eq!(json["now_ms"], 5);
        assert_eq!(LifecycleSignal::Visible.name(), "visible");
    }
}

//! Flush orchestrator: drains the outbox against the remote store.
//!
//! States are `Idle` and `Flushing(session)`. A request while flushing joins
//! the in-flight run. Each run carries a [`FlushToken`] minted from a shared
//! generation counter; the loop checks it before every item and before
//! committing, so a reset or a newer run silently retires an older loop.
//!
//! A watchdog armed per run force-releases the lock if the run never
//! terminates. It does not touch the queue and does not bump the counter:
//! a late-finishing loop may still commit the work it actually did.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::SyncConfig;
use crate::error::{RemoteError, StorageError, SyncErrorKind};
use crate::inspector::{Causality, EntryLevel, EventCode, Inspector};
use crate::outbox::{FlushCommit, ItemKey, OutboxItem, OutboxQueue};
use crate::record::{RemoteRow, epoch_ms};
use crate::recovery::Environment;
use crate::remote::{RemoteStore, with_timeout};
use crate::session::{AuthProvider, SessionGuard};

const MODULE: &str = "flush";

/// Cooperative-cancellation token for one flush run.
#[derive(Debug, Clone)]
pub struct FlushToken {
    session: u64,
    current: Arc<AtomicU64>,
}

impl FlushToken {
    #[must_use]
    pub fn session(&self) -> u64 {
        self.session
    }

    /// False once a reset or a newer run has minted a later session.
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.session
    }
}

/// Counts for one completed pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    pub session: u64,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub dropped: usize,
    /// Entries the commit skipped because a newer save replaced them.
    pub superseded: usize,
    /// The pass stopped early because the environment went offline.
    pub offline: bool,
    /// Writes were enqueued while the pass ran and still wait for a flush.
    pub new_arrivals: bool,
}

/// How a flush run ended, as seen by everyone holding its handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FlushOutcome {
    Completed(FlushReport),
    /// The watchdog released the lock before the run finished.
    WatchdogReleased,
    /// A reset retired the run.
    Superseded,
    /// Durable storage failed; nothing was committed.
    Failed { message: String },
}

/// Shared handle to one flush run. Every joiner of a run holds a clone.
#[derive(Debug, Clone)]
pub struct FlushHandle {
    session: u64,
    done: watch::Receiver<Option<FlushOutcome>>,
}

impl FlushHandle {
    #[must_use]
    pub fn session(&self) -> u64 {
        self.session
    }

    /// Wait until the run reaches a terminal state.
    pub async fn wait(mut self) -> FlushOutcome {
        let outcome = match self.done.wait_for(Option::is_some).await {
            Ok(value) => value.as_ref().cloned(),
            Err(_) => None,
        };
        outcome.unwrap_or(FlushOutcome::Superseded)
    }
}

#[derive(Debug)]
struct ActiveFlush {
    session: u64,
    started_at: Instant,
    done: watch::Sender<Option<FlushOutcome>>,
    watchdog: Option<JoinHandle<()>>,
}

#[derive(Debug)]
enum LockState {
    Idle,
    Flushing(ActiveFlush),
}

enum Acquired {
    Joined(FlushHandle),
    Started(FlushToken, FlushHandle),
}

/// The single-flight lock plus the generation counter.
#[derive(Debug)]
struct FlushControl {
    counter: Arc<AtomicU64>,
    state: Mutex<LockState>,
}

impl FlushControl {
    fn new() -> Self {
        Self {
            counter: Arc::new(AtomicU64::new(0)),
            state: Mutex::new(LockState::Idle),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&self) -> Acquired {
        let mut state = self.lock();
        if let LockState::Flushing(active) = &*state {
            return Acquired::Joined(FlushHandle {
                session: active.session,
                done: active.done.subscribe(),
            });
        }
        let session = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let (done, rx) = watch::channel(None);
        *state = LockState::Flushing(ActiveFlush {
            session,
            started_at: Instant::now(),
            done,
            watchdog: None,
        });
        Acquired::Started(
            FlushToken {
                session,
                current: Arc::clone(&self.counter),
            },
            FlushHandle { session, done: rx },
        )
    }

    /// Attach the watchdog task; aborts it if the run already ended.
    fn arm_watchdog(&self, session: u64, watchdog: JoinHandle<()>) -> bool {
        match &mut *self.lock() {
            LockState::Flushing(active) if active.session == session => {
                active.watchdog = Some(watchdog);
                true
            }
            _ => {
                watchdog.abort();
                false
            }
        }
    }

    fn take_if(&self, session: u64, require_current: bool) -> Option<ActiveFlush> {
        let mut state = self.lock();
        let owns_lock = matches!(&*state, LockState::Flushing(active) if active.session == session);
        if !owns_lock || (require_current && self.counter.load(Ordering::SeqCst) != session) {
            return None;
        }
        match std::mem::replace(&mut *state, LockState::Idle) {
            LockState::Flushing(active) => Some(active),
            LockState::Idle => None,
        }
    }

    /// Normal end of a run. False when the lock was already taken away.
    fn release(&self, session: u64, outcome: FlushOutcome) -> bool {
        let Some(active) = self.take_if(session, false) else {
            return false;
        };
        if let Some(watchdog) = active.watchdog {
            watchdog.abort();
        }
        active.done.send_replace(Some(outcome));
        true
    }

    /// Watchdog expiry: only if `session` still holds the lock and no newer
    /// session exists.
    fn force_release(&self, session: u64) -> bool {
        let Some(active) = self.take_if(session, true) else {
            return false;
        };
        // Called from the watchdog task itself; dropping detaches it.
        drop(active.watchdog);
        active.done.send_replace(Some(FlushOutcome::WatchdogReleased));
        true
    }

    /// Mint a new session and force `Idle`. Returns `(previous, new)`.
    fn reset(&self) -> (Option<u64>, u64) {
        let mut state = self.lock();
        let session = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = match std::mem::replace(&mut *state, LockState::Idle) {
            LockState::Flushing(active) => {
                if let Some(watchdog) = active.watchdog {
                    watchdog.abort();
                }
                active.done.send_replace(Some(FlushOutcome::Superseded));
                Some(active.session)
            }
            LockState::Idle => None,
        };
        (previous, session)
    }

    fn active(&self) -> Option<(u64, Instant)> {
        match &*self.lock() {
            LockState::Flushing(active) => Some((active.session, active.started_at)),
            LockState::Idle => None,
        }
    }
}

/// Drains the outbox with single-flight, retry and watchdog semantics.
pub struct FlushOrchestrator<R, A> {
    control: FlushControl,
    outbox: Arc<OutboxQueue>,
    remote: Arc<R>,
    guard: Arc<SessionGuard<A>>,
    inspector: Arc<Inspector>,
    env: Arc<Environment>,
    config: SyncConfig,
}

impl<R, A> std::fmt::Debug for FlushOrchestrator<R, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushOrchestrator")
            .field("control", &self.control)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<R: RemoteStore, A: AuthProvider> FlushOrchestrator<R, A> {
    pub(crate) fn new(
        outbox: Arc<OutboxQueue>,
        remote: Arc<R>,
        guard: Arc<SessionGuard<A>>,
        inspector: Arc<Inspector>,
        env: Arc<Environment>,
        config: SyncConfig,
    ) -> Self {
        Self {
            control: FlushControl::new(),
            outbox,
            remote,
            guard,
            inspector,
            env,
            config,
        }
    }

    /// Start a run, or join the one in flight. Must be called inside a tokio
    /// runtime.
    pub fn request(self: &Arc<Self>, owner: &str, reason: &str) -> FlushHandle {
        let cause = Causality::new(owner, MODULE, reason);
        self.inspector
            .event(EntryLevel::Debug, EventCode::FlushRequested, "flush requested", cause.clone());
        self.inspector.record_trigger(owner, reason);

        let (token, handle) = match self.control.acquire() {
            Acquired::Joined(handle) => {
                self.inspector.log(
                    EntryLevel::Debug,
                    EventCode::FlushJoined,
                    format!("joined in-flight flush session {}", handle.session()),
                    Some(cause),
                    Some(json!({ "session": handle.session() })),
                );
                return handle;
            }
            Acquired::Started(token, handle) => (token, handle),
        };

        let session = token.session();
        self.inspector.log(
            EntryLevel::Info,
            EventCode::FlushStart,
            format!("flush session {session} started"),
            Some(cause.clone()),
            Some(json!({ "session": session, "queue": self.outbox.size().unwrap_or(0) })),
        );
        self.inspector.record_flush_started(epoch_ms());

        let this = Arc::clone(self);
        let watchdog_owner = owner.to_string();
        let watchdog = tokio::spawn(async move {
            tokio::time::sleep(this.config.watchdog()).await;
            this.on_watchdog(session, &watchdog_owner);
        });
        if self.control.arm_watchdog(session, watchdog) {
            self.inspector.log(
                EntryLevel::Debug,
                EventCode::WatchdogArmed,
                format!("watchdog armed for session {session}"),
                Some(cause),
                Some(json!({ "session": session, "timeout_ms": self.config.watchdog_ms })),
            );
        }

        let this = Arc::clone(self);
        let owner = owner.to_string();
        tokio::spawn(async move { this.run(token, owner).await });
        handle
    }

    /// Mint a new session and force `Idle`, whatever the current state.
    pub fn reset_locks(&self, owner: &str, reason: &str) {
        let (previous, session) = self.control.reset();
        let message = match previous {
            Some(prev) => format!("lock reset; session {prev} retired"),
            None => "lock reset while idle".to_string(),
        };
        self.inspector.log(
            EntryLevel::Info,
            EventCode::LockReset,
            message,
            Some(Causality::new(owner, MODULE, reason)),
            Some(json!({ "previous_session": previous, "session": session })),
        );
    }

    #[must_use]
    pub fn is_flushing(&self) -> bool {
        self.control.active().is_some()
    }

    #[must_use]
    pub fn active_session(&self) -> Option<u64> {
        self.control.active().map(|(session, _)| session)
    }

    #[must_use]
    pub fn lock_age_ms(&self) -> Option<u64> {
        self.control
            .active()
            .map(|(_, started_at)| started_at.elapsed().as_millis() as u64)
    }

    fn on_watchdog(&self, session: u64, owner: &str) {
        if !self.control.force_release(session) {
            return;
        }
        self.inspector.violation(
            EventCode::WatchdogFired,
            format!(
                "flush session {session} exceeded {} ms; lock forcibly released",
                self.config.watchdog_ms
            ),
            Causality::new(owner, MODULE, "watchdog"),
        );
        self.inspector.record_error(
            SyncErrorKind::WatchdogTimeout,
            format!("flush session {session} never reached idle"),
        );
    }

    async fn run(self: Arc<Self>, token: FlushToken, owner: String) {
        let session = token.session();
        let outcome = match self.drain(&token, &owner).await {
            Ok(Some(report)) => FlushOutcome::Completed(report),
            Ok(None) => {
                self.inspector.event(
                    EntryLevel::Debug,
                    EventCode::FlushSuperseded,
                    format!("flush session {session} superseded; nothing committed"),
                    Causality::new(owner.as_str(), MODULE, "superseded"),
                );
                return;
            }
            Err(err) => FlushOutcome::Failed {
                message: err.to_string(),
            },
        };

        self.inspector.record_flush_finished(epoch_ms());
        let follow_up = matches!(&outcome, FlushOutcome::Completed(report) if report.new_arrivals);
        let meta = serde_json::to_value(&outcome).ok();
        let level = match &outcome {
            FlushOutcome::Failed { .. } => EntryLevel::Error,
            _ => EntryLevel::Info,
        };

        let cause = Causality::new(owner.as_str(), MODULE, "drained");
        if self.control.release(session, outcome) {
            self.inspector.log(level, EventCode::FlushEnd, format!("flush session {session} finished"), Some(cause.clone()), meta);
            self.inspector.event(
                EntryLevel::Debug,
                EventCode::WatchdogCancelled,
                format!("watchdog for session {session} cancelled"),
                cause,
            );
        } else {
            self.inspector.log(
                EntryLevel::Warn,
                EventCode::FlushEnd,
                format!("flush session {session} finished after its lock was released"),
                Some(cause),
                meta,
            );
        }

        if follow_up && token.is_current() {
            self.request(&owner, "follow_up");
        }
    }

    /// One pass over the queue. `Ok(None)` means the run was superseded.
    async fn drain(
        &self,
        token: &FlushToken,
        owner: &str,
    ) -> Result<Option<FlushReport>, StorageError> {
        let items = self.outbox.peek_all()?;
        let max_retries = self.config.max_retries;
        let mut report = FlushReport {
            session: token.session(),
            ..FlushReport::default()
        };
        let mut commit = FlushCommit::default();
        let mut seen: HashSet<ItemKey> = HashSet::with_capacity(items.len());
        let mut over_ceiling: Vec<OutboxItem> = Vec::new();

        for item in items {
            if !token.is_current() {
                return Ok(None);
            }
            if !self.env.is_online() {
                report.offline = true;
                self.inspector.event(
                    EntryLevel::Info,
                    EventCode::FlushOffline,
                    "offline; stopping flush pass",
                    Causality::new(owner, MODULE, "offline"),
                );
                break;
            }
            report.processed += 1;
            seen.insert(item.key());

            if item.attempts > max_retries {
                commit.dropped.push(item.key());
                over_ceiling.push(item);
                continue;
            }
            if self.push_item(&item, owner, token.session()).await {
                commit.succeeded.push(item.key());
            } else {
                commit.failed.push(item.key());
            }
        }

        if !token.is_current() {
            return Ok(None);
        }

        let result = self.outbox.commit(&commit, max_retries, epoch_ms())?;
        for item in over_ceiling
            .iter()
            .filter(|item| result.discarded.contains(&item.key()))
        {
            self.log_drop(item, owner, "retry ceiling exceeded before send");
        }
        for item in &result.exhausted {
            self.log_drop(item, owner, "retry ceiling exceeded");
        }
        report.succeeded = commit.succeeded.len();
        report.failed = result.retried;
        report.dropped = result.discarded.len() + result.exhausted.len();
        report.superseded = result.superseded;
        self.inspector.record_dropped(report.dropped as u64);

        if !report.offline {
            report.new_arrivals = self
                .outbox
                .peek_all()?
                .iter()
                .any(|item| !seen.contains(&item.key()));
        }
        Ok(Some(report))
    }

    /// Returns whether the remote confirmed the write.
    async fn push_item(&self, item: &OutboxItem, owner: &str, session: u64) -> bool {
        if let Err(err) = self.guard.ensure_valid_session(owner).await {
            self.item_failed(item, owner, session, EntryLevel::Error, &err.to_string());
            return false;
        }

        let row = RemoteRow {
            owner_id: item.owner_id.clone(),
            ..item.payload.to_row()
        };
        let mut result = self.upsert(row.clone()).await;

        if let Err(err) = &result {
            match err.kind() {
                SyncErrorKind::TransientNetwork => {
                    self.inspector.log(
                        EntryLevel::Debug,
                        EventCode::UpsertTransient,
                        format!("upsert of {} interrupted; retrying once", item.id),
                        Some(Causality::new(owner, MODULE, "transient_retry")),
                        Some(json!({ "record_id": item.id, "session": session, "error": err.to_string() })),
                    );
                    tokio::time::sleep(self.config.transient_backoff()).await;
                    result = self.upsert(row).await;
                }
                SyncErrorKind::AuthStale => {
                    if let Err(auth) = self
                        .guard
                        .force_refresh(owner, "remote rejected credentials")
                        .await
                    {
                        self.item_failed(item, owner, session, EntryLevel::Error, &auth.to_string());
                        return false;
                    }
                    result = self.upsert(row).await;
                }
                SyncErrorKind::ServerRejected | SyncErrorKind::WatchdogTimeout => {}
            }
        }

        match result {
            Ok(()) => {
                self.inspector.log(
                    EntryLevel::Info,
                    EventCode::UpsertOk,
                    format!("upserted {}", item.id),
                    Some(Causality::new(owner, MODULE, "upsert")),
                    Some(json!({ "record_id": item.id, "session": session })),
                );
                self.inspector.record_cloud_ok(epoch_ms());
                true
            }
            Err(err) if err.is_transient() => {
                self.inspector.log(
                    EntryLevel::Warn,
                    EventCode::UpsertTransient,
                    format!("upsert of {} failed twice; left queued", item.id),
                    Some(Causality::new(owner, MODULE, "transient")),
                    Some(json!({
                        "record_id": item.id,
                        "session": session,
                        "attempts": item.attempts + 1,
                        "error": err.to_string(),
                    })),
                );
                false
            }
            Err(err) => {
                self.inspector.record_error(err.kind(), err.to_string());
                self.item_failed(item, owner, session, EntryLevel::Error, &err.to_string());
                false
            }
        }
    }

    fn item_failed(&self, item: &OutboxItem, owner: &str, session: u64, level: EntryLevel, error: &str) {
        self.inspector.log(
            level,
            EventCode::UpsertFailed,
            format!("upsert of {} failed; left queued", item.id),
            Some(Causality::new(owner, MODULE, "upsert")),
            Some(json!({
                "record_id": item.id,
                "session": session,
                "attempts": item.attempts + 1,
                "error": error,
            })),
        );
    }

    fn log_drop(&self, item: &OutboxItem, owner: &str, reason: &str) {
        self.inspector.log(
            EntryLevel::Error,
            EventCode::ItemDropped,
            format!("dropped pending write for {} after {} attempts", item.id, item.attempts),
            Some(Causality::new(owner, MODULE, reason)),
            Some(json!({
                "record_id": item.id,
                "owner_id": item.owner_id,
                "attempts": item.attempts,
                "queued_at": item.queued_at,
            })),
        );
    }

    async fn upsert(&self, row: RemoteRow) -> Result<(), RemoteError> {
        with_timeout(
            self.config.upsert_timeout(),
            self.remote.upsert(&self.config.table, row),
        )
        .await
    }
}

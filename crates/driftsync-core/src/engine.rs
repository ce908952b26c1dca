//! The sync engine: one instance owning the local store, the outbox, the
//! flush orchestrator and the inspector. Cheap to clone; clones share state.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::Result;
use crate::flush::{FlushHandle, FlushOrchestrator};
use crate::inspector::{Causality, EngineProbe, EntryLevel, EventCode, Inspector, LogEntry, Snapshot};
use crate::kv::{KeyValueStore, SqliteStore};
use crate::local_store::{LocalStore, plan_merge};
use crate::outbox::{OutboxItem, OutboxQueue};
use crate::record::{Record, epoch_ms};
use crate::recovery::Environment;
use crate::remote::{RemoteStore, RowFilter, with_timeout};
use crate::session::{AuthProvider, SessionGuard, SessionStatus};

const MODULE: &str = "engine";

/// Local-store mutation delivered to [`SyncEngine::subscribe`] callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeEvent {
    Saved { id: String },
    Deleted { id: String },
    BulkCreated { count: usize },
    Merged { applied: usize },
}

type Callback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

#[derive(Default)]
struct SubscriberList {
    next_id: u64,
    callbacks: BTreeMap<u64, Callback>,
}

impl std::fmt::Debug for SubscriberList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberList")
            .field("count", &self.callbacks.len())
            .finish()
    }
}

fn lock_subscribers(list: &Mutex<SubscriberList>) -> MutexGuard<'_, SubscriberList> {
    list.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps a change callback registered; dropping it unsubscribes.
#[derive(Debug)]
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    list: Weak<Mutex<SubscriberList>>,
}

impl Subscription {
    /// Explicit form of dropping.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(list) = self.list.upgrade() {
            lock_subscribers(&list).callbacks.remove(&self.id);
        }
    }
}

/// Pending write as listed in diagnostics.
#[derive(Debug, Clone, Serialize)]
struct PendingSummary {
    id: String,
    owner_id: String,
    attempts: u32,
    queued_at: u64,
    last_attempt_at: Option<u64>,
}

#[derive(Debug, Serialize)]
struct DiagnosticReport {
    generated_at: String,
    version: &'static str,
    snapshot: Snapshot,
    pending: Vec<PendingSummary>,
    config: Config,
    log: Vec<LogEntry>,
}

struct EngineInner<R, A> {
    config: Config,
    local: LocalStore,
    outbox: Arc<OutboxQueue>,
    remote: Arc<R>,
    guard: Arc<SessionGuard<A>>,
    flush: Arc<FlushOrchestrator<R, A>>,
    inspector: Arc<Inspector>,
    env: Arc<Environment>,
    subscribers: Arc<Mutex<SubscriberList>>,
}

/// Local-first sync engine.
pub struct SyncEngine<R, A> {
    inner: Arc<EngineInner<R, A>>,
}

impl<R, A> Clone for SyncEngine<R, A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R, A> std::fmt::Debug for SyncEngine<R, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("table", &self.inner.config.sync.table)
            .field("env", &self.inner.env)
            .finish_non_exhaustive()
    }
}

impl<R: RemoteStore, A: AuthProvider> SyncEngine<R, A> {
    /// Build an engine over an existing key/value store.
    pub fn new(config: Config, kv: Arc<dyn KeyValueStore>, remote: R, auth: A) -> Result<Self> {
        config.validate()?;
        let inspector = Arc::new(Inspector::new(&config.inspector));
        let local = LocalStore::open(Arc::clone(&kv))?;
        let outbox = Arc::new(OutboxQueue::open(kv)?);
        let remote = Arc::new(remote);
        let env = Arc::new(Environment::default());
        let guard = Arc::new(SessionGuard::new(
            auth,
            config.auth.clone(),
            Arc::clone(&inspector),
        ));
        let flush = Arc::new(FlushOrchestrator::new(
            Arc::clone(&outbox),
            Arc::clone(&remote),
            Arc::clone(&guard),
            Arc::clone(&inspector),
            Arc::clone(&env),
            config.sync.clone(),
        ));

        info!(
            records = local.len()?,
            queued = outbox.size()?,
            table = %config.sync.table,
            "sync engine opened"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                local,
                outbox,
                remote,
                guard,
                flush,
                inspector,
                env,
                subscribers: Arc::new(Mutex::new(SubscriberList::default())),
            }),
        })
    }

    /// Build an engine persisting to the SQLite database in `config.storage`.
    pub fn open(config: Config, remote: R, auth: A) -> Result<Self> {
        let kv = SqliteStore::open(&config.storage.db_path)?;
        Self::new(config, Arc::new(kv), remote, auth)
    }

    /// Commit `record` locally, queue it and kick a flush. Returns the stored
    /// record once it is durable; network completion is not awaited.
    pub fn save(&self, mut record: Record, owner: &str) -> Result<Record> {
        let inner = &self.inner;
        let previous = inner.local.last_updated(&record.id)?;
        let now = epoch_ms();
        record.owner_id = owner.to_string();
        record.stamp(now, previous);

        inner.local.upsert(record.clone())?;
        inner.outbox.enqueue(record.clone(), owner, now)?;
        inner.inspector.log(
            EntryLevel::Info,
            EventCode::LocalSave,
            format!("saved {}", record.id),
            Some(Causality::new(owner, MODULE, "save")),
            Some(json!({ "record_id": record.id, "last_updated": record.last_updated })),
        );
        self.notify(&ChangeEvent::Saved {
            id: record.id.clone(),
        });

        self.kick_flush(owner, "save");
        Ok(record)
    }

    /// Insert many records with one local write and one outbox write.
    pub fn bulk_create(&self, records: Vec<Record>, owner: &str) -> Result<Vec<Record>> {
        let inner = &self.inner;
        let now = epoch_ms();
        let mut stamped = Vec::with_capacity(records.len());
        for mut record in records {
            let previous = inner.local.last_updated(&record.id)?;
            record.owner_id = owner.to_string();
            record.stamp(now, previous);
            stamped.push(record);
        }

        inner.local.upsert_many(stamped.clone())?;
        let count = inner.outbox.enqueue_many(stamped.clone(), owner, now)?;
        inner.inspector.log(
            EntryLevel::Info,
            EventCode::BulkCreate,
            format!("bulk created {count} records"),
            Some(Causality::new(owner, MODULE, "bulk_create")),
            Some(json!({ "count": count })),
        );
        self.notify(&ChangeEvent::BulkCreated { count });

        self.kick_flush(owner, "bulk_create");
        Ok(stamped)
    }

    /// Local records merged with the remote view.
    ///
    /// Pending writes always win. A failed remote read returns the local set.
    pub async fn get_all(&self, owner: Option<&str>) -> Result<Vec<Record>> {
        let inner = &self.inner;
        let local = inner.local.get_all(owner)?;
        let who = owner.unwrap_or(MODULE);
        if !inner.env.is_online() {
            debug!(owner = who, "offline; serving local records only");
            return Ok(local);
        }

        let filter = RowFilter::owner(owner);
        let select = with_timeout(
            inner.config.sync.select_timeout(),
            inner.remote.select(&inner.config.sync.table, &filter),
        )
        .await;
        let rows = match select {
            Ok(rows) => rows,
            Err(err) => {
                let level = if err.is_transient() {
                    EntryLevel::Warn
                } else {
                    inner.inspector.record_error(err.kind(), err.to_string());
                    EntryLevel::Error
                };
                inner.inspector.log(
                    level,
                    EventCode::MergeFailed,
                    format!("remote read failed; serving local cache: {err}"),
                    Some(Causality::new(who, MODULE, err.kind().to_string())),
                    Some(json!({ "local_records": local.len() })),
                );
                return Ok(local);
            }
        };

        let remote_rows = rows.len();
        let rows: Vec<_> = rows.into_iter().filter(|row| filter.matches(row)).collect();
        let pending: HashSet<String> = inner
            .outbox
            .peek_all()?
            .into_iter()
            .map(|item| item.id)
            .collect();
        let plan = plan_merge(&local, rows, inner.local.baseline_at()?, |id| {
            pending.contains(id)
        });

        for id in &plan.conflicts {
            inner.inspector.log(
                EntryLevel::Warn,
                EventCode::ConflictOverwrite,
                format!("remote copy of {id} overwrote a local change made since the last merge"),
                Some(Causality::new(who, MODULE, "last_write_wins")),
                Some(json!({ "record_id": id })),
            );
        }

        let applied = inner.local.apply_merge(&plan, epoch_ms())?;
        inner.inspector.log(
            EntryLevel::Info,
            EventCode::MergeOk,
            format!("merged {applied} remote rows"),
            Some(Causality::new(who, MODULE, "read_merge")),
            Some(json!({
                "remote_rows": remote_rows,
                "applied": applied,
                "skipped_pending": plan.skipped_pending.len(),
                "conflicts": plan.conflicts.len(),
            })),
        );
        if applied > 0 {
            self.notify(&ChangeEvent::Merged { applied });
        }
        Ok(inner.local.get_all(owner)?)
    }

    /// Remove locally (dropping any pending write) and delete remotely on a
    /// best-effort basis. Returns whether a local record existed.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let inner = &self.inner;
        let pending = inner.outbox.dequeue(id)?;
        let existing = inner.local.get(id)?;
        let removed = inner.local.delete(id)?;
        let owner = existing
            .map(|r| r.owner_id)
            .or_else(|| pending.as_ref().map(|p| p.owner_id.clone()))
            .unwrap_or_else(|| MODULE.to_string());

        inner.inspector.log(
            EntryLevel::Info,
            EventCode::LocalDelete,
            format!("deleted {id}"),
            Some(Causality::new(owner.as_str(), MODULE, "delete")),
            Some(json!({ "record_id": id, "existed": removed, "dequeued": pending.is_some() })),
        );
        if removed || pending.is_some() {
            self.notify(&ChangeEvent::Deleted { id: id.to_string() });
        }

        if !inner.env.is_online() {
            inner.inspector.log(
                EntryLevel::Warn,
                EventCode::RemoteDeleteFailed,
                format!("offline; remote copy of {id} left in place"),
                Some(Causality::new(owner.as_str(), MODULE, "offline")),
                Some(json!({ "record_id": id })),
            );
            return Ok(removed);
        }

        let result = with_timeout(
            inner.config.sync.delete_timeout(),
            inner.remote.delete(&inner.config.sync.table, id),
        )
        .await;
        match result {
            Ok(()) => {
                inner.inspector.log(
                    EntryLevel::Info,
                    EventCode::RemoteDeleteOk,
                    format!("remote copy of {id} deleted"),
                    Some(Causality::new(owner.as_str(), MODULE, "delete")),
                    Some(json!({ "record_id": id })),
                );
                inner.inspector.record_cloud_ok(epoch_ms());
            }
            Err(err) => {
                let level = if err.is_transient() {
                    EntryLevel::Warn
                } else {
                    EntryLevel::Error
                };
                inner.inspector.log(
                    level,
                    EventCode::RemoteDeleteFailed,
                    format!("remote delete of {id} failed: {err}"),
                    Some(Causality::new(owner.as_str(), MODULE, err.kind().to_string())),
                    Some(json!({ "record_id": id })),
                );
            }
        }
        Ok(removed)
    }

    /// Start a flush or join the one in flight.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn request_flush(&self, owner: &str) -> FlushHandle {
        self.request_flush_for(owner, "manual")
    }

    pub(crate) fn request_flush_for(&self, owner: &str, reason: &str) -> FlushHandle {
        self.inner.flush.request(owner, reason)
    }

    /// Flush after a local write when a runtime is available. Without one the
    /// write stays queued for the next explicit or recovery flush.
    fn kick_flush(&self, owner: &str, reason: &str) {
        if tokio::runtime::Handle::try_current().is_err() {
            self.inner.inspector.event(
                EntryLevel::Debug,
                EventCode::FlushDeferred,
                "no async runtime on this thread; flush deferred",
                Causality::new(owner, MODULE, reason),
            );
            return;
        }
        let _ = self.request_flush_for(owner, reason);
    }

    /// Escape hatch: retire any in-flight run and force `Idle`.
    pub fn reset_locks(&self) {
        self.reset_locks_for("operator", "manual");
    }

    pub(crate) fn reset_locks_for(&self, owner: &str, reason: &str) {
        self.inner.flush.reset_locks(owner, reason);
    }

    /// Check (and refresh if needed) the auth session. `Error::Auth` means
    /// the user must sign in again; queued writes are kept meanwhile.
    pub async fn ensure_session(&self, owner: &str) -> Result<SessionStatus> {
        Ok(self.inner.guard.ensure_valid_session(owner).await?)
    }

    pub fn queue_depth(&self) -> Result<usize> {
        Ok(self.inner.outbox.size()?)
    }

    /// Pending writes in flush order.
    pub fn pending_items(&self) -> Result<Vec<OutboxItem>> {
        Ok(self.inner.outbox.peek_all()?)
    }

    #[must_use]
    pub fn is_flushing(&self) -> bool {
        self.inner.flush.is_flushing()
    }

    /// Register a callback for local-store mutations. Callbacks run on the
    /// mutating task and must not block.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let mut list = lock_subscribers(&self.inner.subscribers);
        list.next_id += 1;
        let id = list.next_id;
        list.callbacks.insert(id, Arc::new(callback));
        Subscription {
            id,
            list: Arc::downgrade(&self.inner.subscribers),
        }
    }

    fn notify(&self, event: &ChangeEvent) {
        let callbacks: Vec<Callback> = lock_subscribers(&self.inner.subscribers)
            .callbacks
            .values()
            .cloned()
            .collect();
        for callback in callbacks {
            callback(event);
        }
    }

    #[must_use]
    pub fn get_log(&self) -> Vec<LogEntry> {
        self.inner.inspector.entries()
    }

    #[must_use]
    pub fn subscribe_log(&self) -> broadcast::Receiver<LogEntry> {
        self.inner.inspector.subscribe()
    }

    #[must_use]
    pub fn get_snapshot(&self) -> Snapshot {
        let flush = &self.inner.flush;
        self.inner.inspector.snapshot(EngineProbe {
            is_flushing: flush.is_flushing(),
            active_session: flush.active_session(),
            flush_lock_age_ms: flush.lock_age_ms(),
            queue_count: self.inner.outbox.size().unwrap_or(0),
            online: self.inner.env.is_online(),
            visible: self.inner.env.is_visible(),
        })
    }

    /// Snapshot, pending writes, effective config and the log as pretty JSON.
    pub fn export_diagnostic_report(&self) -> Result<String> {
        let pending = self
            .pending_items()?
            .into_iter()
            .map(|item| PendingSummary {
                id: item.id,
                owner_id: item.owner_id,
                attempts: item.attempts,
                queued_at: item.queued_at,
                last_attempt_at: item.last_attempt_at,
            })
            .collect();
        let report = DiagnosticReport {
            generated_at: chrono::Utc::now().to_rfc3339(),
            version: crate::VERSION,
            snapshot: self.get_snapshot(),
            pending,
            config: self.inner.config.clone(),
            log: self.get_log(),
        };
        Ok(serde_json::to_string_pretty(&report)?)
    }

    pub fn set_online(&self, online: bool) {
        if self.inner.env.set_online(online) != online {
            self.log_environment(if online { "online" } else { "offline" });
        }
    }

    pub fn set_visible(&self, visible: bool) {
        if self.inner.env.set_visible(visible) != visible {
            self.log_environment(if visible { "visible" } else { "hidden" });
        }
    }

    fn log_environment(&self, change: &str) {
        self.inner.inspector.event(
            EntryLevel::Info,
            EventCode::Environment,
            format!("environment now {change}"),
            Causality::new("environment", MODULE, change),
        );
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.inner.env.is_online()
    }

    #[must_use]
    pub fn inspector(&self) -> &Arc<Inspector> {
        &self.inner.inspector
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    #[must_use]
    pub fn remote(&self) -> &R {
        &self.inner.remote
    }

    #[must_use]
    pub fn auth(&self) -> &A {
        self.inner.guard.provider()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;
    use crate::simulation::{SimulatedAuth, SimulatedRemote};
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Engine = SyncEngine<SimulatedRemote, SimulatedAuth>;

    fn engine() -> Engine {
        SyncEngine::new(
            Config::default(),
            Arc::new(MemoryStore::new()),
            SimulatedRemote::new(),
            SimulatedAuth::signed_in("u1"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn save_stamps_owner_and_time() {
        let engine = engine();
        engine.set_online(false);
        let saved = engine
            .save(Record::new("a", "ignored", json!({ "n": 1 })), "u1")
            .unwrap();
        assert_eq!(saved.owner_id, "u1");
        assert!(saved.last_updated > 0);

        let again = engine.save(saved.clone(), "u1").unwrap();
        assert!(again.last_updated > saved.last_updated);
    }

    #[tokio::test]
    async fn subscription_stops_on_drop() {
        let engine = engine();
        engine.set_online(false);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let sub = engine.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        engine.save(Record::new("a", "u1", json!({})), "u1").unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        drop(sub);
        engine.save(Record::new("b", "u1", json!({})), "u1").unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn environment_changes_are_logged_once() {
        let engine = engine();
        engine.set_online(false);
        engine.set_online(false);
        engine.set_visible(false);
        assert_eq!(engine.inspector().count(EventCode::Environment), 2);
        let snap = engine.get_snapshot();
        assert!(!snap.online);
        assert!(!snap.visible);
    }

    #[tokio::test]
    async fn diagnostic_report_is_json() {
        let engine = engine();
        engine.set_online(false);
        engine.save(Record::new("a", "u1", json!({})), "u1").unwrap();
        let text = engine.export_diagnostic_report().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["snapshot"]["queue_count"], 1);
        assert_eq!(value["pending"][0]["id"], "a");
        assert_eq!(value["version"], crate::VERSION);
        assert!(value["log"].as_array().is_some_and(|log| !log.is_empty()));
    }

    #[test]
    fn save_without_runtime_keeps_write_queued() {
        let engine = engine();
        let saved = engine
            .save(Record::new("a", "u1", json!({ "n": 1 })), "u1")
            .unwrap();
        assert_eq!(saved.id, "a");
        engine
            .bulk_create(vec![Record::new("b", "u1", json!({}))], "u1")
            .unwrap();

        assert_eq!(engine.queue_depth().unwrap(), 2);
        assert!(!engine.is_flushing());
        assert_eq!(engine.inspector().count(EventCode::FlushDeferred), 2);
        assert_eq!(engine.inspector().count(EventCode::FlushStart), 0);
    }

    #[tokio::test]
    async fn deferred_writes_flush_on_next_request() {
        let engine = std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    let engine = engine();
                    engine.save(Record::new("a", "u1", json!({})), "u1").unwrap();
                    engine
                })
                .join()
                .unwrap()
        });
        assert_eq!(engine.queue_depth().unwrap(), 1);

        engine.request_flush("u1").wait().await;
        assert_eq!(engine.queue_depth().unwrap(), 0);
        assert!(engine.remote().row("a").is_some());
    }

    #[tokio::test]
    async fn failed_refresh_surfaces_as_auth_error() {
        let engine = engine();
        assert_eq!(engine.ensure_session("u1").await.unwrap(), SessionStatus::Valid);

        engine.auth().expire_session();
        engine.auth().fail_refresh(true);
        let err = engine.ensure_session("u1").await.unwrap_err();
        assert!(matches!(err, crate::Error::Auth(_)));
        assert!(err.remediation().is_some());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut config = Config::default();
        config.sync.table = String::new();
        let err = SyncEngine::new(
            config,
            Arc::new(MemoryStore::new()),
            SimulatedRemote::new(),
            SimulatedAuth::signed_in("u1"),
        )
        .unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }
}

//! Inspector: bounded structured event log plus a derived snapshot.
//!
//! The engine is the only writer. Readers either pull ([`Inspector::entries`],
//! [`Inspector::snapshot`]) or subscribe to the live broadcast. Every entry is
//! also mirrored into `tracing` at the matching level.
//!
//! Nothing in the engine reads the inspector to make decisions; it is a sink.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::InspectorConfig;
use crate::error::SyncErrorKind;
use crate::record::epoch_ms;

/// Severity of a log entry. `Violation` marks a broken internal invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryLevel {
    Debug,
    Info,
    Warn,
    Error,
    Violation,
}

/// Stable event codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventCode {
    LocalSave,
    LocalDelete,
    BulkCreate,
    FlushRequested,
    FlushJoined,
    FlushStart,
    FlushEnd,
    FlushSuperseded,
    FlushOffline,
    FlushDeferred,
    LockReset,
    WatchdogArmed,
    WatchdogFired,
    WatchdogCancelled,
    TimerScheduled,
    TimerFired,
    TimerCancelled,
    AuthValid,
    AuthRefreshed,
    AuthFatal,
    UpsertOk,
    UpsertTransient,
    UpsertFailed,
    ItemDropped,
    MergeOk,
    MergeFailed,
    ConflictOverwrite,
    RemoteDeleteOk,
    RemoteDeleteFailed,
    RecoverySignal,
    RecoveryTrigger,
    RecoverySuppressed,
    TimeJump,
    Environment,
}

impl std::fmt::Display for EventCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // serde's rename is the canonical spelling
        let text = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        f.write_str(&text)
    }
}

/// Who caused an entry, in which module, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Causality {
    pub owner: String,
    pub module: String,
    pub reason: String,
}

impl Causality {
    #[must_use]
    pub fn new(owner: impl Into<String>, module: &str, reason: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            module: module.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub timestamp_ms: u64,
    pub level: EntryLevel,
    pub code: EventCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causality: Option<Causality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

/// Last sync failure surfaced in the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub kind: SyncErrorKind,
    pub message: String,
    pub at_ms: u64,
}

/// Engine-side values the inspector cannot know by itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineProbe {
    pub is_flushing: bool,
    pub active_session: Option<u64>,
    pub flush_lock_age_ms: Option<u64>,
    pub queue_count: usize,
    pub online: bool,
    pub visible: bool,
}

/// Point-in-time view of the engine; derived, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub taken_at_ms: u64,
    pub is_flushing: bool,
    pub active_session: Option<u64>,
    pub flush_lock_age_ms: Option<u64>,
    pub queue_count: usize,
    pub online: bool,
    pub visible: bool,
    pub last_error: Option<LastError>,
    pub last_violation: Option<LogEntry>,
    pub last_source: Option<String>,
    pub last_reason: Option<String>,
    pub last_cloud_ok_at: Option<u64>,
    pub last_flush_started_at: Option<u64>,
    pub last_flush_finished_at: Option<u64>,
    pub dropped_total: u64,
    pub log_len: usize,
}

#[derive(Debug)]
struct InspectorState {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    next_seq: u64,
    last_error: Option<LastError>,
    last_violation: Option<LogEntry>,
    last_source: Option<String>,
    last_reason: Option<String>,
    last_cloud_ok_at: Option<u64>,
    last_flush_started_at: Option<u64>,
    last_flush_finished_at: Option<u64>,
    dropped_total: u64,
}

/// Append-only bounded log with derived counters.
#[derive(Debug)]
pub struct Inspector {
    state: Mutex<InspectorState>,
    live: broadcast::Sender<LogEntry>,
}

impl Default for Inspector {
    fn default() -> Self {
        Self::new(&InspectorConfig::default())
    }
}

impl Inspector {
    #[must_use]
    pub fn new(config: &InspectorConfig) -> Self {
        let capacity = config.log_capacity.max(1);
        let (live, _) = broadcast::channel(config.broadcast_capacity.max(1));
        Self {
            state: Mutex::new(InspectorState {
                entries: VecDeque::with_capacity(capacity),
                capacity,
                next_seq: 1,
                last_error: None,
                last_violation: None,
                last_source: None,
                last_reason: None,
                last_cloud_ok_at: None,
                last_flush_started_at: None,
                last_flush_finished_at: None,
                dropped_total: 0,
            }),
            live,
        }
    }

    // A panic while logging must not take diagnostics down with it.
    fn lock(&self) -> MutexGuard<'_, InspectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an entry, evicting the oldest when full.
    pub fn log(
        &self,
        level: EntryLevel,
        code: EventCode,
        message: impl Into<String>,
        causality: Option<Causality>,
        meta: Option<serde_json::Value>,
    ) -> LogEntry {
        let entry = {
            let mut state = self.lock();
            let entry = LogEntry {
                seq: state.next_seq,
                timestamp_ms: epoch_ms(),
                level,
                code,
                message: message.into(),
                causality,
                meta,
            };
            state.next_seq += 1;
            if state.entries.len() == state.capacity {
                state.entries.pop_front();
            }
            state.entries.push_back(entry.clone());
            if level == EntryLevel::Violation {
                state.last_violation = Some(entry.clone());
            }
            entry
        };
        mirror_to_tracing(&entry);
        // No receivers is fine.
        let _ = self.live.send(entry.clone());
        entry
    }

    /// Shorthand for the common case of a causality triple and no meta.
    pub fn event(
        &self,
        level: EntryLevel,
        code: EventCode,
        message: impl Into<String>,
        causality: Causality,
    ) -> LogEntry {
        self.log(level, code, message, Some(causality), None)
    }

    /// Log `violation` and update the last-violation pointer.
    pub fn violation(&self, code: EventCode, message: impl Into<String>, causality: Causality) {
        self.log(EntryLevel::Violation, code, message, Some(causality), None);
    }

    pub fn record_error(&self, kind: SyncErrorKind, message: impl Into<String>) {
        self.lock().last_error = Some(LastError {
            kind,
            message: message.into(),
            at_ms: epoch_ms(),
        });
    }

    pub fn record_cloud_ok(&self, at_ms: u64) {
        self.lock().last_cloud_ok_at = Some(at_ms);
    }

    pub fn record_trigger(&self, source: &str, reason: &str) {
        let mut state = self.lock();
        state.last_source = Some(source.to_string());
        state.last_reason = Some(reason.to_string());
    }

    pub fn record_flush_started(&self, at_ms: u64) {
        self.lock().last_flush_started_at = Some(at_ms);
    }

    pub fn record_flush_finished(&self, at_ms: u64) {
        self.lock().last_flush_finished_at = Some(at_ms);
    }

    pub fn record_dropped(&self, count: u64) {
        self.lock().dropped_total += count;
    }

    /// Buffered entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().entries.iter().cloned().collect()
    }

    /// Number of buffered entries carrying `code`.
    #[must_use]
    pub fn count(&self, code: EventCode) -> usize {
        self.lock().entries.iter().filter(|e| e.code == code).count()
    }

    /// Live feed of entries appended from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.live.subscribe()
    }

    /// Combine counters with the engine's current state. Never blocks on I/O.
    #[must_use]
    pub fn snapshot(&self, probe: EngineProbe) -> Snapshot {
        let state = self.lock();
        Snapshot {
            taken_at_ms: epoch_ms(),
            is_flushing: probe.is_flushing,
            active_session: probe.active_session,
            flush_lock_age_ms: probe.flush_lock_age_ms,
            queue_count: probe.queue_count,
            online: probe.online,
            visible: probe.visible,
            last_error: state.last_error.clone(),
            last_violation: state.last_violation.clone(),
            last_source: state.last_source.clone(),
            last_reason: state.last_reason.clone(),
            last_cloud_ok_at: state.last_cloud_ok_at,
            last_flush_started_at: state.last_flush_started_at,
            last_flush_finished_at: state.last_flush_finished_at,
            dropped_total: state.dropped_total,
            log_len: state.entries.len(),
        }
    }
}

fn mirror_to_tracing(entry: &LogEntry) {
    let (owner, module, reason) = entry.causality.as_ref().map_or(("", "", ""), |c| {
        (c.owner.as_str(), c.module.as_str(), c.reason.as_str())
    });
    let code = entry.code;
    let seq = entry.seq;
    let message = entry.message.as_str();
    match entry.level {
        EntryLevel::Debug => {
            tracing::debug!(seq, %code, owner, module, reason, "{message}");
        }
        EntryLevel::Info => {
            tracing::info!(seq, %code, owner, module, reason, "{message}");
        }
        EntryLevel::Warn => {
            tracing::warn!(seq, %code, owner, module, reason, "{message}");
        }
        EntryLevel::Error => {
            tracing::error!(seq, %code, owner, module, reason, "{message}");
        }
        EntryLevel::Violation => {
            tracing::error!(seq, %code, owner, module, reason, violation = true, "{message}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cause() -> Causality {
        Causality::new("test", "inspector", "unit")
    }

    fn small(capacity: usize) -> Inspector {
        Inspector::new(&InspectorConfig {
            log_capacity: capacity,
            broadcast_capacity: 16,
        })
    }

    #[test]
    fn ring_evicts_oldest() {
        let inspector = small(3);
        for i in 0..5 {
            inspector.event(EntryLevel::Info, EventCode::LocalSave, format!("save {i}"), cause());
        }
        let entries = inspector.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].seq, 3);
        assert_eq!(entries[2].seq, 5);
        assert_eq!(entries[2].message, "save 4");
    }

    #[test]
    fn violation_updates_pointer() {
        let inspector = small(10);
        inspector.violation(EventCode::WatchdogFired, "lock forcibly released", cause());
        let snap = inspector.snapshot(EngineProbe::default());
        let violation = snap.last_violation.unwrap();
        assert_eq!(violation.level, EntryLevel::Violation);
        assert_eq!(violation.code, EventCode::WatchdogFired);
    }

    #[test]
    fn snapshot_merges_probe_and_counters() {
        let inspector = small(10);
        inspector.record_cloud_ok(1234);
        inspector.record_trigger("recovery", "visible");
        inspector.record_error(SyncErrorKind::ServerRejected, "500");
        inspector.record_dropped(2);
        let snap = inspector.snapshot(EngineProbe {
            is_flushing: true,
            active_session: Some(4),
            flush_lock_age_ms: Some(10),
            queue_count: 7,
            online: true,
            visible: false,
        });
        assert!(snap.is_flushing);
        assert_eq!(snap.queue_count, 7);
        assert_eq!(snap.last_cloud_ok_at, Some(1234));
        assert_eq!(snap.last_source.as_deref(), Some("recovery"));
        assert_eq!(snap.last_error.unwrap().kind, SyncErrorKind::ServerRejected);
        assert_eq!(snap.dropped_total, 2);
    }

    #[test]
    fn count_by_code() {
        let inspector = small(10);
        inspector.event(EntryLevel::Info, EventCode::RecoveryTrigger, "run", cause());
        inspector.event(EntryLevel::Debug, EventCode::RecoverySuppressed, "skip", cause());
        assert_eq!(inspector.count(EventCode::RecoveryTrigger), 1);
    }

    #[tokio::test]
    async fn live_subscribers_receive_entries() {
        let inspector = small(10);
        let mut rx = inspector.subscribe();
        inspector.event(EntryLevel::Warn, EventCode::UpsertTransient, "timeout", cause());
        let entry = rx.recv().await.unwrap();
        assert_eq!(entry.code, EventCode::UpsertTransient);
    }

    #[test]
    fn codes_serialize_screaming_snake() {
        assert_eq!(EventCode::RecoveryTrigger.to_string(), "RECOVERY_TRIGGER");
        let entry = small(1).event(EntryLevel::Info, EventCode::LockReset, "reset", cause());
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["code"], "LOCK_RESET");
        assert!(json.get("meta").is_none());
    }
}

//! Local record store: authoritative for what callers read.
//!
//! Every mutation is persisted through the [`KeyValueStore`] before it
//! returns. Remote state is folded in by [`plan_merge`] + [`LocalStore::apply_merge`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::kv::{KeyValueStore, load_json, store_json};
use crate::record::{Record, RemoteRow};

pub(crate) const RECORDS_KEY: &str = "driftsync/records";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LocalState {
    records: BTreeMap<String, Record>,
    /// Epoch ms of the last completed merge with the remote.
    #[serde(default)]
    baseline_at: u64,
}

/// Durable, in-memory-indexed record map.
pub struct LocalStore {
    kv: Arc<dyn KeyValueStore>,
    state: Mutex<LocalState>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore").finish_non_exhaustive()
    }
}

impl LocalStore {
    /// Load persisted records, or start empty.
    pub fn open(kv: Arc<dyn KeyValueStore>) -> Result<Self, StorageError> {
        let state = load_json::<LocalState>(kv.as_ref(), RECORDS_KEY)?.unwrap_or_default();
        Ok(Self {
            kv,
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, LocalState>, StorageError> {
        self.state.lock().map_err(|_| StorageError::Poisoned)
    }

    /// Overwrite-or-insert by id. Durable on return.
    pub fn upsert(&self, record: Record) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        let previous = state.records.insert(record.id.clone(), record.clone());
        if let Err(err) = store_json(self.kv.as_ref(), RECORDS_KEY, &*state) {
            match previous {
                Some(prev) => state.records.insert(record.id, prev),
                None => state.records.remove(&record.id),
            };
            return Err(err);
        }
        Ok(())
    }

    /// Insert many records with a single durable write.
    pub fn upsert_many(&self, records: Vec<Record>) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        let before = state.records.clone();
        for record in records {
            state.records.insert(record.id.clone(), record);
        }
        if let Err(err) = store_json(self.kv.as_ref(), RECORDS_KEY, &*state) {
            state.records = before;
            return Err(err);
        }
        Ok(())
    }

    /// Remove by id. Returns whether a record was present.
    pub fn delete(&self, id: &str) -> Result<bool, StorageError> {
        let mut state = self.lock()?;
        let Some(previous) = state.records.remove(id) else {
            return Ok(false);
        };
        if let Err(err) = store_json(self.kv.as_ref(), RECORDS_KEY, &*state) {
            state.records.insert(previous.id.clone(), previous);
            return Err(err);
        }
        Ok(true)
    }

    pub fn get(&self, id: &str) -> Result<Option<Record>, StorageError> {
        Ok(self.lock()?.records.get(id).cloned())
    }

    /// Local records, optionally restricted to one owner, ordered by id.
    pub fn get_all(&self, owner: Option<&str>) -> Result<Vec<Record>, StorageError> {
        let state = self.lock()?;
        Ok(state
            .records
            .values()
            .filter(|r| owner.is_none_or(|o| r.owner_id == o))
            .cloned()
            .collect())
    }

    pub fn last_updated(&self, id: &str) -> Result<Option<u64>, StorageError> {
        Ok(self.lock()?.records.get(id).map(|r| r.last_updated))
    }

    pub fn baseline_at(&self) -> Result<u64, StorageError> {
        Ok(self.lock()?.baseline_at)
    }

    pub fn len(&self) -> Result<usize, StorageError> {
        Ok(self.lock()?.records.len())
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Persist a merge plan as the new baseline.
    ///
    /// Records are only replaced if they still carry the timestamp the plan
    /// was computed against; a save that raced the remote read wins.
    pub fn apply_merge(&self, plan: &MergePlan, merged_at: u64) -> Result<usize, StorageError> {
        let mut state = self.lock()?;
        let before = state.clone();
        let mut applied = 0;
        for update in &plan.apply {
            let current = state.records.get(&update.record.id).map(|r| r.last_updated);
            if current == update.replaces {
                state
                    .records
                    .insert(update.record.id.clone(), update.record.clone());
                applied += 1;
            }
        }
        state.baseline_at = merged_at;
        if let Err(err) = store_json(self.kv.as_ref(), RECORDS_KEY, &*state) {
            *state = before;
            return Err(err);
        }
        Ok(applied)
    }
}

/// One remote row selected to replace (or create) a local record.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeUpdate {
    pub record: Record,
    /// `last_updated` of the local copy being replaced, `None` if absent.
    pub replaces: Option<u64>,
}

/// Outcome of comparing remote rows against the local set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergePlan {
    pub apply: Vec<MergeUpdate>,
    /// Ids whose remote row was ignored because a local write is pending.
    pub skipped_pending: Vec<String>,
    /// Ids where a newer remote row overwrites a local change made after the
    /// previous baseline (last-write-wins with no merge).
    pub conflicts: Vec<String>,
}

/// Decide which remote rows replace local copies.
///
/// A pending outbox write always wins. Otherwise a remote row wins when the
/// local copy is absent or strictly older.
pub fn plan_merge(
    local: &[Record],
    remote: Vec<RemoteRow>,
    baseline_at: u64,
    is_pending: impl Fn(&str) -> bool,
) -> MergePlan {
    let local_by_id: BTreeMap<&str, &Record> = local.iter().map(|r| (r.id.as_str(), r)).collect();
    let mut plan = MergePlan::default();

    for row in remote {
        if is_pending(&row.id) {
            plan.skipped_pending.push(row.id);
            continue;
        }
        let current = local_by_id.get(row.id.as_str());
        let cloud_newer = current.is_none_or(|l| row.updated_at > l.last_updated);
        if !cloud_newer {
            continue;
        }
        if current.is_some_and(|l| l.last_updated > baseline_at) {
            plan.conflicts.push(row.id.clone());
        }
        plan.apply.push(MergeUpdate {
            replaces: current.map(|l| l.last_updated),
            record: row.into_record(),
        });
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;
    use serde_json::json;

    fn rec(id: &str, owner: &str, ts: u64) -> Record {
        Record {
            id: id.into(),
            owner_id: owner.into(),
            last_updated: ts,
            payload: json!({ "v": ts }),
        }
    }

    fn row(id: &str, ts: u64) -> RemoteRow {
        rec(id, "u1", ts).to_row()
    }

    #[test]
    fn upsert_persists_before_return() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let store = LocalStore::open(Arc::clone(&kv)).unwrap();
        store.upsert(rec("a", "u1", 1)).unwrap();

        let reopened = LocalStore::open(kv).unwrap();
        assert_eq!(reopened.get("a").unwrap(), Some(rec("a", "u1", 1)));
    }

    #[test]
    fn get_all_filters_by_owner() {
        let store = LocalStore::open(Arc::new(MemoryStore::new())).unwrap();
        store.upsert(rec("a", "u1", 1)).unwrap();
        store.upsert(rec("b", "u2", 1)).unwrap();
        assert_eq!(store.get_all(None).unwrap().len(), 2);
        let mine = store.get_all(Some("u2")).unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, "b");
    }

    #[test]
    fn delete_reports_presence() {
        let store = LocalStore::open(Arc::new(MemoryStore::new())).unwrap();
        store.upsert(rec("a", "u1", 1)).unwrap();
        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn merge_prefers_newer_remote() {
        let local = vec![rec("a", "u1", 10), rec("b", "u1", 10)];
        let plan = plan_merge(&local, vec![row("a", 20), row("b", 5), row("c", 1)], 100, |_| false);
        let ids: Vec<_> = plan.apply.iter().map(|u| u.record.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(plan.apply[0].replaces, Some(10));
        assert_eq!(plan.apply[1].replaces, None);
        assert!(plan.conflicts.is_empty());
    }

    #[test]
    fn merge_never_applies_over_pending_write() {
        let local = vec![rec("a", "u1", 10)];
        let plan = plan_merge(&local, vec![row("a", 9_999)], 0, |id| id == "a");
        assert!(plan.apply.is_empty());
        assert_eq!(plan.skipped_pending, vec!["a".to_string()]);
    }

    #[test]
    fn merge_equal_timestamps_keep_local() {
        let local = vec![rec("a", "u1", 10)];
        let plan = plan_merge(&local, vec![row("a", 10)], 0, |_| false);
        assert!(plan.apply.is_empty());
    }

    #[test]
    fn merge_flags_overwrite_of_unbaselined_local_change() {
        let local = vec![rec("a", "u1", 50)];
        let plan = plan_merge(&local, vec![row("a", 60)], 40, |_| false);
        assert_eq!(plan.conflicts, vec!["a".to_string()]);
        assert_eq!(plan.apply.len(), 1);
    }

    #[test]
    fn apply_merge_skips_records_changed_since_plan() {
        let store = LocalStore::open(Arc::new(MemoryStore::new())).unwrap();
        store.upsert(rec("a", "u1", 10)).unwrap();
        let local = store.get_all(None).unwrap();
        let plan = plan_merge(&local, vec![row("a", 20)], 0, |_| false);

        // A save lands between the remote read and the apply.
        store.upsert(rec("a", "u1", 30)).unwrap();
        assert_eq!(store.apply_merge(&plan, 99).unwrap(), 0);
        assert_eq!(store.get("a").unwrap().unwrap().last_updated, 30);
        assert_eq!(store.baseline_at().unwrap(), 99);
    }
}

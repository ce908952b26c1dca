//! Durable outbox of remote writes not yet confirmed.
//!
//! Keyed by record id: re-saving a record replaces its pending entry. Items
//! keep insertion order, which is the order a flush processes them in.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::kv::{KeyValueStore, load_json, store_json};
use crate::record::Record;

pub(crate) const OUTBOX_KEY: &str = "driftsync/outbox";

/// A pending remote write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxItem {
    pub id: String,
    pub payload: Record,
    pub owner_id: String,
    pub queued_at: u64,
    pub attempts: u32,
    pub last_attempt_at: Option<u64>,
    /// Bumped on every enqueue; lets a flush commit tell whether the entry
    /// it processed has since been replaced by a newer save.
    pub revision: u64,
}

impl OutboxItem {
    #[must_use]
    pub fn key(&self) -> ItemKey {
        ItemKey {
            id: self.id.clone(),
            revision: self.revision,
        }
    }
}

/// Identity of one specific enqueue of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemKey {
    pub id: String,
    pub revision: u64,
}

/// The queue mutation produced by one flush pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushCommit {
    pub succeeded: Vec<ItemKey>,
    pub dropped: Vec<ItemKey>,
    pub failed: Vec<ItemKey>,
}

impl FlushCommit {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.dropped.is_empty() && self.failed.is_empty()
    }
}

/// What [`OutboxQueue::commit`] did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitReport {
    pub removed: usize,
    pub retried: usize,
    /// `dropped` keys that were still queued and are now gone.
    pub discarded: Vec<ItemKey>,
    /// Items whose failed attempt pushed them past the retry ceiling.
    pub exhausted: Vec<OutboxItem>,
    /// Entries left alone because a newer save replaced them mid-flush.
    pub superseded: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct OutboxState {
    items: Vec<OutboxItem>,
    next_revision: u64,
}

/// Durable, deduplicated, insertion-ordered outbox.
pub struct OutboxQueue {
    kv: Arc<dyn KeyValueStore>,
    state: Mutex<OutboxState>,
}

impl std::fmt::Debug for OutboxQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxQueue").finish_non_exhaustive()
    }
}

impl OutboxQueue {
    pub fn open(kv: Arc<dyn KeyValueStore>) -> Result<Self, StorageError> {
        let state = load_json::<OutboxState>(kv.as_ref(), OUTBOX_KEY)?.unwrap_or_default();
        Ok(Self {
            kv,
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, OutboxState>, StorageError> {
        self.state.lock().map_err(|_| StorageError::Poisoned)
    }

    /// Persist `next` and swap it in; the in-memory view only changes once
    /// the write is durable.
    fn persist(&self, state: &mut OutboxState, next: OutboxState) -> Result<(), StorageError> {
        store_json(self.kv.as_ref(), OUTBOX_KEY, &next)?;
        *state = next;
        Ok(())
    }

    /// Replace any entry for `record.id` with a fresh one at the tail.
    pub fn enqueue(
        &self,
        record: Record,
        owner_id: &str,
        now: u64,
    ) -> Result<OutboxItem, StorageError> {
        let mut state = self.lock()?;
        let mut next = state.clone();
        next.items.retain(|item| item.id != record.id);
        next.next_revision += 1;
        let item = OutboxItem {
            id: record.id.clone(),
            owner_id: owner_id.to_string(),
            payload: record,
            queued_at: now,
            attempts: 0,
            last_attempt_at: None,
            revision: next.next_revision,
        };
        next.items.push(item.clone());
        self.persist(&mut state, next)?;
        Ok(item)
    }

    /// Enqueue several records with one durable write.
    pub fn enqueue_many(
        &self,
        records: Vec<Record>,
        owner_id: &str,
        now: u64,
    ) -> Result<usize, StorageError> {
        let mut state = self.lock()?;
        let mut next = state.clone();
        let count = records.len();
        for record in records {
            next.items.retain(|item| item.id != record.id);
            next.next_revision += 1;
            next.items.push(OutboxItem {
                id: record.id.clone(),
                owner_id: owner_id.to_string(),
                payload: record,
                queued_at: now,
                attempts: 0,
                last_attempt_at: None,
                revision: next.next_revision,
            });
        }
        self.persist(&mut state, next)?;
        Ok(count)
    }

    pub fn dequeue(&self, id: &str) -> Result<Option<OutboxItem>, StorageError> {
        let mut state = self.lock()?;
        let Some(pos) = state.items.iter().position(|item| item.id == id) else {
            return Ok(None);
        };
        let mut next = state.clone();
        let removed = next.items.remove(pos);
        self.persist(&mut state, next)?;
        Ok(Some(removed))
    }

    pub fn size(&self) -> Result<usize, StorageError> {
        Ok(self.lock()?.items.len())
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.size()? == 0)
    }

    /// Pending items, oldest first.
    pub fn peek_all(&self) -> Result<Vec<OutboxItem>, StorageError> {
        Ok(self.lock()?.items.clone())
    }

    pub fn contains(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.lock()?.items.iter().any(|item| item.id == id))
    }

    /// Apply one flush pass in a single durable write.
    ///
    /// Failed items get `attempts += 1`; any that now exceed `max_retries`
    /// are removed and returned in [`CommitReport::exhausted`]. Keys whose
    /// revision no longer matches the queue are skipped.
    pub fn commit(
        &self,
        commit: &FlushCommit,
        max_retries: u32,
        now: u64,
    ) -> Result<CommitReport, StorageError> {
        let mut report = CommitReport::default();
        if commit.is_empty() {
            return Ok(report);
        }

        let mut state = self.lock()?;
        let mut next = state.clone();
        let matches = |item: &OutboxItem, key: &ItemKey| {
            item.id == key.id && item.revision == key.revision
        };

        let mut remove = |key: &ItemKey| {
            let before = next.items.len();
            next.items.retain(|item| !matches(item, key));
            next.items.len() < before
        };
        for key in &commit.succeeded {
            if remove(key) {
                report.removed += 1;
            } else {
                report.superseded += 1;
            }
        }
        for key in &commit.dropped {
            if remove(key) {
                report.removed += 1;
                report.discarded.push(key.clone());
            } else {
                report.superseded += 1;
            }
        }

        for key in &commit.failed {
            let Some(pos) = next.items.iter().position(|item| matches(item, key)) else {
                report.superseded += 1;
                continue;
            };
            let item = &mut next.items[pos];
            item.attempts = item.attempts.saturating_add(1);
            item.last_attempt_at = Some(now);
            if item.attempts > max_retries {
                report.exhausted.push(next.items.remove(pos));
            } else {
                report.retried += 1;
            }
        }

        self.persist(&mut state, next)?;
        Ok(report)
    }
}

//! Record model shared by the local store, the outbox and the remote.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Current wall-clock time in epoch milliseconds.
#[must_use]
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A caller-owned record. The engine only reads `id`, `owner_id` and
/// `last_updated`; `payload` is carried opaquely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub owner_id: String,
    /// Epoch ms, stamped by the engine on every save.
    pub last_updated: u64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Record {
    #[must_use]
    pub fn new(id: impl Into<String>, owner_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            last_updated: 0,
            payload,
        }
    }

    /// Stamp `now`, never moving backwards from `previous`.
    pub(crate) fn stamp(&mut self, now: u64, previous: Option<u64>) {
        self.last_updated = match previous {
            Some(prev) if prev >= now => prev + 1,
            _ => now,
        };
    }

    #[must_use]
    pub fn to_row(&self) -> RemoteRow {
        RemoteRow {
            id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            payload: self.payload.clone(),
            updated_at: self.last_updated,
        }
    }
}

/// Shape written to and read from the remote table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRow {
    pub id: String,
    pub owner_id: String,
    pub payload: serde_json::Value,
    pub updated_at: u64,
}

impl RemoteRow {
    #[must_use]
    pub fn into_record(self) -> Record {
        Record {
            id: self.id,
            owner_id: self.owner_id,
            last_updated: self.updated_at,
            payload: self.payload,
        }
    }
}

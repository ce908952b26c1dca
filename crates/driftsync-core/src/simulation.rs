//! In-process remote store and auth provider with fault injection.
//!
//! Used by the test suites and by `dsync simulate`.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AuthError, RemoteError};
use crate::record::RemoteRow;
use crate::remote::{RemoteStore, RowFilter};
use crate::session::{AuthProvider, Session};

/// How the simulated remote answers a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultMode {
    #[default]
    Ok,
    /// Fail immediately with a timeout error.
    Timeout,
    /// Fail immediately as if the connection was reset.
    Abort,
    /// Fail with a server-side rejection.
    Reject,
    /// Fail with an expired-credentials error.
    Unauthorized,
    /// Never answer; only the caller's timeout ends the call.
    Hang,
}

impl std::fmt::Display for FaultMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::Timeout => "timeout",
            Self::Abort => "abort",
            Self::Reject => "reject",
            Self::Unauthorized => "unauthorized",
            Self::Hang => "hang",
        };
        f.write_str(name)
    }
}

impl FromStr for FaultMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ok" => Ok(Self::Ok),
            "timeout" => Ok(Self::Timeout),
            "abort" => Ok(Self::Abort),
            "reject" => Ok(Self::Reject),
            "unauthorized" => Ok(Self::Unauthorized),
            "hang" => Ok(Self::Hang),
            _ => Err(format!(
                "unknown fault mode: {s}. Expected one of: ok, timeout, abort, reject, unauthorized, hang"
            )),
        }
    }
}

impl FaultMode {
    async fn respond(self, delay: Duration) -> Result<(), RemoteError> {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match self {
            Self::Ok => Ok(()),
            Self::Timeout => Err(RemoteError::Timeout { ms: 0 }),
            Self::Abort => Err(RemoteError::Aborted("connection reset".into())),
            Self::Reject => Err(RemoteError::Rejected {
                status: Some(500),
                message: "simulated server error".into(),
            }),
            Self::Unauthorized => Err(RemoteError::Unauthorized("jwt expired".into())),
            Self::Hang => std::future::pending().await,
        }
    }
}

#[derive(Debug, Default)]
struct RemoteState {
    rows: BTreeMap<String, RemoteRow>,
    upsert_mode: FaultMode,
    select_mode: FaultMode,
    delete_mode: FaultMode,
    /// Upserts answered with `injected_mode` before `upsert_mode` applies again.
    injected_failures: u32,
    injected_mode: FaultMode,
    delay: Duration,
    upsert_calls: usize,
    select_calls: usize,
    delete_calls: usize,
}

/// Remote table held in memory.
#[derive(Debug, Default)]
pub struct SimulatedRemote {
    state: Mutex<RemoteState>,
}

impl SimulatedRemote {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_upsert_mode(&self, mode: FaultMode) {
        self.lock().upsert_mode = mode;
    }

    pub fn set_select_mode(&self, mode: FaultMode) {
        self.lock().select_mode = mode;
    }

    pub fn set_delete_mode(&self, mode: FaultMode) {
        self.lock().delete_mode = mode;
    }

    /// Answer the next `count` upserts with `mode`.
    pub fn fail_next_upserts(&self, count: u32, mode: FaultMode) {
        let mut state = self.lock();
        state.injected_failures = count;
        state.injected_mode = mode;
    }

    /// Latency added before every answer.
    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = delay;
    }

    /// Seed a row as if another device had written it.
    pub fn insert_row(&self, row: RemoteRow) {
        self.lock().rows.insert(row.id.clone(), row);
    }

    #[must_use]
    pub fn row(&self, id: &str) -> Option<RemoteRow> {
        self.lock().rows.get(id).cloned()
    }

    #[must_use]
    pub fn rows(&self) -> Vec<RemoteRow> {
        self.lock().rows.values().cloned().collect()
    }

    #[must_use]
    pub fn upsert_calls(&self) -> usize {
        self.lock().upsert_calls
    }

    #[must_use]
    pub fn select_calls(&self) -> usize {
        self.lock().select_calls
    }

    #[must_use]
    pub fn delete_calls(&self) -> usize {
        self.lock().delete_calls
    }
}

impl RemoteStore for SimulatedRemote {
    async fn upsert(&self, _table: &str, row: RemoteRow) -> Result<(), RemoteError> {
        let (mode, delay) = {
            let mut state = self.lock();
            state.upsert_calls += 1;
            let mode = if state.injected_failures > 0 {
                state.injected_failures -= 1;
                state.injected_mode
            } else {
                state.upsert_mode
            };
            (mode, state.delay)
        };
        mode.respond(delay).await?;
        self.lock().rows.insert(row.id.clone(), row);
        Ok(())
    }

    async fn select(&self, _table: &str, filter: &RowFilter) -> Result<Vec<RemoteRow>, RemoteError> {
        let (mode, delay) = {
            let mut state = self.lock();
            state.select_calls += 1;
            (state.select_mode, state.delay)
        };
        mode.respond(delay).await?;
        Ok(self
            .lock()
            .rows
            .values()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect())
    }

    async fn delete(&self, _table: &str, id: &str) -> Result<(), RemoteError> {
        let (mode, delay) = {
            let mut state = self.lock();
            state.delete_calls += 1;
            (state.delete_mode, state.delay)
        };
        mode.respond(delay).await?;
        self.lock().rows.remove(id);
        Ok(())
    }
}

#[derive(Debug)]
struct AuthState {
    user_id: String,
    session: Option<Session>,
    fail_refresh: bool,
    refresh_delay: Duration,
    refresh_count: usize,
}

/// Auth provider whose session can be expired or broken on demand.
#[derive(Debug)]
pub struct SimulatedAuth {
    state: Mutex<AuthState>,
}

impl SimulatedAuth {
    #[must_use]
    pub fn signed_in(user_id: &str) -> Self {
        Self {
            state: Mutex::new(AuthState {
                user_id: user_id.to_string(),
                session: Some(Session {
                    user_id: user_id.to_string(),
                    expires_at_ms: None,
                }),
                fail_refresh: false,
                refresh_delay: Duration::ZERO,
                refresh_count: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AuthState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the current session; the next check finds none.
    pub fn expire_session(&self) {
        self.lock().session = None;
    }

    pub fn set_expiry(&self, expires_at_ms: Option<u64>) {
        if let Some(session) = self.lock().session.as_mut() {
            session.expires_at_ms = expires_at_ms;
        }
    }

    pub fn fail_refresh(&self, fail: bool) {
        self.lock().fail_refresh = fail;
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        self.lock().refresh_delay = delay;
    }

    #[must_use]
    pub fn refresh_count(&self) -> usize {
        self.lock().refresh_count
    }
}

impl AuthProvider for SimulatedAuth {
    async fn get_session(&self) -> Result<Option<Session>, AuthError> {
        Ok(self.lock().session.clone())
    }

    async fn refresh_session(&self) -> Result<Option<Session>, AuthError> {
        let delay = {
            let mut state = self.lock();
            state.refresh_count += 1;
            state.refresh_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        if state.fail_refresh {
            return Err(AuthError::Provider("refresh token revoked".into()));
        }
        let session = Session {
            user_id: state.user_id.clone(),
            expires_at_ms: None,
        };
        state.session = Some(session.clone());
        Ok(Some(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: &str, owner: &str) -> RemoteRow {
        RemoteRow {
            id: id.into(),
            owner_id: owner.into(),
            payload: json!({}),
            updated_at: 1,
        }
    }

    #[tokio::test]
    async fn upsert_and_select_by_owner() {
        let remote = SimulatedRemote::new();
        remote.upsert("t", row("a", "u1")).await.unwrap();
        remote.upsert("t", row("b", "u2")).await.unwrap();
        let mine = remote.select("t", &RowFilter::owner(Some("u1"))).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(remote.upsert_calls(), 2);
        assert_eq!(remote.select_calls(), 1);
    }

    #[tokio::test]
    async fn injected_failures_precede_mode() {
        let remote = SimulatedRemote::new();
        remote.fail_next_upserts(1, FaultMode::Abort);
        let err = remote.upsert("t", row("a", "u1")).await.unwrap_err();
        assert!(err.is_transient());
        remote.upsert("t", row("a", "u1")).await.unwrap();
        assert!(remote.row("a").is_some());
    }

    #[tokio::test]
    async fn failed_upsert_stores_nothing() {
        let remote = SimulatedRemote::new();
        remote.set_upsert_mode(FaultMode::Reject);
        assert!(remote.upsert("t", row("a", "u1")).await.is_err());
        assert!(remote.rows().is_empty());
    }

    #[test]
    fn fault_mode_parses() {
        assert_eq!("Timeout".parse::<FaultMode>().unwrap(), FaultMode::Timeout);
        assert_eq!(FaultMode::Unauthorized.to_string(), "unauthorized");
        assert!("flaky".parse::<FaultMode>().is_err());
    }
}

//! Session guard: makes sure a usable auth session exists before network writes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;

use crate::config::AuthConfig;
use crate::error::{AuthError, SyncErrorKind};
use crate::inspector::{Causality, EntryLevel, EventCode, Inspector};
use crate::record::epoch_ms;

const MODULE: &str = "session";

/// An authenticated session as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    /// Epoch ms; `None` means the provider does not expire sessions.
    pub expires_at_ms: Option<u64>,
}

impl Session {
    #[must_use]
    pub fn expires_within(&self, margin_ms: u64, now_ms: u64) -> bool {
        self.expires_at_ms
            .is_some_and(|exp| exp <= now_ms.saturating_add(margin_ms))
    }
}

/// Source of credentials. How they are obtained is not the engine's concern.
pub trait AuthProvider: Send + Sync + 'static {
    fn get_session(&self) -> impl Future<Output = Result<Option<Session>, AuthError>> + Send;

    fn refresh_session(&self) -> impl Future<Output = Result<Option<Session>, AuthError>> + Send;
}

/// Non-fatal outcome of [`SessionGuard::ensure_valid_session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Valid,
    Refreshed,
}

/// Validates and refreshes the session, logging every decision.
pub struct SessionGuard<A> {
    provider: A,
    config: AuthConfig,
    inspector: Arc<Inspector>,
}

impl<A: AuthProvider> SessionGuard<A> {
    pub fn new(provider: A, config: AuthConfig, inspector: Arc<Inspector>) -> Self {
        Self {
            provider,
            config,
            inspector,
        }
    }

    pub fn provider(&self) -> &A {
        &self.provider
    }

    /// `Ok` unless a needed refresh fails; `Err` means the user must sign in again.
    pub async fn ensure_valid_session(&self, owner: &str) -> Result<SessionStatus, AuthError> {
        let reason = match self.provider.get_session().await {
            Ok(Some(session))
                if !session.expires_within(self.config.refresh_margin_ms, epoch_ms()) =>
            {
                self.inspector.event(
                    EntryLevel::Debug,
                    EventCode::AuthValid,
                    "session valid",
                    Causality::new(owner, MODULE, "check"),
                );
                return Ok(SessionStatus::Valid);
            }
            Ok(Some(_)) => "expiring".to_string(),
            Ok(None) => "absent".to_string(),
            Err(err) => format!("check failed: {err}"),
        };
        self.refresh(owner, &reason).await
    }

    /// Refresh unconditionally, e.g. after the remote rejected our token.
    pub async fn force_refresh(&self, owner: &str, reason: &str) -> Result<SessionStatus, AuthError> {
        self.refresh(owner, reason).await
    }

    async fn refresh(&self, owner: &str, reason: &str) -> Result<SessionStatus, AuthError> {
        let timeout = Duration::from_millis(self.config.refresh_timeout_ms);
        let started = Instant::now();
        let outcome = match tokio::time::timeout(timeout, self.provider.refresh_session()).await {
            Ok(Ok(Some(_))) => Ok(SessionStatus::Refreshed),
            Ok(Ok(None)) => Err(AuthError::NoSession),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(AuthError::RefreshTimeout {
                ms: self.config.refresh_timeout_ms,
            }),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &outcome {
            Ok(_) => {
                self.inspector.log(
                    EntryLevel::Info,
                    EventCode::AuthRefreshed,
                    format!("session refreshed ({reason})"),
                    Some(Causality::new(owner, MODULE, reason)),
                    Some(json!({ "elapsed_ms": elapsed_ms })),
                );
            }
            Err(err) => {
                self.inspector.log(
                    EntryLevel::Error,
                    EventCode::AuthFatal,
                    format!("session refresh failed: {err}"),
                    Some(Causality::new(owner, MODULE, reason)),
                    Some(json!({ "elapsed_ms": elapsed_ms })),
                );
                self.inspector
                    .record_error(SyncErrorKind::AuthStale, err.to_string());
            }
        }
        outcome
    }
}

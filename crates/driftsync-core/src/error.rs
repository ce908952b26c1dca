//! Error types for driftsync-core
//!
//! Remote and auth failures are classified into a closed [`SyncErrorKind`]
//! at the boundary where the collaborator's result is first inspected. The
//! flush loop and the inspector only ever match on that kind.

use std::fmt::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<(String, String)>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a labelled command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push((label.into(), command.into()));
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for (label, command) in &self.commands {
                let _ = writeln!(output, "    - {label}: {command}");
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for driftsync-core
#[derive(Error, Debug)]
pub enum Error {
    /// Durable storage faults. Fatal for the calling operation.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Unrecoverable authentication failure; the user must sign in again
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Storage(_) => Some(
                Remediation::new("Local storage failed. Check the database path and disk space.")
                    .command("Inspect outbox", "dsync status --db <path>")
                    .alternative("Ensure the data directory is writable."),
            ),
            Self::Config(err) => Some(err.remediation()),
            Self::Auth(_) => Some(
                Remediation::new("The session could not be refreshed. Sign in again.")
                    .alternative("Queued writes are kept and flushed after re-authentication."),
            ),
            Self::Json(_) => None,
        }
    }
}

/// Failure classes the sync engine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    /// Abort or timeout. Retried automatically, never surfaced as blocking.
    TransientNetwork,
    /// Session needs a refresh; fatal only if the refresh itself fails.
    AuthStale,
    /// Unexpected remote error. Retried up to the ceiling, then dropped.
    ServerRejected,
    /// Internal liveness failure: a flush never reached a terminal state.
    WatchdogTimeout,
}

impl std::fmt::Display for SyncErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TransientNetwork => write!(f, "transient_network"),
            Self::AuthStale => write!(f, "auth_stale"),
            Self::ServerRejected => write!(f, "server_rejected"),
            Self::WatchdogTimeout => write!(f, "watchdog_timeout"),
        }
    }
}

/// Errors reported by a [`crate::remote::RemoteStore`] implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote call timed out after {ms} ms")]
    Timeout { ms: u64 },

    #[error("remote call aborted: {0}")]
    Aborted(String),

    #[error("remote rejected credentials: {0}")]
    Unauthorized(String),

    #[error("remote rejected request (status {status:?}): {message}")]
    Rejected { status: Option<u16>, message: String },
}

impl RemoteError {
    #[must_use]
    pub fn kind(&self) -> SyncErrorKind {
        match self {
            Self::Timeout { .. } | Self::Aborted(_) => SyncErrorKind::TransientNetwork,
            Self::Unauthorized(_) => SyncErrorKind::AuthStale,
            Self::Rejected { .. } => SyncErrorKind::ServerRejected,
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind() == SyncErrorKind::TransientNetwork
    }
}

/// Errors reported by an [`crate::session::AuthProvider`] or the session guard.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("no session available")]
    NoSession,

    #[error("session refresh timed out after {ms} ms")]
    RefreshTimeout { ms: u64 },

    #[error("auth provider failed: {0}")]
    Provider(String),
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Corrupt value under key {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Storage lock poisoned")]
    Poisoned,
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config value: {0}")]
    Invalid(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Read { path, .. } => {
                Remediation::new(format!("Check that {} exists and is readable.", path.display()))
                    .command("Show defaults", "dsync config")
            }
            Self::Parse(_) | Self::Render(_) => {
                Remediation::new("Fix the TOML syntax in the config file.")
                    .command("Show defaults", "dsync config")
            }
            Self::Invalid(_) => Remediation::new("Correct the offending value and retry.")
                .alternative("Remove the key to fall back to its default."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_classify_at_boundary() {
        assert_eq!(
            RemoteError::Timeout { ms: 25_000 }.kind(),
            SyncErrorKind::TransientNetwork
        );
        assert_eq!(
            RemoteError::Aborted("reset".into()).kind(),
            SyncErrorKind::TransientNetwork
        );
        assert_eq!(
            RemoteError::Unauthorized("jwt expired".into()).kind(),
            SyncErrorKind::AuthStale
        );
        let rejected = RemoteError::Rejected {
            status: Some(500),
            message: "boom".into(),
        };
        assert_eq!(rejected.kind(), SyncErrorKind::ServerRejected);
        assert!(!rejected.is_transient());
    }

    #[test]
    fn kind_display_is_snake_case() {
        assert_eq!(SyncErrorKind::WatchdogTimeout.to_string(), "watchdog_timeout");
        let json = serde_json::to_string(&SyncErrorKind::AuthStale).unwrap();
        assert_eq!(json, "\"auth_stale\"");
    }

    #[test]
    fn storage_error_has_remediation() {
        let err = Error::Storage(StorageError::Database("disk full".into()));
        let text = err.remediation().unwrap().render_plain();
        assert!(text.contains("To fix:"));
        assert!(text.contains("dsync status"));
    }

    #[test]
    fn auth_error_asks_for_sign_in() {
        let err = Error::from(AuthError::Provider("refresh token revoked".into()));
        let text = err.remediation().unwrap().render_plain();
        assert!(text.contains("Sign in again"));
    }

    #[test]
    fn rusqlite_errors_convert() {
        let err: StorageError = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, StorageError::Database(_)));
    }
}

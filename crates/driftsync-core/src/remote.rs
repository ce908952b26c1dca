//! Remote store collaborator.
//!
//! Implementations report failures as [`RemoteError`]; the engine classifies
//! them once via [`RemoteError::kind`] and never inspects messages.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RemoteError;
use crate::record::RemoteRow;

/// Row filter for [`RemoteStore::select`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFilter {
    pub owner_id: Option<String>,
}

impl RowFilter {
    #[must_use]
    pub fn owner(owner_id: Option<&str>) -> Self {
        Self {
            owner_id: owner_id.map(str::to_string),
        }
    }

    #[must_use]
    pub fn matches(&self, row: &RemoteRow) -> bool {
        self.owner_id.as_deref().is_none_or(|o| row.owner_id == o)
    }
}

/// Remote table access keyed by record id and owner.
pub trait RemoteStore: Send + Sync + 'static {
    fn upsert(
        &self,
        table: &str,
        row: RemoteRow,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    fn select(
        &self,
        table: &str,
        filter: &RowFilter,
    ) -> impl Future<Output = Result<Vec<RemoteRow>, RemoteError>> + Send;

    fn delete(&self, table: &str, id: &str) -> impl Future<Output = Result<(), RemoteError>> + Send;
}

/// Bound a remote call; expiry maps to [`RemoteError::Timeout`].
pub(crate) async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, RemoteError>>,
) -> Result<T, RemoteError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout {
            ms: limit.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(owner: &str) -> RemoteRow {
        RemoteRow {
            id: "a".into(),
            owner_id: owner.into(),
            payload: json!({}),
            updated_at: 1,
        }
    }

    #[test]
    fn filter_by_owner() {
        assert!(RowFilter::default().matches(&row("u1")));
        assert!(RowFilter::owner(Some("u1")).matches(&row("u1")));
        assert!(!RowFilter::owner(Some("u2")).matches(&row("u1")));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_maps_to_transient_error() {
        let err = with_timeout(Duration::from_millis(250), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, RemoteError>(())
        })
        .await
        .unwrap_err();
        assert_eq!(err, RemoteError::Timeout { ms: 250 });
        assert!(err.is_transient());
    }
}

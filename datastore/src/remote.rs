//! Remote API interface.
//!
//! Request building and the wire protocol live behind [`RemoteApi`]; the
//! sync engine only needs mutations, paged sync queries and per-model
//! subscriptions.

use async_trait::async_trait;
use futures::stream::BoxStream;
use harbor_engine::{ChangeType, ModelName, QueryPredicate, Record, Timestamp, Version};
use serde::{Deserialize, Serialize};

/// A local change to publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRequest {
    pub mutation_type: ChangeType,
    pub record: Record,
    /// Version the change was made against; absent for creates
    pub version: Option<Version>,
    /// Server-side condition for the write
    pub condition: QueryPredicate,
}

/// One page of a sync query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub model: ModelName,
    /// Return only changes after this time; absent for a base sync
    pub last_sync: Option<Timestamp>,
    pub limit: usize,
    pub next_token: Option<String>,
    pub filter: Option<QueryPredicate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPage {
    pub items: Vec<Record>,
    pub next_token: Option<String>,
}

/// Kind of change a subscription listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubscriptionType {
    OnCreate,
    OnUpdate,
    OnDelete,
}

impl SubscriptionType {
    pub const ALL: [SubscriptionType; 3] = [
        SubscriptionType::OnCreate,
        SubscriptionType::OnUpdate,
        SubscriptionType::OnDelete,
    ];
}

impl std::fmt::Display for SubscriptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SubscriptionType::OnCreate => "onCreate",
            SubscriptionType::OnUpdate => "onUpdate",
            SubscriptionType::OnDelete => "onDelete",
        };
        f.write_str(name)
    }
}

/// Remote API errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteError {
    /// The server holds a newer version of the record
    #[error("conflict with server copy of {}", .remote.key())]
    Conflict { remote: Box<Record> },

    #[error("network error: {0}")]
    Network(String),

    #[error("service error {status}: {message}")]
    Service { status: u16, message: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conditional request failed: {0}")]
    ConditionalCheckFailed(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RemoteError {
    pub fn conflict(remote: Record) -> Self {
        RemoteError::Conflict {
            remote: Box::new(remote),
        }
    }

    /// Transient failures: network errors, 5xx and throttling.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Network(_) => true,
            RemoteError::Service { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, RemoteError::Conflict { .. })
    }
}

/// Stream of records delivered by a subscription.
pub type RecordStream = BoxStream<'static, Result<Record, RemoteError>>;

#[async_trait]
pub trait RemoteApi: Send + Sync + 'static {
    /// Publish a local change. Returns the server's copy with its new version.
    async fn mutate(&self, request: MutationRequest) -> Result<Record, RemoteError>;

    /// Fetch one page of a base or delta sync query.
    async fn sync(&self, request: SyncRequest) -> Result<SyncPage, RemoteError>;

    /// Open a subscription. Returning `Ok` means it is established.
    async fn subscribe(
        &self,
        model: &str,
        kind: SubscriptionType,
    ) -> Result<RecordStream, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn retryable_classification() {
        assert!(RemoteError::Network("reset".into()).is_retryable());
        assert!(RemoteError::Service {
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());
        assert!(RemoteError::Service {
            status: 429,
            message: "slow down".into()
        }
        .is_retryable());
        assert!(!RemoteError::Service {
            status: 400,
            message: "bad".into()
        }
        .is_retryable());
        assert!(!RemoteError::Validation("bad".into()).is_retryable());
        assert!(!RemoteError::Unauthorized("expired".into()).is_retryable());
    }

    #[test]
    fn conflict_is_distinguishable() {
        let remote = Record::remote("Post", "p1", json!({"id": "p1"}), 3, 0);
        let err = RemoteError::conflict(remote);

        assert!(err.is_conflict());
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "conflict with server copy of Post/p1");
    }
}

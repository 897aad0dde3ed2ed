//! # Harbor DataStore
//!
//! Local-first persistence with background sync to a remote API.
//!
//! Local writes land in a [`LocalStore`] immediately and are queued in the
//! [`MutationOutbox`]. When a [`RemoteApi`] is configured the
//! [`Orchestrator`] runs three pipelines on tokio:
//!
//! - the [`MutationProcessor`] drains the outbox, handing conflicts to the
//!   [`ConflictResolver`];
//! - the [`SubscriptionProcessor`] merges real-time remote changes;
//! - the [`SyncProcessor`] runs base and delta sync queries.
//!
//! All remote data goes through the [`Merger`], which applies the
//! version-compare rule from [`harbor_engine::merge`] under a per-record lock.
//!
//! ```rust,no_run
//! use harbor_datastore::{DataStore, Record};
//! use harbor_datastore::engine::{FieldDef, FieldType, ModelSchema, SchemaRegistry};
//! use serde_json::json;
//!
//! # async fn run() -> harbor_datastore::Result<()> {
//! let registry = SchemaRegistry::new(1).with_model(ModelSchema::new(
//!     "Post",
//!     vec![FieldDef::required("id", FieldType::String)],
//! ));
//! let store = DataStore::builder(registry).build()?;
//!
//! store.save(Record::new("Post", "p1", json!({"id": "p1"}))).await?;
//! assert!(store.get("Post", "p1").await?.is_some());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod conflict;
pub mod datastore;
pub mod error;
pub mod events;
pub mod merger;
pub mod mutation_processor;
pub mod orchestrator;
pub mod outbox;
pub mod reachability;
pub mod remote;
pub mod resilience;
pub mod storage;
pub mod subscription_processor;
pub mod sync_processor;
pub mod sync_time;

pub use harbor_engine as engine;

pub use config::{ConfigError, DataStoreConfig, DataStoreConfigBuilder};
pub use conflict::{AlwaysApplyRemote, ConflictHandler, ConflictOutcome, ConflictResolver, FnConflictHandler};
pub use datastore::{DataStore, DataStoreBuilder};
pub use error::{DataStoreError, ErrorHandler, LoggingErrorHandler, Result};
pub use events::{DataStoreEvent, EventHub};
pub use merger::{MergeOutcome, Merger};
pub use mutation_processor::MutationProcessor;
pub use orchestrator::Orchestrator;
pub use outbox::{MutationOutbox, OutboxEvent};
pub use reachability::Reachability;
pub use remote::{
    MutationRequest, RecordStream, RemoteApi, RemoteError, SubscriptionType, SyncPage, SyncRequest,
};
pub use resilience::RetryConfig;
pub use storage::{LocalStore, MemoryStore};
pub use subscription_processor::SubscriptionProcessor;
pub use sync_processor::{HydrateReport, ModelSyncReport, SyncProcessor};
pub use sync_time::SyncTimeRegistry;

pub use harbor_engine::{
    ChangeType, ConflictData, ConflictResolutionDecision, Initiator, OrchestratorState,
    QueryOptions, QueryPredicate, Record, RecordKey, StorageItemChange,
};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> harbor_engine::Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as harbor_engine::Timestamp
}

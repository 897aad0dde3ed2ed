//! # Harbor Engine
//!
//! The deterministic core of the Harbor DataStore sync engine.
//!
//! This crate holds the data model and every decision the sync engine makes
//! that does not need IO: how local changes fold together in the outbox,
//! whether remote data may overwrite local data, what a conflict decision
//! turns into, and how local tables answer conditional writes and queries.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine has no knowledge of storage, network or runtime
//! - **Deterministic**: same inputs always produce same outputs
//! - **Testable**: pure logic, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`Record`] is a model instance: primary key, JSON payload, a
//! server-assigned version (absent until first synced), a soft delete flag
//! and timestamps. Models are described by [`ModelSchema`]s held in a
//! [`SchemaRegistry`], which also knows the parent-first sync order.
//!
//! ### Outbox entries
//!
//! Local writes become [`PendingMutation`]s. While an entry has not been
//! sent, a newer write to the same record is folded into it by
//! [`collapse`], so at most one unsent entry exists per record.
//!
//! ### Merging remote data
//!
//! [`merge::decide`] applies the version-compare rule: remote data is
//! written only when its version passes the [`VersionRule`], and only the
//! version is adopted while a local change to the record is still pending.
//!
//! ### Conflicts
//!
//! A rejected mutation produces [`ConflictData`]. The host's
//! [`ConflictResolutionDecision`] is turned into a [`ResolutionPlan`].
//!
//! ## Quick Start
//!
//! ```rust
//! use harbor_engine::{
//!     FieldDef, FieldType, ModelSchema, ModelTables, QueryOptions, QueryPredicate,
//!     SchemaRegistry,
//! };
//! use serde_json::json;
//!
//! // 1. Register models
//! let registry = SchemaRegistry::new(1).with_model(ModelSchema::new(
//!     "Post",
//!     vec![
//!         FieldDef::required("id", FieldType::String),
//!         FieldDef::required("title", FieldType::String),
//!     ],
//! ));
//!
//! // 2. Build a record from a payload
//! let post = registry
//!     .require("Post")
//!     .unwrap()
//!     .record(json!({"id": "post-1", "title": "Hello"}))
//!     .unwrap();
//!
//! // 3. Write it to local tables and query it back
//! let mut tables = ModelTables::new(&registry);
//! tables.save(post, &QueryPredicate::All).unwrap();
//!
//! let posts = tables.query("Post", &QueryOptions::new()).unwrap();
//! assert_eq!(posts.len(), 1);
//! ```
//!
//! ## Persistence
//!
//! Use [`ModelTables::export_state`] and [`ModelTables::import_state`] with
//! [`StoreSnapshot`]. Snapshots serialize to JSON with deterministic ordering
//! and carry the system tables, so outbox entries survive a restart.

pub mod change;
pub mod conflict;
pub mod error;
pub mod merge;
pub mod mutation;
pub mod predicate;
pub mod record;
pub mod schema;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod sync_time;

// Re-export main types at crate root
pub use change::{ChangeType, Initiator, StorageItemChange};
pub use conflict::{ConflictData, ConflictResolutionDecision, ResolutionPlan};
pub use error::Error;
pub use merge::{MergeAction, VersionRule};
pub use mutation::{collapse, Collapse, MutationId, MutationStatus, PendingMutation};
pub use predicate::{Operator, QueryPredicate};
pub use record::{Metadata, Origin, Record, RecordKey};
pub use schema::{
    FieldDef, FieldType, ModelSchema, SchemaRegistry, COMPOSITE_KEY_SEPARATOR,
    LAST_SYNC_METADATA_MODEL, PENDING_MUTATION_MODEL,
};
pub use snapshot::{StoreSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use state::OrchestratorState;
pub use store::{ModelTables, Page, QueryOptions, SortBy, SortOrder, StoreWrite, Table};
pub use sync_time::{LastSyncMetadata, SyncTime, SyncType};

/// Type aliases for clarity
pub type RecordId = String;
pub type ModelName = String;
pub type Version = u64;
/// Milliseconds since the Unix epoch
pub type Timestamp = u64;
pub type SchemaVersion = u32;

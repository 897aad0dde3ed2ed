//! Record types for storing model instances.

use crate::{ModelName, RecordId, Timestamp, Version};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Origin of the last write to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Written by the host application
    #[default]
    Local,
    /// Merged in from the remote API
    Remote,
}

/// System metadata carried alongside a record's fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// When the record was first created (milliseconds since epoch)
    pub created_at: Option<Timestamp>,
    /// When the record was last updated (milliseconds since epoch)
    pub updated_at: Option<Timestamp>,
    /// Server-side time of the last change, used for delta queries
    pub last_changed_at: Option<Timestamp>,
    /// Whether the last write came from the host or the remote API
    pub origin: Origin,
}

/// Identity of a record: the model it belongs to plus its primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub model: ModelName,
    pub id: RecordId,
}

impl RecordKey {
    pub fn new(model: impl Into<ModelName>, id: impl Into<RecordId>) -> Self {
        Self {
            model: model.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.model, self.id)
    }
}

/// A model instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Model this record belongs to
    pub model: ModelName,
    /// Primary key string (composite keys are joined with `#`)
    pub id: RecordId,
    /// Field values (a JSON object)
    pub payload: serde_json::Value,
    /// Server-assigned revision, absent until the record has been synced
    pub version: Option<Version>,
    /// Soft delete flag (`_deleted`)
    pub deleted: bool,
    /// Record metadata
    pub metadata: Metadata,
}

impl Record {
    /// Create a new, never-synced record.
    pub fn new(
        model: impl Into<ModelName>,
        id: impl Into<RecordId>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            model: model.into(),
            id: id.into(),
            payload,
            version: None,
            deleted: false,
            metadata: Metadata::default(),
        }
    }

    /// Create a record as the remote API reports it.
    pub fn remote(
        model: impl Into<ModelName>,
        id: impl Into<RecordId>,
        payload: serde_json::Value,
        version: Version,
        last_changed_at: Timestamp,
    ) -> Self {
        Self {
            model: model.into(),
            id: id.into(),
            payload,
            version: Some(version),
            deleted: false,
            metadata: Metadata {
                created_at: Some(last_changed_at),
                updated_at: Some(last_changed_at),
                last_changed_at: Some(last_changed_at),
                origin: Origin::Remote,
            },
        }
    }

    /// Builder-style version setter.
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Builder-style soft delete.
    pub fn into_deleted(mut self) -> Self {
        self.deleted = true;
        self
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.model.clone(), self.id.clone())
    }

    /// Check if record is active (not deleted).
    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    /// Get a field value from the payload.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.payload.get(name)
    }

    /// Set the local write timestamps.
    pub fn touch(&mut self, timestamp: Timestamp) {
        if self.metadata.created_at.is_none() {
            self.metadata.created_at = Some(timestamp);
        }
        self.metadata.updated_at = Some(timestamp);
        self.metadata.origin = Origin::Local;
    }

    /// Carry the sync state of a previously stored copy into a new local write.
    ///
    /// Local writes never assign versions; the stored version remains the
    /// optimistic-concurrency token until the remote API returns a new one.
    pub fn carry_forward(&mut self, previous: &Record) {
        self.version = previous.version;
        self.metadata.created_at = previous.metadata.created_at;
        self.metadata.last_changed_at = previous.metadata.last_changed_at;
    }

    /// Adopt the remote copy's sync state while keeping local field values.
    pub fn adopt_sync_metadata(&mut self, remote: &Record) {
        self.version = remote.version;
        self.metadata.last_changed_at = remote.metadata.last_changed_at;
        if remote.metadata.updated_at.is_some() {
            self.metadata.updated_at = remote.metadata.updated_at;
        }
        if self.metadata.created_at.is_none() {
            self.metadata.created_at = remote.metadata.created_at;
        }
    }

    /// Overlay another payload's fields onto this one.
    ///
    /// Fields present in `newer` win; fields only present here are kept.
    pub fn merge_fields(&mut self, newer: &serde_json::Value) {
        match (self.payload.as_object_mut(), newer.as_object()) {
            (Some(current), Some(incoming)) => {
                for (name, value) in incoming {
                    current.insert(name.clone(), value.clone());
                }
            }
            _ => self.payload = newer.clone(),
        }
    }
}

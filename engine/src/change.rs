//! Storage item changes.
//!
//! A change describes one write to the local store: which record, what
//! kind of write, who initiated it, and the condition it was made under.
//! Local changes become outbox entries; all changes are published to
//! observers.

use crate::{ModelName, QueryPredicate, Record, RecordKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeType::Create => "CREATE",
            ChangeType::Update => "UPDATE",
            ChangeType::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// Who caused a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Initiator {
    /// The host application through the public API
    LocalApi,
    /// The sync engine merging remote data
    SyncEngine,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageItemChange {
    pub item: Record,
    pub model: ModelName,
    pub change_type: ChangeType,
    pub initiator: Initiator,
    #[serde(default)]
    pub predicate: QueryPredicate,
}

impl StorageItemChange {
    pub fn new(item: Record, change_type: ChangeType, initiator: Initiator) -> Self {
        Self {
            model: item.model.clone(),
            item,
            change_type,
            initiator,
            predicate: QueryPredicate::All,
        }
    }

    /// Builder-style condition setter.
    pub fn with_predicate(mut self, predicate: QueryPredicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn key(&self) -> RecordKey {
        self.item.key()
    }

    pub fn is_local(&self) -> bool {
        self.initiator == Initiator::LocalApi
    }
}

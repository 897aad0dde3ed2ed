//! Pending mutations and their collapse rules.
//!
//! A pending mutation is a local change waiting to be published to the
//! remote API. While an entry is not yet in flight, a newer change to the
//! same record is folded into it instead of being appended, so the outbox
//! holds at most one unsent entry per record.

use crate::{
    error::Result, ChangeType, Error, Record, RecordKey, StorageItemChange, Timestamp,
    PENDING_MUTATION_MODEL,
};
use serde::{Deserialize, Serialize};

/// Unique mutation identifier (time-ordered UUID string).
pub type MutationId = String;

/// Delivery status of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MutationStatus {
    /// Waiting to be delivered
    #[default]
    Pending,
    /// Delivery gave up; kept until the host intervenes or a new change collapses into it
    Parked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
    pub id: MutationId,
    /// Enqueue order, used for FIFO delivery
    pub sequence: u64,
    pub change: StorageItemChange,
    pub enqueued_at: Timestamp,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub status: MutationStatus,
}

impl PendingMutation {
    pub fn new(
        id: impl Into<MutationId>,
        sequence: u64,
        change: StorageItemChange,
        enqueued_at: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            sequence,
            change,
            enqueued_at,
            attempts: 0,
            last_error: None,
            status: MutationStatus::Pending,
        }
    }

    pub fn key(&self) -> RecordKey {
        self.change.key()
    }

    pub fn change_type(&self) -> ChangeType {
        self.change.change_type
    }

    pub fn is_parked(&self) -> bool {
        self.status == MutationStatus::Parked
    }

    /// Encode as a `PendingMutation` system record.
    pub fn to_record(&self) -> Result<Record> {
        let mutation =
            serde_json::to_value(self).map_err(|e| Error::InvalidPayload(e.to_string()))?;
        Ok(Record::new(
            PENDING_MUTATION_MODEL,
            self.id.clone(),
            serde_json::json!({ "id": self.id, "mutation": mutation }),
        ))
    }

    /// Decode from a `PendingMutation` system record.
    pub fn from_record(record: &Record) -> Result<Self> {
        let mutation = record
            .field("mutation")
            .ok_or_else(|| Error::MissingRequiredField("mutation".into()))?;
        serde_json::from_value(mutation.clone()).map_err(|e| Error::InvalidPayload(e.to_string()))
    }
}

/// Result of folding an incoming change into an existing entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Collapse {
    /// Replace the existing entry in place
    Replace(PendingMutation),
    /// Remove the existing entry; the incoming change is not enqueued
    Cancel,
}

/// Fold `incoming` into the unsent entry `existing` for the same record.
///
/// The replacement keeps the existing entry's id and sequence. A parked
/// entry returns to pending with its attempt history cleared.
pub fn collapse(existing: &PendingMutation, incoming: StorageItemChange) -> Result<Collapse> {
    use ChangeType::*;

    let existing_type = existing.change_type();
    let incoming_type = incoming.change_type;

    let change = match (existing_type, incoming_type) {
        (Create, Update) => {
            let mut item = existing.change.item.clone();
            item.merge_fields(&incoming.item.payload);
            item.metadata = incoming.item.metadata.clone();
            item.version = incoming.item.version;
            StorageItemChange {
                item,
                change_type: Create,
                ..incoming
            }
        }
        (Update, Update) => {
            let mut item = existing.change.item.clone();
            item.merge_fields(&incoming.item.payload);
            item.metadata = incoming.item.metadata.clone();
            item.version = incoming.item.version;
            StorageItemChange { item, ..incoming }
        }
        (Create, Delete) => return Ok(Collapse::Cancel),
        (Update | Delete, Delete) => incoming,
        (Create, Create) => return Err(Error::ConflictingCreation(incoming.item.id)),
        (Delete, Update) => return Err(Error::AlreadyScheduledForDeletion(incoming.item.id)),
        (Update | Delete, Create) => {
            return Err(Error::UnexpectedMutationSequence {
                existing: existing_type,
                incoming: incoming_type,
            })
        }
    };

    Ok(Collapse::Replace(PendingMutation {
        id: existing.id.clone(),
        sequence: existing.sequence,
        change,
        enqueued_at: existing.enqueued_at,
        attempts: 0,
        last_error: None,
        status: MutationStatus::Pending,
    }))
}

//! Snapshot types for persisting and restoring local tables.
//!
//! A snapshot captures every model table, system tables included, so the
//! outbox and sync watermarks survive a restart together with the data.

use crate::{
    error::Result, Error, ModelName, PendingMutation, Record, RecordId, SchemaRegistry,
    SchemaVersion, PENDING_MUTATION_MODEL,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time snapshot of the local tables.
///
/// Uses BTreeMap instead of HashMap for deterministic serialization order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub format_version: u32,
    pub schema_version: SchemaVersion,
    /// Records by model, then by record ID (tombstones included)
    pub models: BTreeMap<ModelName, BTreeMap<RecordId, Record>>,
}

impl StoreSnapshot {
    /// Create a new empty snapshot.
    pub fn new(schema_version: SchemaVersion) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema_version,
            models: BTreeMap::new(),
        }
    }

    pub fn add_record(&mut self, record: Record) {
        self.models
            .entry(record.model.clone())
            .or_default()
            .insert(record.id.clone(), record);
    }

    pub fn get_record(&self, model: &str, id: &str) -> Option<&Record> {
        self.models.get(model)?.get(id)
    }

    /// Count total records across all models.
    pub fn record_count(&self) -> usize {
        self.models.values().map(|m| m.len()).sum()
    }

    /// Count active (non-deleted) records.
    pub fn active_record_count(&self) -> usize {
        self.models
            .values()
            .flat_map(|m| m.values())
            .filter(|r| r.is_active())
            .count()
    }

    /// Decode the outbox entries carried in the snapshot, in enqueue order.
    pub fn pending_mutations(&self) -> Result<Vec<PendingMutation>> {
        let mut mutations = self
            .models
            .get(PENDING_MUTATION_MODEL)
            .into_iter()
            .flat_map(|m| m.values())
            .map(PendingMutation::from_record)
            .collect::<Result<Vec<_>>>()?;
        mutations.sort_by_key(|m| m.sequence);
        Ok(mutations)
    }

    /// Validate the snapshot against a registry.
    pub fn validate(&self, registry: &SchemaRegistry) -> Result<()> {
        if self.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                self.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        if self.schema_version != registry.version {
            return Err(Error::SchemaVersionMismatch {
                expected: registry.version,
                actual: self.schema_version,
            });
        }

        for (model, records) in &self.models {
            registry.require(model)?;
            for (id, record) in records {
                if &record.model != model || &record.id != id {
                    return Err(Error::InvalidSnapshot(format!(
                        "record {} filed under {}/{}",
                        record.key(),
                        model,
                        id
                    )));
                }
                registry.validate_record(record)?;
            }
        }

        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}

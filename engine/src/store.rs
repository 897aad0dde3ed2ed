//! Model tables - the in-memory local store state.
//!
//! Tables hold every record per registered model, tombstones included, and
//! implement conditional writes and local queries.

use crate::{
    error::Result, predicate, ChangeType, Error, ModelName, QueryPredicate, Record, RecordId,
    SchemaRegistry, SchemaVersion, StoreSnapshot,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// The records of a single model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Table {
    records: BTreeMap<RecordId, Record>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a record by ID (including tombstones).
    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn insert(&mut self, record: Record) -> Option<Record> {
        self.records.insert(record.id.clone(), record)
    }

    pub fn remove(&mut self, id: &str) -> Option<Record> {
        self.records.remove(id)
    }

    /// Get all active (non-deleted) records.
    pub fn active_records(&self) -> impl Iterator<Item = &Record> {
        self.records.values().filter(|r| r.is_active())
    }

    /// Get all records including deleted.
    pub fn all_records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    /// Count of active records.
    pub fn len(&self) -> usize {
        self.active_records().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortBy {
    pub field: String,
    pub order: SortOrder,
}

/// Zero-based page of query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub index: usize,
    pub size: usize,
}

/// Options for a local query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    pub predicate: QueryPredicate,
    pub sort: Vec<SortBy>,
    pub page: Option<Page>,
    pub include_deleted: bool,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matching(mut self, predicate: QueryPredicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn sorted_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push(SortBy {
            field: field.into(),
            order,
        });
        self
    }

    pub fn paged(mut self, index: usize, size: usize) -> Self {
        self.page = Some(Page { index, size });
        self
    }

    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }
}

/// Outcome of a successful write.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreWrite {
    pub change_type: ChangeType,
    /// The record as written
    pub record: Record,
    /// The record before the write, if any (tombstones included)
    pub previous: Option<Record>,
}

/// In-memory tables for every registered model.
#[derive(Debug, Clone)]
pub struct ModelTables {
    schema_version: SchemaVersion,
    tables: BTreeMap<ModelName, Table>,
}

impl ModelTables {
    /// Create empty tables for every model in the registry.
    pub fn new(registry: &SchemaRegistry) -> Self {
        let tables = registry
            .models()
            .map(|m| (m.name.clone(), Table::new()))
            .collect();
        Self {
            schema_version: registry.version,
            tables,
        }
    }

    pub fn table(&self, model: &str) -> Result<&Table> {
        self.tables
            .get(model)
            .ok_or_else(|| Error::ModelNotFound(model.to_string()))
    }

    fn table_mut(&mut self, model: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(model)
            .ok_or_else(|| Error::ModelNotFound(model.to_string()))
    }

    /// Save a record, creating or replacing it.
    ///
    /// A non-trivial predicate must match the existing active record;
    /// it never matches a missing or deleted one.
    pub fn save(&mut self, record: Record, predicate: &QueryPredicate) -> Result<StoreWrite> {
        let table = self.table_mut(&record.model)?;
        let previous = table.get(&record.id).cloned();
        let active = previous.as_ref().filter(|r| r.is_active());

        check_condition(active, &record, predicate)?;

        let change_type = if active.is_some() {
            ChangeType::Update
        } else {
            ChangeType::Create
        };
        table.insert(record.clone());

        Ok(StoreWrite {
            change_type,
            record,
            previous,
        })
    }

    /// Soft-delete a record, leaving a tombstone.
    ///
    /// The tombstone takes the incoming record's version and metadata. When
    /// the incoming record has no fields, the stored fields are kept.
    pub fn delete(&mut self, record: Record, predicate: &QueryPredicate) -> Result<StoreWrite> {
        let table = self.table_mut(&record.model)?;
        let previous = table.get(&record.id).cloned();
        let active = previous.as_ref().filter(|r| r.is_active());

        check_condition(active, &record, predicate)?;

        let mut tombstone = record.into_deleted();
        let has_fields = tombstone
            .payload
            .as_object()
            .map_or(false, |obj| !obj.is_empty());
        if !has_fields {
            if let Some(prev) = &previous {
                tombstone.payload = prev.payload.clone();
            }
        }
        table.insert(tombstone.clone());

        Ok(StoreWrite {
            change_type: ChangeType::Delete,
            record: tombstone,
            previous,
        })
    }

    /// Remove a record entirely, tombstone included.
    pub fn purge(&mut self, model: &str, id: &str) -> Result<Option<Record>> {
        Ok(self.table_mut(model)?.remove(id))
    }

    /// Get a record including tombstones.
    pub fn get(&self, model: &str, id: &str) -> Result<Option<&Record>> {
        Ok(self.table(model)?.get(id))
    }

    /// Get an active record.
    pub fn get_active(&self, model: &str, id: &str) -> Result<Option<&Record>> {
        Ok(self.get(model, id)?.filter(|r| r.is_active()))
    }

    /// Run a query against one model.
    pub fn query(&self, model: &str, options: &QueryOptions) -> Result<Vec<Record>> {
        let table = self.table(model)?;
        let mut results: Vec<Record> = table
            .all_records()
            .filter(|r| options.include_deleted || r.is_active())
            .filter(|r| options.predicate.matches(&r.payload))
            .cloned()
            .collect();

        if !options.sort.is_empty() {
            results.sort_by(|a, b| compare_records(a, b, &options.sort));
        }

        if let Some(page) = options.page {
            results = results
                .into_iter()
                .skip(page.index.saturating_mul(page.size))
                .take(page.size)
                .collect();
        }

        Ok(results)
    }

    /// Count active records in a model.
    pub fn count(&self, model: &str) -> Result<usize> {
        Ok(self.table(model)?.len())
    }

    /// Remove every record from every table.
    pub fn clear(&mut self) {
        for table in self.tables.values_mut() {
            table.records.clear();
        }
    }

    /// Export all tables as a snapshot.
    pub fn export_state(&self) -> StoreSnapshot {
        let mut snapshot = StoreSnapshot::new(self.schema_version);
        for table in self.tables.values() {
            for record in table.all_records() {
                snapshot.add_record(record.clone());
            }
        }
        snapshot
    }

    /// Replace all tables with a snapshot's contents.
    pub fn import_state(
        &mut self,
        snapshot: StoreSnapshot,
        registry: &SchemaRegistry,
    ) -> Result<()> {
        snapshot.validate(registry)?;

        self.clear();
        for (model, records) in snapshot.models {
            let table = self.table_mut(&model)?;
            for (_, record) in records {
                table.insert(record);
            }
        }
        Ok(())
    }
}

fn check_condition(
    active: Option<&Record>,
    record: &Record,
    predicate: &QueryPredicate,
) -> Result<()> {
    if predicate.is_all() {
        return Ok(());
    }
    match active {
        Some(existing) if predicate.matches(&existing.payload) => Ok(()),
        _ => Err(Error::ConditionNotMet {
            model: record.model.clone(),
            id: record.id.clone(),
        }),
    }
}

fn compare_records(a: &Record, b: &Record, sort: &[SortBy]) -> Ordering {
    for by in sort {
        let left = a.field(&by.field);
        let right = b.field(&by.field);
        let ordering = match (left, right) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(l), Some(r)) => predicate::order(l, r).unwrap_or(Ordering::Equal),
        };
        let ordering = match by.order {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.id.cmp(&b.id)
}

//! In-memory [`LocalStore`] backed by engine model tables.

use super::LocalStore;
use crate::error::Result;
use async_trait::async_trait;
use harbor_engine::{
    Initiator, ModelTables, QueryOptions, QueryPredicate, Record, SchemaRegistry,
    StorageItemChange, StoreSnapshot, StoreWrite,
};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

const CHANGE_CAPACITY: usize = 1024;

/// Local store keeping all tables in memory.
///
/// Use [`export_state`](Self::export_state) and
/// [`import_state`](Self::import_state) to persist across restarts.
pub struct MemoryStore {
    registry: Arc<SchemaRegistry>,
    tables: RwLock<ModelTables>,
    changes: broadcast::Sender<StorageItemChange>,
}

impl MemoryStore {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            tables: RwLock::new(ModelTables::new(&registry)),
            registry,
            changes,
        }
    }

    /// Snapshot every table, system tables included.
    pub async fn export_state(&self) -> StoreSnapshot {
        self.tables.read().await.export_state()
    }

    /// Replace every table with a snapshot's contents.
    pub async fn import_state(&self, snapshot: StoreSnapshot) -> Result<()> {
        self.tables
            .write()
            .await
            .import_state(snapshot, &self.registry)?;
        tracing::info!("Imported local store snapshot");
        Ok(())
    }

    fn publish(&self, write: &StoreWrite, initiator: Initiator, predicate: &QueryPredicate) {
        let change = StorageItemChange::new(write.record.clone(), write.change_type, initiator)
            .with_predicate(predicate.clone());
        let _ = self.changes.send(change);
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn save(
        &self,
        record: Record,
        initiator: Initiator,
        predicate: &QueryPredicate,
    ) -> Result<StoreWrite> {
        let write = self.tables.write().await.save(record, predicate)?;
        tracing::trace!(model = %write.record.model, id = %write.record.id, change = %write.change_type, "Saved record");
        self.publish(&write, initiator, predicate);
        Ok(write)
    }

    async fn delete(
        &self,
        record: Record,
        initiator: Initiator,
        predicate: &QueryPredicate,
    ) -> Result<StoreWrite> {
        let write = self.tables.write().await.delete(record, predicate)?;
        tracing::trace!(model = %write.record.model, id = %write.record.id, "Deleted record");
        self.publish(&write, initiator, predicate);
        Ok(write)
    }

    async fn purge(&self, model: &str, id: &str) -> Result<Option<Record>> {
        Ok(self.tables.write().await.purge(model, id)?)
    }

    async fn get(&self, model: &str, id: &str) -> Result<Option<Record>> {
        Ok(self.tables.read().await.get(model, id)?.cloned())
    }

    async fn query(&self, model: &str, options: &QueryOptions) -> Result<Vec<Record>> {
        Ok(self.tables.read().await.query(model, options)?)
    }

    async fn clear(&self) -> Result<()> {
        self.tables.write().await.clear();
        tracing::info!("Cleared local store");
        Ok(())
    }

    fn observe(&self) -> broadcast::Receiver<StorageItemChange> {
        self.changes.subscribe()
    }
}

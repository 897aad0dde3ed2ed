//! Local store wrapper with switchable failures.

use async_trait::async_trait;
use harbor_datastore::engine::{
    Initiator, QueryOptions, QueryPredicate, Record, SchemaRegistry, StorageItemChange,
    StoreWrite, PENDING_MUTATION_MODEL,
};
use harbor_datastore::{DataStoreError, LocalStore, MemoryStore, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Delegates to a [`MemoryStore`] unless told to fail.
pub struct FailingStore {
    inner: MemoryStore,
    fail_outbox_writes: AtomicBool,
    fail_model: std::sync::Mutex<Option<String>>,
}

impl FailingStore {
    pub fn new(registry: SchemaRegistry) -> Self {
        Self {
            inner: MemoryStore::new(Arc::new(registry)),
            fail_outbox_writes: AtomicBool::new(false),
            fail_model: std::sync::Mutex::new(None),
        }
    }

    /// Make writes of outbox entries fail.
    pub fn fail_outbox_writes(&self, fail: bool) {
        self.fail_outbox_writes.store(fail, Ordering::SeqCst);
    }

    /// Make writes to one user model fail.
    pub fn fail_model_writes(&self, model: Option<&str>) {
        *self.fail_model.lock().unwrap() = model.map(str::to_string);
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    fn check(&self, model: &str) -> Result<()> {
        if model == PENDING_MUTATION_MODEL && self.fail_outbox_writes.load(Ordering::SeqCst) {
            return Err(DataStoreError::Storage("outbox write failed".into()));
        }
        if self.fail_model.lock().unwrap().as_deref() == Some(model) {
            return Err(DataStoreError::Storage(format!("{} write failed", model)));
        }
        Ok(())
    }
}

#[async_trait]
impl LocalStore for FailingStore {
    async fn save(
        &self,
        record: Record,
        initiator: Initiator,
        predicate: &QueryPredicate,
    ) -> Result<StoreWrite> {
        self.check(&record.model)?;
        self.inner.save(record, initiator, predicate).await
    }

    async fn delete(
        &self,
        record: Record,
        initiator: Initiator,
        predicate: &QueryPredicate,
    ) -> Result<StoreWrite> {
        self.check(&record.model)?;
        self.inner.delete(record, initiator, predicate).await
    }

    async fn purge(&self, model: &str, id: &str) -> Result<Option<Record>> {
        self.check(model)?;
        self.inner.purge(model, id).await
    }

    async fn get(&self, model: &str, id: &str) -> Result<Option<Record>> {
        self.inner.get(model, id).await
    }

    async fn query(&self, model: &str, options: &QueryOptions) -> Result<Vec<Record>> {
        self.inner.query(model, options).await
    }

    async fn clear(&self) -> Result<()> {
        self.inner.clear().await
    }

    fn observe(&self) -> broadcast::Receiver<StorageItemChange> {
        self.inner.observe()
    }
}

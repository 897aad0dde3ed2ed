//! Local storage interface.
//!
//! The sync engine talks to the on-device database only through
//! [`LocalStore`]. Every successful write is published to observers as a
//! [`StorageItemChange`].

mod memory;

pub use memory::MemoryStore;

use crate::error::Result;
use async_trait::async_trait;
use harbor_engine::{Initiator, QueryOptions, QueryPredicate, Record, StorageItemChange, StoreWrite};
use tokio::sync::broadcast;

#[async_trait]
pub trait LocalStore: Send + Sync + 'static {
    /// Create or replace a record. A non-trivial predicate must match the
    /// stored active record.
    async fn save(
        &self,
        record: Record,
        initiator: Initiator,
        predicate: &QueryPredicate,
    ) -> Result<StoreWrite>;

    /// Soft-delete a record, leaving a tombstone carrying the given version.
    async fn delete(
        &self,
        record: Record,
        initiator: Initiator,
        predicate: &QueryPredicate,
    ) -> Result<StoreWrite>;

    /// Remove a record entirely, tombstone included.
    async fn purge(&self, model: &str, id: &str) -> Result<Option<Record>>;

    /// Get a record, tombstones included.
    async fn get(&self, model: &str, id: &str) -> Result<Option<Record>>;

    async fn query(&self, model: &str, options: &QueryOptions) -> Result<Vec<Record>>;

    /// Remove every record from every model.
    async fn clear(&self) -> Result<()>;

    /// Subscribe to committed writes.
    fn observe(&self) -> broadcast::Receiver<StorageItemChange>;
}

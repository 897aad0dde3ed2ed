//! Persisted sync watermarks.

use crate::error::Result;
use crate::storage::LocalStore;
use harbor_engine::{Initiator, LastSyncMetadata, QueryPredicate, LAST_SYNC_METADATA_MODEL};
use std::sync::Arc;

/// Reads and writes `LastSyncMetadata` system records.
#[derive(Clone)]
pub struct SyncTimeRegistry {
    store: Arc<dyn LocalStore>,
}

impl SyncTimeRegistry {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    /// The model's watermark, or a never-synced entry.
    pub async fn lookup(&self, model: &str) -> Result<LastSyncMetadata> {
        match self.store.get(LAST_SYNC_METADATA_MODEL, model).await? {
            Some(record) if record.is_active() => Ok(LastSyncMetadata::from_record(&record)?),
            _ => Ok(LastSyncMetadata::never(model)),
        }
    }

    pub async fn save(&self, metadata: &LastSyncMetadata) -> Result<()> {
        self.store
            .save(metadata.to_record()?, Initiator::SyncEngine, &QueryPredicate::All)
            .await?;
        tracing::debug!(model = %metadata.model, "Saved sync watermark");
        Ok(())
    }
}

//! Host-facing DataStore API.

use crate::config::DataStoreConfig;
use crate::error::{DataStoreError, Result};
use crate::events::{DataStoreEvent, EventHub};
use crate::merger::{KeyLocks, Merger};
use crate::now_millis;
use crate::orchestrator::{Orchestrator, Pipelines};
use crate::outbox::MutationOutbox;
use crate::reachability::Reachability;
use crate::remote::RemoteApi;
use crate::storage::{LocalStore, MemoryStore};
use futures::stream::{BoxStream, StreamExt};
use harbor_engine::{
    Error as EngineError, Initiator, ModelSchema, OrchestratorState, QueryOptions,
    QueryPredicate, Record, RecordKey, SchemaRegistry, StorageItemChange, StoreWrite,
};
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;

/// Builder for [`DataStore`].
pub struct DataStoreBuilder {
    registry: SchemaRegistry,
    local_store: Option<Arc<dyn LocalStore>>,
    remote_api: Option<Arc<dyn RemoteApi>>,
    config: DataStoreConfig,
    network_available: bool,
}

impl DataStoreBuilder {
    /// Local store to use. Defaults to a [`MemoryStore`] over the registry.
    pub fn local_store(mut self, store: Arc<dyn LocalStore>) -> Self {
        self.local_store = Some(store);
        self
    }

    /// Remote API to sync with. Without one the datastore runs local-only.
    pub fn remote_api(mut self, remote: Arc<dyn RemoteApi>) -> Self {
        self.remote_api = Some(remote);
        self
    }

    pub fn config(mut self, config: DataStoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Initial reachability. Defaults to available.
    pub fn network_available(mut self, available: bool) -> Self {
        self.network_available = available;
        self
    }

    pub fn build(self) -> Result<DataStore> {
        self.config.validate()?;
        self.registry.validate()?;
        let models = self.registry.topological_order()?;

        let registry = Arc::new(self.registry);
        let store = self
            .local_store
            .unwrap_or_else(|| Arc::new(MemoryStore::new(registry.clone())));
        let events = EventHub::default();
        let outbox = Arc::new(MutationOutbox::new(store.clone(), events.clone()));
        let merger = Merger::new(store.clone(), outbox.clone(), KeyLocks::new());
        let reachability = Reachability::new(self.network_available);

        let pipelines = self.remote_api.map(|remote| {
            Pipelines::new(
                &self.config,
                models,
                remote,
                store.clone(),
                outbox.clone(),
                merger.clone(),
                events.clone(),
            )
        });
        let orchestrator = Orchestrator::new(
            store.clone(),
            outbox.clone(),
            events.clone(),
            reachability.clone(),
            pipelines,
        );

        tracing::info!(
            models = registry.user_models().count(),
            schema_version = registry.version,
            "DataStore configured"
        );

        Ok(DataStore {
            registry,
            store,
            outbox,
            locks: merger.locks().clone(),
            orchestrator,
            events,
            reachability,
        })
    }
}

/// Local-first datastore.
///
/// Reads and writes go to the local store. Once started with a remote API
/// configured, local writes are published in the background and remote
/// changes are merged in.
pub struct DataStore {
    registry: Arc<SchemaRegistry>,
    store: Arc<dyn LocalStore>,
    outbox: Arc<MutationOutbox>,
    locks: KeyLocks,
    orchestrator: Orchestrator,
    events: EventHub,
    reachability: Reachability,
}

impl DataStore {
    pub fn builder(registry: SchemaRegistry) -> DataStoreBuilder {
        DataStoreBuilder {
            registry,
            local_store: None,
            remote_api: None,
            config: DataStoreConfig::default(),
            network_available: true,
        }
    }

    pub async fn start(&self) -> Result<()> {
        self.orchestrator.start().await
    }

    pub async fn stop(&self) -> Result<()> {
        self.orchestrator.stop().await
    }

    /// Stop, then remove all local data and pending mutations.
    pub async fn clear(&self) -> Result<()> {
        self.orchestrator.stop().await?;
        self.orchestrator.clear().await
    }

    /// Create or replace a record.
    pub async fn save(&self, record: Record) -> Result<Record> {
        self.save_with(record, QueryPredicate::All).await
    }

    /// Create or replace a record if the stored copy matches `predicate`.
    ///
    /// The predicate also travels with the mutation as its server-side
    /// condition.
    pub async fn save_with(&self, mut record: Record, predicate: QueryPredicate) -> Result<Record> {
        self.ensure_started().await?;
        let schema = self.user_schema(&record.model)?;
        schema.validate_payload(&record.payload)?;
        let id = schema.record_id(&record.payload)?;
        if id != record.id {
            return Err(EngineError::InvalidPayload(format!(
                "record id '{}' does not match primary key '{}'",
                record.id, id
            ))
            .into());
        }

        let key = record.key();
        let _guard = self.locks.lock(&key).await;

        if let Some(previous) = self.store.get(&key.model, &key.id).await? {
            record.carry_forward(&previous);
        }
        record.deleted = false;
        record.touch(now_millis());

        let write = self
            .store
            .save(record, Initiator::LocalApi, &predicate)
            .await?;
        tracing::debug!(key = %key, change = %write.change_type, "Saved locally");

        self.enqueue(&write, predicate).await?;
        Ok(write.record)
    }

    /// Delete a record.
    pub async fn delete(&self, model: &str, id: &str) -> Result<Record> {
        self.delete_with(model, id, QueryPredicate::All).await
    }

    /// Delete a record if the stored copy matches `predicate`.
    pub async fn delete_with(&self, model: &str, id: &str, predicate: QueryPredicate) -> Result<Record> {
        self.ensure_started().await?;
        self.user_schema(model)?;

        let key = RecordKey::new(model, id);
        let _guard = self.locks.lock(&key).await;

        let mut record = self
            .store
            .get(model, id)
            .await?
            .filter(|r| r.is_active())
            .ok_or_else(|| DataStoreError::RecordNotFound(key.clone()))?;
        record.touch(now_millis());

        let write = self
            .store
            .delete(record, Initiator::LocalApi, &predicate)
            .await?;
        tracing::debug!(key = %key, "Deleted locally");

        self.enqueue(&write, predicate).await?;
        Ok(write.record)
    }

    /// Get an active record.
    pub async fn get(&self, model: &str, id: &str) -> Result<Option<Record>> {
        self.ensure_started().await?;
        self.user_schema(model)?;
        Ok(self.store.get(model, id).await?.filter(|r| r.is_active()))
    }

    pub async fn query(&self, model: &str, options: QueryOptions) -> Result<Vec<Record>> {
        self.ensure_started().await?;
        self.user_schema(model)?;
        self.store.query(model, &options).await
    }

    /// Stream of committed changes to user models, local and remote.
    pub async fn observe(&self) -> Result<BoxStream<'static, StorageItemChange>> {
        self.ensure_started().await?;
        let stream = BroadcastStream::new(self.store.observe())
            .filter_map(|change| async move {
                change
                    .ok()
                    .filter(|c| !SchemaRegistry::is_system_model(&c.model))
            })
            .boxed();
        Ok(stream)
    }

    /// Hub carrying [`DataStoreEvent`]s.
    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn state(&self) -> OrchestratorState {
        self.orchestrator.state()
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn outbox(&self) -> &Arc<MutationOutbox> {
        &self.outbox
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Report a reachability change from the host platform.
    pub fn set_network_available(&self, available: bool) {
        if self.reachability.set(available) {
            tracing::info!(available, "Network status changed");
            self.events
                .publish(DataStoreEvent::NetworkStatus { active: available });
        }
    }

    async fn ensure_started(&self) -> Result<()> {
        if self.state() == OrchestratorState::Stopped {
            self.orchestrator.start().await?;
        }
        Ok(())
    }

    fn user_schema(&self, model: &str) -> Result<&ModelSchema> {
        if SchemaRegistry::is_system_model(model) {
            return Err(EngineError::ModelNotFound(model.to_string()).into());
        }
        Ok(self.registry.require(model)?)
    }

    /// Queue a local write for publishing, undoing it if that fails.
    async fn enqueue(&self, write: &StoreWrite, predicate: QueryPredicate) -> Result<()> {
        if !self.state().syncs() {
            return Ok(());
        }

        let change = StorageItemChange::new(write.record.clone(), write.change_type, Initiator::LocalApi)
            .with_predicate(predicate);
        if let Err(e) = self.outbox.enqueue(change).await {
            tracing::warn!(key = %write.record.key(), error = %e, "Enqueue failed; reverting local write");
            self.revert(write).await?;
            return Err(e);
        }
        Ok(())
    }

    async fn revert(&self, write: &StoreWrite) -> Result<()> {
        let record = &write.record;
        match &write.previous {
            Some(previous) => {
                self.store
                    .save(previous.clone(), Initiator::LocalApi, &QueryPredicate::All)
                    .await?;
            }
            None => {
                self.store.purge(&record.model, &record.id).await?;
            }
        }
        Ok(())
    }
}

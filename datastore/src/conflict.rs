//! Conflict handling for rejected mutations.
//!
//! The remote API rejects a mutation with [`RemoteError::Conflict`] when the
//! server holds a newer version. The host's [`ConflictHandler`] picks a
//! [`ConflictResolutionDecision`] and [`ConflictResolver`] carries out the
//! resulting plan.

use crate::config::DataStoreConfig;
use crate::error::{DataStoreError, ErrorHandler, Result};
use crate::events::{DataStoreEvent, EventHub};
use crate::merger::Merger;
use crate::now_millis;
use crate::outbox::MutationOutbox;
use crate::remote::{MutationRequest, RemoteApi, RemoteError};
use crate::storage::LocalStore;
use async_trait::async_trait;
use harbor_engine::{
    ChangeType, ConflictData, ConflictResolutionDecision, Initiator, PendingMutation,
    QueryPredicate, Record, ResolutionPlan, StorageItemChange,
};
use std::sync::Arc;

/// Host hook deciding how a conflict is resolved.
#[async_trait]
pub trait ConflictHandler: Send + Sync {
    async fn resolve(&self, conflict: ConflictData) -> Result<ConflictResolutionDecision>;
}

/// Default handler: the server copy wins.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysApplyRemote;

#[async_trait]
impl ConflictHandler for AlwaysApplyRemote {
    async fn resolve(&self, _conflict: ConflictData) -> Result<ConflictResolutionDecision> {
        Ok(ConflictResolutionDecision::ApplyRemote)
    }
}

/// Adapts a synchronous closure into a [`ConflictHandler`].
pub struct FnConflictHandler<F>(pub F);

impl<F> FnConflictHandler<F>
where
    F: Fn(&ConflictData) -> Result<ConflictResolutionDecision> + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        Self(handler)
    }
}

#[async_trait]
impl<F> ConflictHandler for FnConflictHandler<F>
where
    F: Fn(&ConflictData) -> Result<ConflictResolutionDecision> + Send + Sync,
{
    async fn resolve(&self, conflict: ConflictData) -> Result<ConflictResolutionDecision> {
        (self.0)(&conflict)
    }
}

/// How a conflict ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictOutcome {
    /// Carried out with the named strategy
    Resolved(&'static str),
    /// Could not be resolved; the entry was parked
    Parked,
}

pub struct ConflictResolver {
    handler: Arc<dyn ConflictHandler>,
    error_handler: Arc<dyn ErrorHandler>,
    max_retries: u32,
    merger: Merger,
    outbox: Arc<MutationOutbox>,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteApi>,
    events: EventHub,
}

impl ConflictResolver {
    pub fn new(
        config: &DataStoreConfig,
        merger: Merger,
        outbox: Arc<MutationOutbox>,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteApi>,
        events: EventHub,
    ) -> Self {
        Self {
            handler: config.conflict_handler.clone(),
            error_handler: config.error_handler.clone(),
            max_retries: config.max_conflict_retries.max(1),
            merger,
            outbox,
            store,
            remote,
            events,
        }
    }

    /// Resolve a conflict for an in-flight outbox entry.
    ///
    /// On return the entry has been removed, replaced or parked. Errors are
    /// remote or storage failures hit while carrying out the decision.
    pub async fn resolve(
        &self,
        mutation: &PendingMutation,
        remote: Record,
    ) -> Result<ConflictOutcome> {
        let key = mutation.key();
        let mut local = mutation.change.item.clone();
        let mut remote = remote;
        let mut round = 0;

        loop {
            round += 1;
            tracing::warn!(
                mutation_id = %mutation.id,
                key = %key,
                local_version = ?local.version,
                remote_version = ?remote.version,
                round,
                "Resolving conflict"
            );

            let data = ConflictData::new(local.clone(), remote.clone());
            let decision = match self.handler.resolve(data.clone()).await {
                Ok(decision) => decision,
                Err(e) => {
                    let error = DataStoreError::ConflictHandler(e.to_string());
                    return self.park(mutation, error).await;
                }
            };
            let strategy = decision.strategy();

            let plan = match data.plan(decision) {
                Ok(plan) => plan,
                Err(e) => return self.park(mutation, e.into()).await,
            };

            match plan {
                ResolutionPlan::ApplyRemote(record) => {
                    self.merger.apply_remote(record).await?;
                    self.outbox.remove(&mutation.id).await?;
                }
                ResolutionPlan::Publish { record, version } => {
                    let request = MutationRequest {
                        mutation_type: republish_type(mutation.change_type()),
                        record: record.clone(),
                        version,
                        condition: mutation.change.predicate.clone(),
                    };
                    match self.remote.mutate(request).await {
                        Ok(server) => {
                            let version = server.version;
                            self.merger.merge_response(server, &mutation.id).await?;
                            self.outbox.remove(&mutation.id).await?;
                            self.events.publish(DataStoreEvent::OutboxMutationProcessed {
                                mutation_id: mutation.id.clone(),
                                model: key.model.clone(),
                                id: key.id.clone(),
                                version,
                            });
                        }
                        Err(RemoteError::Conflict { remote: newer }) => {
                            if round >= self.max_retries {
                                let error = DataStoreError::ConflictRetriesExhausted(key.clone());
                                return self.park(mutation, error).await;
                            }
                            local = record;
                            remote = *newer;
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                ResolutionPlan::Requeue(custom) => self.requeue(mutation, custom).await?,
            }

            tracing::info!(mutation_id = %mutation.id, key = %key, strategy, "Conflict resolved");
            self.events.publish(DataStoreEvent::ConflictResolved {
                model: key.model.clone(),
                id: key.id.clone(),
                strategy: strategy.to_string(),
            });
            return Ok(ConflictOutcome::Resolved(strategy));
        }
    }

    /// Save a custom record locally and queue it as a fresh update.
    ///
    /// A later local change already queued for the key supersedes the
    /// custom record. The stored version is kept when it moved past the one
    /// the conflict was raised against.
    async fn requeue(&self, mutation: &PendingMutation, mut custom: Record) -> Result<()> {
        let key = custom.key();
        let _guard = self.merger.locks().lock(&key).await;

        if let Some(successor) = self.outbox.successor_of(&mutation.id).await {
            tracing::info!(
                mutation_id = %mutation.id,
                successor = %successor.id,
                key = %key,
                change = %successor.change_type(),
                "Custom record superseded by a later local change"
            );
            self.outbox.remove(&mutation.id).await?;
            return Ok(());
        }

        if let Some(stored) = self.store.get(&custom.model, &custom.id).await? {
            custom.metadata.created_at = stored.metadata.created_at;
            if stored.version > custom.version {
                tracing::debug!(key = %key, stored = ?stored.version, conflict = ?custom.version, "Keeping newer stored version");
                custom.version = stored.version;
                custom.metadata.last_changed_at = stored.metadata.last_changed_at;
            }
        }
        custom.touch(now_millis());

        let queued = self
            .outbox
            .enqueue(StorageItemChange::new(custom.clone(), ChangeType::Update, Initiator::LocalApi))
            .await?;
        if let Err(e) = self
            .store
            .save(custom, Initiator::LocalApi, &QueryPredicate::All)
            .await
        {
            if let Some(queued) = queued {
                self.outbox.remove(&queued.id).await?;
            }
            return Err(e);
        }
        self.outbox.remove(&mutation.id).await?;
        Ok(())
    }

    async fn park(&self, mutation: &PendingMutation, error: DataStoreError) -> Result<ConflictOutcome> {
        tracing::error!(mutation_id = %mutation.id, key = %mutation.key(), error = %error, "Conflict unresolved");
        self.error_handler.on_error(&error);
        self.outbox.park(&mutation.id, &error.to_string()).await?;
        Ok(ConflictOutcome::Parked)
    }
}

/// The server already has the record, so a create is republished as an update.
fn republish_type(original: ChangeType) -> ChangeType {
    match original {
        ChangeType::Create => ChangeType::Update,
        other => other,
    }
}

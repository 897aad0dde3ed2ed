//! Hub events published by the sync engine.

use futures::stream::{BoxStream, StreamExt};
use harbor_engine::{ChangeType, ModelName, MutationId, OrchestratorState, RecordId, Version};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

const DEFAULT_CAPACITY: usize = 1024;

/// Event published on the datastore hub.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum DataStoreEvent {
    NetworkStatus {
        active: bool,
    },
    OutboxStatus {
        is_empty: bool,
    },
    OutboxMutationEnqueued {
        mutation_id: MutationId,
        model: ModelName,
        id: RecordId,
        change_type: ChangeType,
    },
    OutboxMutationProcessed {
        mutation_id: MutationId,
        model: ModelName,
        id: RecordId,
        version: Option<Version>,
    },
    OutboxMutationFailed {
        mutation_id: MutationId,
        model: ModelName,
        id: RecordId,
        error: String,
    },
    ConflictResolved {
        model: ModelName,
        id: RecordId,
        strategy: String,
    },
    SubscriptionsEstablished,
    SubscriptionDataProcessed {
        model: ModelName,
        id: RecordId,
        version: Option<Version>,
    },
    SyncQueriesStarted {
        models: Vec<ModelName>,
    },
    ModelSynced {
        model: ModelName,
        is_full_sync: bool,
        is_delta_sync: bool,
        added: usize,
        updated: usize,
        deleted: usize,
    },
    SyncQueriesReady,
    Ready,
    StateChanged {
        from: OrchestratorState,
        to: OrchestratorState,
    },
}

impl DataStoreEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            DataStoreEvent::NetworkStatus { .. } => "networkStatus",
            DataStoreEvent::OutboxStatus { .. } => "outboxStatus",
            DataStoreEvent::OutboxMutationEnqueued { .. } => "outboxMutationEnqueued",
            DataStoreEvent::OutboxMutationProcessed { .. } => "outboxMutationProcessed",
            DataStoreEvent::OutboxMutationFailed { .. } => "outboxMutationFailed",
            DataStoreEvent::ConflictResolved { .. } => "conflictResolved",
            DataStoreEvent::SubscriptionsEstablished => "subscriptionsEstablished",
            DataStoreEvent::SubscriptionDataProcessed { .. } => "subscriptionDataProcessed",
            DataStoreEvent::SyncQueriesStarted { .. } => "syncQueriesStarted",
            DataStoreEvent::ModelSynced { .. } => "modelSynced",
            DataStoreEvent::SyncQueriesReady => "syncQueriesReady",
            DataStoreEvent::Ready => "ready",
            DataStoreEvent::StateChanged { .. } => "stateChanged",
        }
    }
}

/// Broadcast hub for [`DataStoreEvent`]s.
///
/// Slow subscribers miss events rather than blocking publishers.
#[derive(Debug, Clone)]
pub struct EventHub {
    sender: broadcast::Sender<DataStoreEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: DataStoreEvent) {
        tracing::trace!(event = event.name(), "Publishing hub event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DataStoreEvent> {
        self.sender.subscribe()
    }

    /// Subscribe as a stream, skipping over lagged gaps.
    pub fn stream(&self) -> BoxStream<'static, DataStoreEvent> {
        BroadcastStream::new(self.sender.subscribe())
            .filter_map(|item| async move { item.ok() })
            .boxed()
    }
}

//! The three remote pipelines, started and paused together.

use crate::config::DataStoreConfig;
use crate::conflict::ConflictResolver;
use crate::error::ErrorHandler;
use crate::events::{DataStoreEvent, EventHub};
use crate::merger::Merger;
use crate::mutation_processor::MutationProcessor;
use crate::outbox::MutationOutbox;
use crate::remote::RemoteApi;
use crate::storage::LocalStore;
use crate::subscription_processor::{ResyncSender, SubscriptionProcessor};
use crate::sync_processor::{HydrateReport, SyncProcessor};
use crate::sync_time::SyncTimeRegistry;
use harbor_engine::ModelName;
use std::sync::Arc;
use tokio::sync::watch;

pub(crate) struct Pipelines {
    /// User models, parents first
    models: Vec<ModelName>,
    pub(crate) subscriptions: SubscriptionProcessor,
    pub(crate) sync: SyncProcessor,
    pub(crate) mutations: MutationProcessor,
    events: EventHub,
    error_handler: Arc<dyn ErrorHandler>,
}

impl Pipelines {
    pub(crate) fn new(
        config: &DataStoreConfig,
        models: Vec<ModelName>,
        remote: Arc<dyn RemoteApi>,
        store: Arc<dyn LocalStore>,
        outbox: Arc<MutationOutbox>,
        merger: Merger,
        events: EventHub,
    ) -> Self {
        let resolver = ConflictResolver::new(
            config,
            merger.clone(),
            outbox.clone(),
            store.clone(),
            remote.clone(),
            events.clone(),
        );
        let mutations = MutationProcessor::new(
            config,
            outbox,
            merger.clone(),
            resolver,
            store.clone(),
            remote.clone(),
            events.clone(),
        );
        let subscriptions = SubscriptionProcessor::new(
            config,
            models.clone(),
            remote.clone(),
            merger.clone(),
            events.clone(),
        );
        let sync = SyncProcessor::new(
            config,
            remote,
            merger,
            SyncTimeRegistry::new(store),
            events.clone(),
        );

        Self {
            models,
            subscriptions,
            sync,
            mutations,
            events,
            error_handler: config.error_handler.clone(),
        }
    }

    /// Subscribe, hydrate, then start draining the outbox.
    ///
    /// A subscription failure is reported and the remaining steps still run.
    /// The drain loop only starts if the network is still reachable.
    pub(crate) async fn bring_up(
        &self,
        resync_tx: ResyncSender,
        reachability: &watch::Receiver<bool>,
    ) -> HydrateReport {
        if let Err(e) = self.subscriptions.start(resync_tx).await {
            self.error_handler.on_error(&e);
        }
        let report = self.sync.hydrate(&self.models).await;
        if !*reachability.borrow() {
            tracing::info!("Network lost during sync; outbox stays queued");
            return report;
        }
        self.mutations.start().await;

        tracing::info!("Sync pipelines ready");
        self.events.publish(DataStoreEvent::Ready);
        report
    }

    /// Delta sync models whose subscriptions reconnected, parents first.
    pub(crate) async fn resync(&self, models: &[ModelName]) {
        let ordered: Vec<ModelName> = self
            .models
            .iter()
            .filter(|m| models.contains(m))
            .cloned()
            .collect();
        tracing::debug!(models = ?ordered, "Resyncing after reconnect");
        self.sync.hydrate(&ordered).await;
    }

    /// Stop subscriptions and the drain loop.
    pub(crate) async fn pause(&self) {
        self.subscriptions.stop().await;
        self.mutations.stop().await;
    }
}

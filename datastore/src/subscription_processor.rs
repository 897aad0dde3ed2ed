//! Real-time subscriptions.
//!
//! One task per model and change kind keeps a subscription open, merges
//! every notification and reconnects with backoff when the stream ends.

use crate::config::DataStoreConfig;
use crate::error::{DataStoreError, ErrorHandler, Result};
use crate::events::{DataStoreEvent, EventHub};
use crate::merger::Merger;
use crate::remote::{RemoteApi, RemoteError, SubscriptionType};
use crate::resilience::RetryConfig;
use futures::future::try_join_all;
use futures::StreamExt;
use harbor_engine::{ModelName, Record, VersionRule};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinSet;

/// Models whose subscriptions reconnected and may have missed changes.
pub type ResyncSender = mpsc::UnboundedSender<ModelName>;

struct Inner {
    remote: Arc<dyn RemoteApi>,
    merger: Merger,
    events: EventHub,
    error_handler: Arc<dyn ErrorHandler>,
    retry: RetryConfig,
    models: Vec<ModelName>,
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

pub struct SubscriptionProcessor {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

impl SubscriptionProcessor {
    pub fn new(
        config: &DataStoreConfig,
        models: Vec<ModelName>,
        remote: Arc<dyn RemoteApi>,
        merger: Merger,
        events: EventHub,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                remote,
                merger,
                events,
                error_handler: config.error_handler.clone(),
                retry: config.subscription_retry.clone(),
                models,
            }),
            running: Mutex::new(None),
        }
    }

    /// Open every subscription and wait until each is established once.
    ///
    /// Fails with the first subscription error, leaving nothing running.
    pub async fn start(&self, resync_tx: ResyncSender) -> Result<()> {
        let mut established = Vec::new();
        {
            let mut running = self.running.lock().await;
            if running.is_some() {
                return Ok(());
            }

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let mut tasks = JoinSet::new();
            for model in &self.inner.models {
                for kind in SubscriptionType::ALL {
                    let (ready_tx, ready_rx) = oneshot::channel();
                    let inner = self.inner.clone();
                    let model = model.clone();
                    let shutdown_rx = shutdown_rx.clone();
                    let resync_tx = resync_tx.clone();
                    tasks.spawn(async move {
                        inner.run(model, kind, shutdown_rx, resync_tx, ready_tx).await
                    });
                    established.push(ready_rx);
                }
            }
            *running = Some(Running { shutdown_tx, tasks });
        }

        let count = established.len();
        let result = try_join_all(established.into_iter().map(|rx| async move {
            match rx.await {
                Ok(result) => result.map_err(DataStoreError::from),
                Err(_) => Err(DataStoreError::Shutdown),
            }
        }))
        .await;

        match result {
            Ok(_) => {
                tracing::info!(subscriptions = count, "Subscriptions established");
                self.inner.events.publish(DataStoreEvent::SubscriptionsEstablished);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to establish subscriptions");
                self.stop().await;
                Err(e)
            }
        }
    }

    /// Cancel every subscription task.
    pub async fn stop(&self) {
        let Some(mut running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.shutdown_tx.send(true);
        running.tasks.shutdown().await;
        tracing::info!("Subscriptions stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

impl Inner {
    async fn run(
        self: Arc<Self>,
        model: ModelName,
        kind: SubscriptionType,
        mut shutdown_rx: watch::Receiver<bool>,
        resync_tx: ResyncSender,
        ready: oneshot::Sender<std::result::Result<(), RemoteError>>,
    ) {
        let mut ready = Some(ready);
        let mut failures = 0u32;

        loop {
            let subscribed = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => return,
                result = self.remote.subscribe(&model, kind) => result,
            };

            let mut stream = match subscribed {
                Ok(stream) => stream,
                Err(e) => {
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Err(e));
                        return;
                    }
                    failures += 1;
                    if !self.retry.allows_retry(failures) {
                        tracing::error!(model = %model, kind = %kind, error = %e, "Giving up on subscription");
                        self.error_handler.on_error(&DataStoreError::from(e));
                        return;
                    }
                    tracing::warn!(model = %model, kind = %kind, attempt = failures, error = %e, "Subscription reconnect failed");
                    if !self.backoff(failures, &mut shutdown_rx).await {
                        return;
                    }
                    continue;
                }
            };

            match ready.take() {
                Some(ready) => {
                    tracing::debug!(model = %model, kind = %kind, "Subscription established");
                    let _ = ready.send(Ok(()));
                }
                None => {
                    tracing::info!(model = %model, kind = %kind, "Subscription reconnected");
                    failures = 0;
                    let _ = resync_tx.send(model.clone());
                }
            }

            loop {
                let item = tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => return,
                    item = stream.next() => item,
                };
                match item {
                    Some(Ok(record)) => self.process(&model, record).await,
                    Some(Err(e)) => {
                        tracing::warn!(model = %model, kind = %kind, error = %e, "Subscription error");
                        break;
                    }
                    None => {
                        tracing::warn!(model = %model, kind = %kind, "Subscription closed");
                        break;
                    }
                }
            }

            failures += 1;
            if !self.backoff(failures, &mut shutdown_rx).await {
                return;
            }
        }
    }

    async fn process(&self, model: &str, record: Record) {
        if record.model != model {
            tracing::warn!(expected = model, model = %record.model, "Ignoring notification for another model");
            return;
        }

        let id = record.id.clone();
        let version = record.version;
        match self.merger.merge_remote(record, VersionRule::Newer).await {
            Ok(outcome) => {
                tracing::debug!(model, id = %id, ?version, ?outcome, "Subscription data processed");
                self.events.publish(DataStoreEvent::SubscriptionDataProcessed {
                    model: model.to_string(),
                    id,
                    version,
                });
            }
            Err(e) => {
                tracing::error!(model, id = %id, error = %e, "Failed to merge subscription data");
                self.error_handler.on_error(&e);
            }
        }
    }

    /// Sleep before reconnecting. Returns false when shut down meanwhile.
    async fn backoff(&self, attempt: u32, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        let delay = self.retry.jittered_delay(attempt);
        tokio::select! {
            _ = shutdown_rx.changed() => false,
            _ = tokio::time::sleep(delay) => !*shutdown_rx.borrow(),
        }
    }
}

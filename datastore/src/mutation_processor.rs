//! Outbox drain loop.
//!
//! A single loop claims outbox entries and delivers them on a `JoinSet`,
//! bounded by a semaphore. The outbox hands out at most one entry per
//! record at a time, so deliveries to the same record stay ordered while
//! different records proceed concurrently.

use crate::config::DataStoreConfig;
use crate::conflict::ConflictResolver;
use crate::error::{DataStoreError, ErrorHandler, Result};
use crate::events::{DataStoreEvent, EventHub};
use crate::merger::Merger;
use crate::outbox::MutationOutbox;
use crate::remote::{MutationRequest, RemoteApi, RemoteError};
use crate::resilience::RetryConfig;
use crate::storage::LocalStore;
use harbor_engine::{ChangeType, PendingMutation};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

struct Inner {
    outbox: Arc<MutationOutbox>,
    merger: Merger,
    resolver: ConflictResolver,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteApi>,
    events: EventHub,
    error_handler: Arc<dyn ErrorHandler>,
    retry: RetryConfig,
    max_concurrent: usize,
    shutdown_timeout: Duration,
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct MutationProcessor {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

impl MutationProcessor {
    pub fn new(
        config: &DataStoreConfig,
        outbox: Arc<MutationOutbox>,
        merger: Merger,
        resolver: ConflictResolver,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteApi>,
        events: EventHub,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                outbox,
                merger,
                resolver,
                store,
                remote,
                events,
                error_handler: config.error_handler.clone(),
                retry: config.mutation_retry.clone(),
                max_concurrent: config.max_concurrent_mutations,
                shutdown_timeout: config.shutdown_timeout,
            }),
            running: Mutex::new(None),
        }
    }

    /// Spawn the drain loop. No-op when already running.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.drain(shutdown_rx).await });

        tracing::info!(max_concurrent = self.inner.max_concurrent, "Mutation processor started");
        *running = Some(Running {
            shutdown_tx,
            handle,
        });
    }

    /// Stop the drain loop and wait for it to wind down.
    ///
    /// Deliveries waiting on backoff are abandoned and their entries
    /// returned to the queue.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        let _ = running.shutdown_tx.send(true);
        if let Err(e) = running.handle.await {
            tracing::warn!(error = %e, "Mutation drain loop panicked");
        }
        tracing::info!("Mutation processor stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

impl Inner {
    async fn drain(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = JoinSet::new();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            while let Some(result) = tasks.try_join_next() {
                log_task_result(result);
            }

            let permit = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.outbox.next_for_delivery().await {
                Some(mutation) => {
                    let inner = self.clone();
                    let rx = shutdown_rx.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        inner.deliver(mutation, rx).await;
                    });
                }
                None => {
                    drop(permit);
                    tokio::select! {
                        biased;
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = self.outbox.wait_for_work() => {}
                        Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                            log_task_result(result);
                        }
                    }
                }
            }
        }

        if !tasks.is_empty() {
            tracing::info!(in_flight = tasks.len(), "Waiting for in-flight mutations");
        }
        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            while let Some(result) = tasks.join_next().await {
                log_task_result(result);
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(aborted = tasks.len(), "In-flight mutations timed out during shutdown");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        self.outbox.release_all().await;
    }

    /// Deliver one claimed entry, retrying transient failures.
    async fn deliver(&self, mutation: PendingMutation, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            let error = match self.attempt(&mutation).await {
                Ok(()) => return,
                Err(e) => e,
            };

            if !error.is_retryable() {
                self.fail(&mutation, error).await;
                return;
            }

            let attempts = match self.outbox.record_attempt(&mutation.id, &error.to_string()).await {
                Ok(attempts) => attempts,
                Err(e) => {
                    self.fail(&mutation, e).await;
                    return;
                }
            };

            if !self.retry.allows_retry(attempts) {
                tracing::error!(mutation_id = %mutation.id, attempts, error = %error, "Mutation retries exhausted");
                if let Err(e) = self.outbox.park(&mutation.id, &error.to_string()).await {
                    self.error_handler.on_error(&e);
                }
                self.error_handler.on_error(&error);
                return;
            }

            let delay = self.retry.jittered_delay(attempts);
            tracing::warn!(
                mutation_id = %mutation.id,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying mutation"
            );

            // A dropped sender means the processor went away
            let stopped = tokio::select! {
                changed = shutdown_rx.changed() => changed.is_err() || *shutdown_rx.borrow(),
                _ = tokio::time::sleep(delay) => *shutdown_rx.borrow(),
            };
            if stopped {
                self.outbox.release(&mutation.id).await;
                return;
            }
        }
    }

    async fn attempt(&self, mutation: &PendingMutation) -> Result<()> {
        let request = self.request_for(mutation).await?;
        tracing::debug!(
            mutation_id = %mutation.id,
            key = %mutation.key(),
            change = %request.mutation_type,
            version = ?request.version,
            "Publishing mutation"
        );

        match self.remote.mutate(request).await {
            Ok(server) => {
                let version = server.version;
                self.merger.merge_response(server, &mutation.id).await?;
                self.outbox.remove(&mutation.id).await?;
                self.events.publish(DataStoreEvent::OutboxMutationProcessed {
                    mutation_id: mutation.id.clone(),
                    model: mutation.change.model.clone(),
                    id: mutation.change.item.id.clone(),
                    version,
                });
                Ok(())
            }
            Err(RemoteError::Conflict { remote }) => {
                self.resolver.resolve(mutation, *remote).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Build the request, taking the version from the stored copy.
    async fn request_for(&self, mutation: &PendingMutation) -> Result<MutationRequest> {
        let change = &mutation.change;
        let mut record = change.item.clone();

        let version = match change.change_type {
            ChangeType::Create => None,
            ChangeType::Update | ChangeType::Delete => self
                .store
                .get(&change.model, &record.id)
                .await?
                .and_then(|stored| stored.version)
                .or(record.version),
        };
        record.version = version;

        Ok(MutationRequest {
            mutation_type: change.change_type,
            record,
            version,
            condition: change.predicate.clone(),
        })
    }

    /// Drop an entry that cannot be delivered.
    async fn fail(&self, mutation: &PendingMutation, error: DataStoreError) {
        tracing::error!(mutation_id = %mutation.id, key = %mutation.key(), error = %error, "Mutation failed");

        if let Err(e) = self.outbox.remove(&mutation.id).await {
            self.error_handler.on_error(&e);
        }
        self.events.publish(DataStoreEvent::OutboxMutationFailed {
            mutation_id: mutation.id.clone(),
            model: mutation.change.model.clone(),
            id: mutation.change.item.id.clone(),
            error: error.to_string(),
        });
        self.error_handler.on_error(&error);
    }
}

fn log_task_result(result: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            tracing::error!(error = %e, "Mutation delivery panicked");
        }
    }
}

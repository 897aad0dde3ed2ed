//! Sync engine state machine.
//!
//! The orchestrator owns the lifecycle: `Stopped`, `LocalOnly` (no remote
//! API configured) or `SyncViaApi`. Transitions run under one lock, so a
//! start and a stop never interleave. While syncing, a watcher task
//! follows the reachability signal, pausing and resuming the pipelines
//! without changing the state, and runs delta syncs for models whose
//! subscriptions reconnected.

mod pipelines;

pub(crate) use pipelines::Pipelines;

use crate::error::{DataStoreError, Result};
use crate::events::{DataStoreEvent, EventHub};
use crate::outbox::MutationOutbox;
use crate::reachability::Reachability;
use crate::storage::LocalStore;
use crate::subscription_processor::ResyncSender;
use harbor_engine::{ModelName, OrchestratorState};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Sleep;

/// Reconnects arriving within this window share one delta sync.
const RESYNC_SETTLE: Duration = Duration::from_millis(50);

struct Watcher {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct Orchestrator {
    store: Arc<dyn LocalStore>,
    outbox: Arc<MutationOutbox>,
    events: EventHub,
    reachability: Reachability,
    pipelines: Option<Arc<Pipelines>>,
    state_tx: watch::Sender<OrchestratorState>,
    /// Transition lock, holding the connectivity watcher while syncing
    watcher: Mutex<Option<Watcher>>,
}

impl Orchestrator {
    pub(crate) fn new(
        store: Arc<dyn LocalStore>,
        outbox: Arc<MutationOutbox>,
        events: EventHub,
        reachability: Reachability,
        pipelines: Option<Pipelines>,
    ) -> Self {
        let (state_tx, _) = watch::channel(OrchestratorState::Stopped);
        Self {
            store,
            outbox,
            events,
            reachability,
            pipelines: pipelines.map(Arc::new),
            state_tx,
            watcher: Mutex::new(None),
        }
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<OrchestratorState> {
        self.state_tx.subscribe()
    }

    /// Start syncing, or run local-only without a remote API.
    ///
    /// Returns once the pipelines are up, skipped while offline, or cut
    /// short by a loss of connectivity. Starting an already started
    /// orchestrator does nothing.
    pub async fn start(&self) -> Result<()> {
        let mut watcher = self.watcher.lock().await;
        if self.state().is_started() {
            return Ok(());
        }

        let Some(pipelines) = self.pipelines.clone() else {
            self.set_state(OrchestratorState::LocalOnly);
            return Ok(());
        };

        let pending = self.outbox.load().await?;
        self.set_state(OrchestratorState::SyncViaApi);

        let (resync_tx, resync_rx) = mpsc::unbounded_channel();
        let mut reachability_rx = self.reachability.subscribe();
        let online = *reachability_rx.borrow_and_update();

        let (bring_up, ready_rx) = if online {
            tracing::info!(pending, "Starting sync pipelines");
            let (ready_tx, ready_rx) = oneshot::channel();
            let task = spawn_bring_up(
                pipelines.clone(),
                resync_tx.clone(),
                reachability_rx.clone(),
                Some(ready_tx),
            );
            (Some(task), Some(ready_rx))
        } else {
            tracing::info!(pending, "Offline; sync pipelines wait for connectivity");
            (None, None)
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(watch_connectivity(
            pipelines,
            online,
            reachability_rx,
            resync_tx,
            resync_rx,
            bring_up,
            shutdown_rx,
        ));
        *watcher = Some(Watcher {
            shutdown_tx,
            handle,
        });

        if let Some(ready_rx) = ready_rx {
            // Dropped unanswered when the network went away first
            let _ = ready_rx.await;
        }
        Ok(())
    }

    /// Stop every pipeline and return to `Stopped`.
    pub async fn stop(&self) -> Result<()> {
        let mut watcher = self.watcher.lock().await;
        if !self.state().is_started() {
            return Ok(());
        }

        if let Some(watcher) = watcher.take() {
            let _ = watcher.shutdown_tx.send(());
            if let Err(e) = watcher.handle.await {
                tracing::warn!(error = %e, "Connectivity watcher panicked");
            }
        }
        if let Some(pipelines) = &self.pipelines {
            pipelines.pause().await;
        }

        self.set_state(OrchestratorState::Stopped);
        Ok(())
    }

    /// Remove every local record and outbox entry. Only valid when stopped.
    pub async fn clear(&self) -> Result<()> {
        let _watcher = self.watcher.lock().await;
        let state = self.state();
        if state != OrchestratorState::Stopped {
            return Err(DataStoreError::InvalidState {
                expected: OrchestratorState::Stopped.to_string(),
                actual: state.to_string(),
            });
        }

        self.store.clear().await?;
        self.outbox.clear().await;
        tracing::info!("Cleared local data");
        Ok(())
    }

    fn set_state(&self, to: OrchestratorState) {
        let from = self.state_tx.send_replace(to);
        if from != to {
            tracing::info!(from = %from, to = %to, "Orchestrator state changed");
            self.events.publish(DataStoreEvent::StateChanged { from, to });
        }
    }
}

fn spawn_bring_up(
    pipelines: Arc<Pipelines>,
    resync_tx: ResyncSender,
    reachability_rx: watch::Receiver<bool>,
    ready: Option<oneshot::Sender<()>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        pipelines.bring_up(resync_tx, &reachability_rx).await;
        if let Some(ready) = ready {
            let _ = ready.send(());
        }
    })
}

/// Abort a task and wait until it is gone.
async fn cancel(task: &mut Option<JoinHandle<()>>) {
    if let Some(task) = task.take() {
        task.abort();
        let _ = task.await;
    }
}

/// Resolves with `fut`, or never when there is none.
async fn until<F: Future + Unpin>(fut: Option<&mut F>) -> F::Output {
    match fut {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

/// Follow reachability and resync requests until shut down.
///
/// Bring-up and resyncs run as tasks so a loss of connectivity is seen
/// while they are in progress. Resync requests are collected per model
/// and run together once no more arrive for a short while.
async fn watch_connectivity(
    pipelines: Arc<Pipelines>,
    mut online: bool,
    mut reachability_rx: watch::Receiver<bool>,
    resync_tx: ResyncSender,
    mut resync_rx: mpsc::UnboundedReceiver<ModelName>,
    mut bring_up: Option<JoinHandle<()>>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut resync: Option<JoinHandle<()>> = None;
    let mut settle: Option<Pin<Box<Sleep>>> = None;
    let mut pending: Vec<ModelName> = Vec::new();

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            changed = reachability_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let available = *reachability_rx.borrow_and_update();
                if available == online {
                    continue;
                }
                online = available;
                if online {
                    tracing::info!("Network available; resuming sync");
                    cancel(&mut bring_up).await;
                    bring_up = Some(spawn_bring_up(
                        pipelines.clone(),
                        resync_tx.clone(),
                        reachability_rx.clone(),
                        None,
                    ));
                } else {
                    tracing::info!("Network lost; pausing sync");
                    cancel(&mut bring_up).await;
                    cancel(&mut resync).await;
                    settle = None;
                    pending.clear();
                    pipelines.pause().await;
                }
            }
            Some(model) = resync_rx.recv() => {
                if !online {
                    continue;
                }
                if !pending.contains(&model) {
                    pending.push(model);
                }
                if settle.is_none() && resync.is_none() {
                    settle = Some(Box::pin(tokio::time::sleep(RESYNC_SETTLE)));
                }
            }
            _ = until(settle.as_mut()) => {
                settle = None;
                let models = std::mem::take(&mut pending);
                let pipelines = pipelines.clone();
                resync = Some(tokio::spawn(async move { pipelines.resync(&models).await }));
            }
            _ = until(resync.as_mut()) => {
                resync = None;
                if !pending.is_empty() {
                    settle = Some(Box::pin(tokio::time::sleep(RESYNC_SETTLE)));
                }
            }
        }
    }

    cancel(&mut bring_up).await;
    cancel(&mut resync).await;
}

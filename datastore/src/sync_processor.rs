//! Base and delta sync queries.

use crate::config::DataStoreConfig;
use crate::error::{DataStoreError, ErrorHandler, Result};
use crate::events::{DataStoreEvent, EventHub};
use crate::merger::{MergeOutcome, Merger};
use crate::now_millis;
use crate::remote::{RemoteApi, SyncRequest};
use crate::resilience;
use crate::sync_time::SyncTimeRegistry;
use harbor_engine::{LastSyncMetadata, ModelName, SyncType, Timestamp, VersionRule};
use std::sync::Arc;

/// Result of syncing one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSyncReport {
    pub model: ModelName,
    pub sync_type: SyncType,
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Records filtered out or not newer than the local copy
    pub skipped: usize,
    pub pages: usize,
    /// Watermark saved for the next delta sync
    pub synced_at: Timestamp,
}

impl ModelSyncReport {
    fn new(model: &str, sync_type: SyncType) -> Self {
        Self {
            model: model.to_string(),
            sync_type,
            added: 0,
            updated: 0,
            deleted: 0,
            skipped: 0,
            pages: 0,
            synced_at: 0,
        }
    }

    fn count(&mut self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Created => self.added += 1,
            MergeOutcome::Updated | MergeOutcome::MetadataOnly => self.updated += 1,
            MergeOutcome::Deleted => self.deleted += 1,
            MergeOutcome::Stale => self.skipped += 1,
        }
    }
}

/// Result of a hydrate pass over several models.
#[derive(Debug, Default)]
pub struct HydrateReport {
    pub synced: Vec<ModelSyncReport>,
    pub failed: Vec<(ModelName, DataStoreError)>,
}

impl HydrateReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn report_for(&self, model: &str) -> Option<&ModelSyncReport> {
        self.synced.iter().find(|r| r.model == model)
    }
}

pub struct SyncProcessor {
    config: DataStoreConfig,
    remote: Arc<dyn RemoteApi>,
    merger: Merger,
    sync_times: SyncTimeRegistry,
    events: EventHub,
    error_handler: Arc<dyn ErrorHandler>,
}

impl SyncProcessor {
    pub fn new(
        config: &DataStoreConfig,
        remote: Arc<dyn RemoteApi>,
        merger: Merger,
        sync_times: SyncTimeRegistry,
        events: EventHub,
    ) -> Self {
        Self {
            config: config.clone(),
            remote,
            merger,
            sync_times,
            error_handler: config.error_handler.clone(),
            events,
        }
    }

    /// Sync each model in order. A model that fails is reported and does
    /// not stop the others.
    pub async fn hydrate(&self, models: &[ModelName]) -> HydrateReport {
        tracing::info!(models = ?models, "Starting sync queries");
        self.events.publish(DataStoreEvent::SyncQueriesStarted {
            models: models.to_vec(),
        });

        let mut report = HydrateReport::default();
        for model in models {
            match self.sync_model(model).await {
                Ok(synced) => report.synced.push(synced),
                Err(e) => {
                    let error = DataStoreError::SyncFailed {
                        model: model.clone(),
                        source: Box::new(e),
                    };
                    tracing::error!(model = %model, error = %error, "Model sync failed");
                    self.error_handler.on_error(&error);
                    report.failed.push((model.clone(), error));
                }
            }
        }

        tracing::info!(
            synced = report.synced.len(),
            failed = report.failed.len(),
            "Sync queries finished"
        );
        self.events.publish(DataStoreEvent::SyncQueriesReady);
        report
    }

    /// Run a base or delta sync for one model.
    pub async fn sync_model(&self, model: &str) -> Result<ModelSyncReport> {
        let interval_ms = self.config.sync_interval.as_millis() as u64;
        let last_sync = self
            .sync_times
            .lookup(model)
            .await?
            .sync_time()
            .within(now_millis(), interval_ms);
        let sync_type = SyncType::for_time(last_sync);
        let filter = self.config.sync_expression(model).cloned();
        let max_records = self.config.sync_max_records;

        tracing::debug!(model, ?sync_type, last_sync = ?last_sync.as_option(), "Syncing model");

        let mut report = ModelSyncReport::new(model, sync_type);
        let mut fetched = 0usize;
        let mut next_token = None;

        loop {
            let remaining = max_records - fetched;
            let request = SyncRequest {
                model: model.to_string(),
                last_sync: last_sync.as_option(),
                limit: self.config.sync_page_size.min(remaining),
                next_token: next_token.take(),
                filter: filter.clone(),
            };

            let mut page = resilience::retry(&self.config.sync_retry, |_| {
                let request = request.clone();
                async move { Ok(self.remote.sync(request).await?) }
            })
            .await?;
            report.pages += 1;

            page.items.truncate(remaining);
            let received = page.items.len();
            fetched += received;

            for record in page.items {
                if record.model != model {
                    tracing::warn!(model, other = %record.model, "Ignoring record for another model");
                    continue;
                }
                let filtered_out = filter
                    .as_ref()
                    .is_some_and(|f| !record.deleted && !f.matches(&record.payload));
                if filtered_out {
                    report.skipped += 1;
                    continue;
                }
                let outcome = self
                    .merger
                    .merge_remote(record, VersionRule::NewerOrEqual)
                    .await?;
                report.count(outcome);
            }

            next_token = page.next_token;
            if next_token.is_none() || received == 0 || fetched >= max_records {
                break;
            }
        }

        report.synced_at = now_millis();
        self.sync_times
            .save(&LastSyncMetadata::synced(model, report.synced_at, sync_type))
            .await?;

        tracing::info!(
            model,
            ?sync_type,
            added = report.added,
            updated = report.updated,
            deleted = report.deleted,
            pages = report.pages,
            "Model synced"
        );
        self.events.publish(DataStoreEvent::ModelSynced {
            model: model.to_string(),
            is_full_sync: sync_type == SyncType::Base,
            is_delta_sync: sync_type == SyncType::Delta,
            added: report.added,
            updated: report.updated,
            deleted: report.deleted,
        });

        Ok(report)
    }
}

//! Shared test utilities for the datastore integration tests.
//!
//! This module provides:
//! - A scriptable in-memory remote API
//! - A local store that can be told to fail
//! - Schema fixtures and wait helpers

#![allow(dead_code)]

pub mod failing_store;
pub mod mock_remote;

pub use failing_store::*;
pub use mock_remote::*;

use harbor_datastore::engine::{FieldDef, FieldType, ModelSchema, Record, SchemaRegistry};
use harbor_datastore::{
    DataStore, DataStoreConfig, DataStoreConfigBuilder, DataStoreError, DataStoreEvent,
    ErrorHandler, LocalStore, RetryConfig,
};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Blog → Post → Comment, registered children first.
pub fn blog_registry() -> SchemaRegistry {
    SchemaRegistry::new(1)
        .with_model(
            ModelSchema::new(
                "Comment",
                vec![
                    FieldDef::required("id", FieldType::String),
                    FieldDef::required("content", FieldType::String),
                ],
            )
            .with_parent("Post"),
        )
        .with_model(
            ModelSchema::new(
                "Post",
                vec![
                    FieldDef::required("id", FieldType::String),
                    FieldDef::required("title", FieldType::String),
                    FieldDef::optional("rating", FieldType::Int),
                ],
            )
            .with_parent("Blog"),
        )
        .with_model(ModelSchema::new(
            "Blog",
            vec![
                FieldDef::required("id", FieldType::String),
                FieldDef::required("name", FieldType::String),
            ],
        ))
}

/// Fast retries so failure paths finish quickly.
pub fn test_config() -> DataStoreConfigBuilder {
    DataStoreConfig::builder()
        .mutation_retry(RetryConfig::testing())
        .sync_retry(RetryConfig::testing())
        .subscription_retry(RetryConfig::testing().with_max_attempts(u32::MAX))
        .shutdown_timeout(Duration::from_secs(1))
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Receive events until one matches.
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<DataStoreEvent>,
    mut matches: F,
) -> Option<DataStoreEvent>
where
    F: FnMut(&DataStoreEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Error handler that keeps every reported error.
#[derive(Default)]
pub struct RecordingErrorHandler {
    errors: std::sync::Mutex<Vec<String>>,
}

impl RecordingErrorHandler {
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.errors().iter().any(|e| e.contains(needle))
    }
}

impl ErrorHandler for RecordingErrorHandler {
    fn on_error(&self, error: &DataStoreError) {
        self.errors.lock().unwrap().push(error.to_string());
    }
}

/// A datastore wired to a mock remote.
pub struct Harness {
    pub store: DataStore,
    pub remote: Arc<MockRemoteApi>,
    pub errors: Arc<RecordingErrorHandler>,
}

impl Harness {
    pub fn new(config: DataStoreConfigBuilder) -> Self {
        Self::build(config, None, true)
    }

    pub fn offline(config: DataStoreConfigBuilder) -> Self {
        Self::build(config, None, false)
    }

    pub fn build(
        config: DataStoreConfigBuilder,
        local_store: Option<Arc<dyn LocalStore>>,
        online: bool,
    ) -> Self {
        init_tracing();
        let remote = Arc::new(MockRemoteApi::new());
        Self::with_remote(config, local_store, online, remote)
    }

    pub fn with_remote(
        config: DataStoreConfigBuilder,
        local_store: Option<Arc<dyn LocalStore>>,
        online: bool,
        remote: Arc<MockRemoteApi>,
    ) -> Self {
        let errors = Arc::new(RecordingErrorHandler::default());
        let config = config
            .error_handler(errors.clone())
            .build()
            .expect("valid test config");

        let mut builder = DataStore::builder(blog_registry())
            .remote_api(remote.clone())
            .config(config)
            .network_available(online);
        if let Some(local_store) = local_store {
            builder = builder.local_store(local_store);
        }

        Self {
            store: builder.build().expect("datastore builds"),
            remote,
            errors,
        }
    }

    /// Wait until the outbox has drained.
    pub async fn drained(&self) -> bool {
        let outbox = self.store.outbox().clone();
        wait_for(WAIT, || {
            let outbox = outbox.clone();
            async move { outbox.is_empty().await }
        })
        .await
    }

    /// Wait until the local copy satisfies `check`.
    pub async fn local_matches<F>(&self, model: &str, id: &str, check: F) -> bool
    where
        F: Fn(Option<&Record>) -> bool,
    {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let local = self.store.get(model, id).await.expect("local read");
            if check(local.as_ref()) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub fn post(id: &str, title: &str) -> Record {
    Record::new("Post", id, json!({"id": id, "title": title}))
}

pub fn blog(id: &str, name: &str) -> Record {
    Record::new("Blog", id, json!({"id": id, "name": name}))
}

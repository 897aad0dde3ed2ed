//! Unified error handling for the datastore.

use crate::config::ConfigError;
use crate::remote::RemoteError;
use harbor_engine::{ModelName, RecordKey};

/// Datastore error type.
#[derive(Debug, thiserror::Error)]
pub enum DataStoreError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("engine error: {0}")]
    Engine(#[from] harbor_engine::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("remote API error: {0}")]
    Remote(#[from] RemoteError),

    #[error("conflict handler failed: {0}")]
    ConflictHandler(String),

    #[error("conflict retries exhausted for {0}")]
    ConflictRetriesExhausted(RecordKey),

    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("record not found: {0}")]
    RecordNotFound(RecordKey),

    #[error("sync failed for model {model}: {source}")]
    SyncFailed {
        model: ModelName,
        #[source]
        source: Box<DataStoreError>,
    },

    #[error("datastore is shutting down")]
    Shutdown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl DataStoreError {
    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            DataStoreError::Remote(e) => e.is_retryable(),
            DataStoreError::SyncFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

/// Result type alias for datastore operations.
pub type Result<T> = std::result::Result<T, DataStoreError>;

/// Host hook for errors the engine cannot return to a caller.
///
/// Background pipelines report terminal failures here and keep running.
pub trait ErrorHandler: Send + Sync {
    fn on_error(&self, error: &DataStoreError);
}

/// Default handler: logs through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingErrorHandler;

impl ErrorHandler for LoggingErrorHandler {
    fn on_error(&self, error: &DataStoreError) {
        tracing::error!(error = %error, "DataStore error");
    }
}

//! Configuration management for the datastore.

use crate::conflict::{AlwaysApplyRemote, ConflictHandler};
use crate::error::{ErrorHandler, LoggingErrorHandler};
use crate::resilience::RetryConfig;
use harbor_engine::{ModelName, QueryPredicate};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Default base-sync interval: one day.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_SYNC_MAX_RECORDS: usize = 1000;
pub const DEFAULT_SYNC_PAGE_SIZE: usize = 1000;
pub const DEFAULT_MAX_CONCURRENT_MUTATIONS: usize = 4;
pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 3;
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Datastore configuration.
///
/// Build with [`DataStoreConfig::builder`] or load with
/// [`DataStoreConfig::from_env`]. Invalid values fail at build time.
#[derive(Clone)]
pub struct DataStoreConfig {
    /// A watermark older than this forces a base sync
    pub sync_interval: Duration,
    /// Records fetched per model per sync, at most
    pub sync_max_records: usize,
    /// Records requested per sync page
    pub sync_page_size: usize,
    /// Outbox deliveries in flight at once
    pub max_concurrent_mutations: usize,
    /// Conflict handler rounds per mutation before the entry is parked
    pub max_conflict_retries: u32,
    pub mutation_retry: RetryConfig,
    pub sync_retry: RetryConfig,
    pub subscription_retry: RetryConfig,
    /// Time allowed for in-flight deliveries to finish on stop
    pub shutdown_timeout: Duration,
    /// Per-model filters applied to sync queries
    pub sync_expressions: HashMap<ModelName, QueryPredicate>,
    pub conflict_handler: Arc<dyn ConflictHandler>,
    pub error_handler: Arc<dyn ErrorHandler>,
}

impl Default for DataStoreConfig {
    fn default() -> Self {
        Self {
            sync_interval: DEFAULT_SYNC_INTERVAL,
            sync_max_records: DEFAULT_SYNC_MAX_RECORDS,
            sync_page_size: DEFAULT_SYNC_PAGE_SIZE,
            max_concurrent_mutations: DEFAULT_MAX_CONCURRENT_MUTATIONS,
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
            mutation_retry: RetryConfig::mutation(),
            sync_retry: RetryConfig::sync(),
            subscription_retry: RetryConfig::subscription(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            sync_expressions: HashMap::new(),
            conflict_handler: Arc::new(AlwaysApplyRemote),
            error_handler: Arc::new(LoggingErrorHandler),
        }
    }
}

impl fmt::Debug for DataStoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataStoreConfig")
            .field("sync_interval", &self.sync_interval)
            .field("sync_max_records", &self.sync_max_records)
            .field("sync_page_size", &self.sync_page_size)
            .field("max_concurrent_mutations", &self.max_concurrent_mutations)
            .field("max_conflict_retries", &self.max_conflict_retries)
            .field("mutation_retry", &self.mutation_retry)
            .field("sync_retry", &self.sync_retry)
            .field("subscription_retry", &self.subscription_retry)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("sync_expressions", &self.sync_expressions)
            .finish_non_exhaustive()
    }
}

impl DataStoreConfig {
    pub fn builder() -> DataStoreConfigBuilder {
        DataStoreConfigBuilder::default()
    }

    /// Load configuration from environment variables (and `.env`).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through a key lookup, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::builder();

        if let Some(secs) = parse_var::<u64, _>(&lookup, "HARBOR_SYNC_INTERVAL_SECS")? {
            builder = builder.sync_interval(Duration::from_secs(secs));
        }
        if let Some(n) = parse_var(&lookup, "HARBOR_SYNC_MAX_RECORDS")? {
            builder = builder.sync_max_records(n);
        }
        if let Some(n) = parse_var(&lookup, "HARBOR_SYNC_PAGE_SIZE")? {
            builder = builder.sync_page_size(n);
        }
        if let Some(n) = parse_var(&lookup, "HARBOR_MAX_CONCURRENT_MUTATIONS")? {
            builder = builder.max_concurrent_mutations(n);
        }
        if let Some(n) = parse_var(&lookup, "HARBOR_MAX_CONFLICT_RETRIES")? {
            builder = builder.max_conflict_retries(n);
        }

        builder.build()
    }

    /// Check that every setting is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync_interval.is_zero() {
            return Err(ConfigError::MustBePositive("sync_interval"));
        }
        if self.sync_max_records == 0 {
            return Err(ConfigError::MustBePositive("sync_max_records"));
        }
        if self.sync_page_size == 0 {
            return Err(ConfigError::MustBePositive("sync_page_size"));
        }
        if self.max_concurrent_mutations == 0 {
            return Err(ConfigError::MustBePositive("max_concurrent_mutations"));
        }
        for (name, retry) in [
            ("mutation_retry", &self.mutation_retry),
            ("sync_retry", &self.sync_retry),
            ("subscription_retry", &self.subscription_retry),
        ] {
            if retry.max_attempts == 0 {
                return Err(ConfigError::MustBePositive(name));
            }
            if retry.backoff_factor < 1.0 || !(0.0..=1.0).contains(&retry.jitter) {
                return Err(ConfigError::InvalidRetry(name));
            }
        }
        Ok(())
    }

    /// The sync expression for a model, if one is configured.
    pub fn sync_expression(&self, model: &str) -> Option<&QueryPredicate> {
        self.sync_expressions.get(model).filter(|p| !p.is_all())
    }
}

fn parse_var<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
    }
}

/// Builder for [`DataStoreConfig`].
#[derive(Debug, Default)]
pub struct DataStoreConfigBuilder {
    config: DataStoreConfig,
}

impl DataStoreConfigBuilder {
    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.config.sync_interval = interval;
        self
    }

    pub fn sync_max_records(mut self, max: usize) -> Self {
        self.config.sync_max_records = max;
        self
    }

    pub fn sync_page_size(mut self, size: usize) -> Self {
        self.config.sync_page_size = size;
        self
    }

    pub fn max_concurrent_mutations(mut self, max: usize) -> Self {
        self.config.max_concurrent_mutations = max;
        self
    }

    pub fn max_conflict_retries(mut self, max: u32) -> Self {
        self.config.max_conflict_retries = max;
        self
    }

    pub fn mutation_retry(mut self, retry: RetryConfig) -> Self {
        self.config.mutation_retry = retry;
        self
    }

    pub fn sync_retry(mut self, retry: RetryConfig) -> Self {
        self.config.sync_retry = retry;
        self
    }

    pub fn subscription_retry(mut self, retry: RetryConfig) -> Self {
        self.config.subscription_retry = retry;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Restrict what a model's sync queries bring down.
    pub fn sync_expression(mut self, model: impl Into<ModelName>, predicate: QueryPredicate) -> Self {
        self.config.sync_expressions.insert(model.into(), predicate);
        self
    }

    pub fn conflict_handler(mut self, handler: Arc<dyn ConflictHandler>) -> Self {
        self.config.conflict_handler = handler;
        self
    }

    pub fn error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.config.error_handler = handler;
        self
    }

    pub fn build(self) -> Result<DataStoreConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    MustBePositive(&'static str),

    #[error("{0} has an invalid backoff factor or jitter")]
    InvalidRetry(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn defaults() {
        let config = DataStoreConfig::default();

        assert_eq!(config.sync_interval, Duration::from_secs(86_400));
        assert_eq!(config.sync_max_records, 1000);
        assert_eq!(config.sync_page_size, 1000);
        assert_eq!(config.max_concurrent_mutations, 4);
        assert_eq!(config.max_conflict_retries, 3);
        assert_eq!(config.mutation_retry.max_attempts, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_rejects_zero_values() {
        let result = DataStoreConfig::builder().sync_page_size(0).build();
        assert_eq!(
            result.unwrap_err(),
            ConfigError::MustBePositive("sync_page_size")
        );

        let result = DataStoreConfig::builder()
            .sync_interval(Duration::ZERO)
            .build();
        assert!(result.is_err());

        let result = DataStoreConfig::builder()
            .mutation_retry(RetryConfig::testing().with_max_attempts(0))
            .build();
        assert_eq!(
            result.unwrap_err(),
            ConfigError::MustBePositive("mutation_retry")
        );
    }

    #[test]
    fn from_lookup_reads_overrides() {
        let config = DataStoreConfig::from_lookup(lookup(&[
            ("HARBOR_SYNC_INTERVAL_SECS", "60"),
            ("HARBOR_SYNC_PAGE_SIZE", " 50 "),
            ("HARBOR_MAX_CONFLICT_RETRIES", "1"),
        ]))
        .unwrap();

        assert_eq!(config.sync_interval, Duration::from_secs(60));
        assert_eq!(config.sync_page_size, 50);
        assert_eq!(config.max_conflict_retries, 1);
        assert_eq!(config.sync_max_records, DEFAULT_SYNC_MAX_RECORDS);
    }

    #[test]
    fn from_lookup_rejects_garbage() {
        let result = DataStoreConfig::from_lookup(lookup(&[("HARBOR_SYNC_MAX_RECORDS", "lots")]));

        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { key: "HARBOR_SYNC_MAX_RECORDS", .. })
        ));
    }

    #[test]
    fn sync_expression_ignores_match_all() {
        let config = DataStoreConfig::builder()
            .sync_expression("Post", QueryPredicate::gt("rating", 3))
            .sync_expression("Comment", QueryPredicate::All)
            .build()
            .unwrap();

        assert!(config.sync_expression("Post").is_some());
        assert!(config.sync_expression("Comment").is_none());
        assert!(config.sync_expression("Blog").is_none());
    }
}

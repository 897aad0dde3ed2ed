//! Retry and backoff for remote calls.
//!
//! Mutation delivery, sync page fetches and subscription reconnects all
//! retry transient failures with exponential backoff plus random jitter.

use crate::error::Result;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, first try included.
    /// `u32::MAX` retries forever.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling for exponential backoff.
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,

    /// Fraction of the delay added as random jitter (0.0 disables).
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::mutation()
    }
}

impl RetryConfig {
    /// Mutation delivery: 5 attempts from 500ms, doubling, capped at 30s.
    pub fn mutation() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: 0.2,
        }
    }

    /// Sync page fetches: 3 attempts.
    pub fn sync() -> Self {
        Self {
            max_attempts: 3,
            ..Self::mutation()
        }
    }

    /// Subscription reconnects: retry forever, capped at 60s.
    pub fn subscription() -> Self {
        Self {
            max_attempts: u32::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            jitter: 0.2,
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            backoff_factor: 2.0,
            jitter: 0.0,
        }
    }

    /// Builder-style attempt limit.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = (attempt - 1).min(i32::MAX as u32) as i32;
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        Duration::from_secs_f64(delay_secs)
    }

    /// Delay for an attempt with random jitter applied, still capped.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let spread = base.as_secs_f64() * self.jitter;
        let extra = rand::thread_rng().gen_range(0.0..=spread);
        std::cmp::min(base + Duration::from_secs_f64(extra), self.max_delay)
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Run `operation` until it succeeds, fails permanently, or attempts run out.
///
/// The closure receives the 1-indexed attempt number. Only errors for which
/// [`DataStoreError::is_retryable`](crate::DataStoreError::is_retryable) holds are retried.
pub async fn retry<T, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && config.allows_retry(attempt) => {
                let delay = config.jittered_delay(attempt);
                tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteError;
    use crate::DataStoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_doubles_until_cap() {
        let config = RetryConfig::mutation();

        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(30));
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let config = RetryConfig::mutation();
        for attempt in 1..8 {
            let base = config.delay_for_attempt(attempt);
            let jittered = config.jittered_delay(attempt);
            assert!(jittered >= base);
            assert!(jittered <= config.max_delay);
            assert!(jittered.as_secs_f64() <= base.as_secs_f64() * 1.2 + 1e-9);
        }
    }

    #[test]
    fn presets() {
        assert_eq!(RetryConfig::sync().max_attempts, 3);
        assert!(RetryConfig::subscription().allows_retry(1_000_000));
        assert!(!RetryConfig::testing().allows_retry(3));
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = retry(&RetryConfig::testing(), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(DataStoreError::Remote(RemoteError::Network("blip".into())))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_on_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(&RetryConfig::testing(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DataStoreError::Remote(RemoteError::Validation("bad".into()))) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_stops_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(&RetryConfig::testing(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DataStoreError::Remote(RemoteError::Network("down".into()))) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn config(initial_ms: u64, max_ms: u64, factor: f64, jitter: f64) -> RetryConfig {
            RetryConfig {
                max_attempts: 5,
                initial_delay: Duration::from_millis(initial_ms),
                max_delay: Duration::from_millis(initial_ms.max(max_ms)),
                backoff_factor: factor,
                jitter,
            }
        }

        proptest! {
            #[test]
            fn prop_delay_never_decreases(
                initial in 1u64..1_000,
                max in 1u64..100_000,
                factor in 1.0f64..4.0,
                attempt in 1u32..64,
            ) {
                let config = config(initial, max, factor, 0.0);
                prop_assert!(config.delay_for_attempt(attempt + 1) >= config.delay_for_attempt(attempt));
            }

            #[test]
            fn prop_jittered_delay_is_capped(
                initial in 1u64..1_000,
                max in 1u64..100_000,
                jitter in 0.0f64..=1.0,
                attempt in 0u32..200,
            ) {
                let config = config(initial, max, 2.0, jitter);
                let delay = config.jittered_delay(attempt);
                prop_assert!(delay <= config.max_delay);
                prop_assert!(delay >= config.delay_for_attempt(attempt));
            }
        }
    }
}

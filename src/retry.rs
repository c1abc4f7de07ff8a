//! Error-type-specific retry strategies.
//!
//! Each classified backend error kind maps to a strategy: how many
//! attempts, how long to back off, and whether the watchdog timeout is
//! extended on retry. Retries are opt-in; the engine default is off.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::errors::{BackendError, BackendErrorKind};

/// Strategy for one error kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryStrategy {
    pub max_attempts: u32,
    /// Base backoff; doubled per attempt.
    pub initial_backoff_secs: u64,
    /// Multiply the run timeout by this on each retry (timeout errors).
    #[serde(default)]
    pub extend_timeout_factor: Option<f64>,
}

/// Full retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    pub strategies: HashMap<BackendErrorKind, RetryStrategy>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let mut strategies = HashMap::new();
        strategies.insert(
            BackendErrorKind::RateLimit,
            RetryStrategy {
                max_attempts: 3,
                initial_backoff_secs: 30,
                extend_timeout_factor: None,
            },
        );
        strategies.insert(
            BackendErrorKind::ApiError,
            RetryStrategy {
                max_attempts: 3,
                initial_backoff_secs: 5,
                extend_timeout_factor: None,
            },
        );
        strategies.insert(
            BackendErrorKind::Timeout,
            RetryStrategy {
                max_attempts: 2,
                initial_backoff_secs: 0,
                extend_timeout_factor: Some(1.5),
            },
        );
        // invalid_config, session_not_found, unknown: no strategy, fail fast
        Self {
            enabled: false,
            strategies,
        }
    }
}

/// The verdict for one failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub backoff: Duration,
    /// Replacement timeout for the next attempt, when extended.
    pub extended_timeout: Option<Duration>,
    pub reason: String,
}

impl RetryDecision {
    fn no(reason: impl Into<String>) -> Self {
        Self {
            should_retry: false,
            backoff: Duration::ZERO,
            extended_timeout: None,
            reason: reason.into(),
        }
    }
}

pub struct Retrier {
    config: RetryConfig,
}

impl Retrier {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Decide whether attempt `attempt` (0-based count of failures so far)
    /// should be retried.
    pub fn decide(
        &self,
        error: &BackendError,
        attempt: u32,
        original_timeout: Duration,
    ) -> RetryDecision {
        if !self.config.enabled {
            return RetryDecision::no("retries disabled");
        }
        if error.kind == BackendErrorKind::InvalidConfig {
            return RetryDecision::no("configuration errors never retry");
        }

        let Some(strategy) = self.config.strategies.get(&error.kind) else {
            return RetryDecision::no(format!("no retry strategy for {}", error.kind));
        };

        if attempt >= strategy.max_attempts {
            return RetryDecision::no(format!(
                "{} attempts exhausted for {}",
                strategy.max_attempts, error.kind
            ));
        }

        let backoff =
            Duration::from_secs(strategy.initial_backoff_secs.saturating_mul(1 << attempt));
        let extended_timeout = strategy
            .extend_timeout_factor
            .map(|f| original_timeout.mul_f64(f));

        RetryDecision {
            should_retry: true,
            backoff,
            extended_timeout,
            reason: format!(
                "retrying {} (attempt {} of {})",
                error.kind,
                attempt + 1,
                strategy.max_attempts
            ),
        }
    }

    /// Sleep for the backoff duration, returning early with an error when
    /// the cancel signal fires.
    pub async fn sleep(
        &self,
        mut cancel: watch::Receiver<bool>,
        duration: Duration,
    ) -> anyhow::Result<()> {
        if *cancel.borrow() {
            anyhow::bail!("cancelled before backoff");
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = cancel.changed() => anyhow::bail!("cancelled during backoff"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_retrier() -> Retrier {
        Retrier::new(RetryConfig {
            enabled: true,
            ..Default::default()
        })
    }

    fn err(kind: BackendErrorKind) -> BackendError {
        BackendError::new(kind, "boom")
    }

    #[test]
    fn rate_limit_backoff_sequence() {
        let retrier = enabled_retrier();
        let timeout = Duration::from_secs(600);

        let expected = [30u64, 60, 120];
        for (attempt, secs) in expected.iter().enumerate() {
            let d = retrier.decide(&err(BackendErrorKind::RateLimit), attempt as u32, timeout);
            assert!(d.should_retry, "attempt {attempt} should retry");
            assert_eq!(d.backoff, Duration::from_secs(*secs));
        }

        let d = retrier.decide(&err(BackendErrorKind::RateLimit), 3, timeout);
        assert!(!d.should_retry);
    }

    #[test]
    fn api_error_backoff_sequence() {
        let retrier = enabled_retrier();
        let timeout = Duration::from_secs(600);
        let d0 = retrier.decide(&err(BackendErrorKind::ApiError), 0, timeout);
        let d1 = retrier.decide(&err(BackendErrorKind::ApiError), 1, timeout);
        let d2 = retrier.decide(&err(BackendErrorKind::ApiError), 2, timeout);
        assert_eq!(d0.backoff, Duration::from_secs(5));
        assert_eq!(d1.backoff, Duration::from_secs(10));
        assert_eq!(d2.backoff, Duration::from_secs(20));
    }

    #[test]
    fn timeout_extends_watchdog() {
        let retrier = enabled_retrier();
        let d = retrier.decide(&err(BackendErrorKind::Timeout), 0, Duration::from_secs(600));
        assert!(d.should_retry);
        assert_eq!(d.extended_timeout, Some(Duration::from_secs(900)));

        let d = retrier.decide(&err(BackendErrorKind::Timeout), 2, Duration::from_secs(600));
        assert!(!d.should_retry);
    }

    #[test]
    fn invalid_config_never_retries() {
        let retrier = enabled_retrier();
        for attempt in 0..5 {
            let d = retrier.decide(
                &err(BackendErrorKind::InvalidConfig),
                attempt,
                Duration::from_secs(600),
            );
            assert!(!d.should_retry);
        }
    }

    #[test]
    fn unknown_has_no_strategy() {
        let retrier = enabled_retrier();
        let d = retrier.decide(&err(BackendErrorKind::Unknown), 0, Duration::from_secs(600));
        assert!(!d.should_retry);
    }

    #[test]
    fn disabled_engine_never_retries() {
        let retrier = Retrier::new(RetryConfig::default());
        let d = retrier.decide(&err(BackendErrorKind::RateLimit), 0, Duration::from_secs(600));
        assert!(!d.should_retry);
        assert_eq!(d.reason, "retries disabled");
    }

    #[tokio::test]
    async fn sleep_completes_when_not_cancelled() {
        let retrier = enabled_retrier();
        let (_tx, rx) = watch::channel(false);
        retrier.sleep(rx, Duration::from_millis(5)).await.unwrap();
    }

    #[tokio::test]
    async fn sleep_aborts_on_cancel() {
        let retrier = enabled_retrier();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            retrier.sleep(rx, Duration::from_secs(60)).await
        });
        tx.send(true).unwrap();
        let result = handle.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn sleep_aborts_when_already_cancelled() {
        let retrier = enabled_retrier();
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        assert!(retrier.sleep(rx, Duration::from_secs(60)).await.is_err());
    }
}

use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::constants::{
    DEFAULT_MAX_RETRIES, DEFAULT_MAX_RETRY_DELAY_SECS, DEFAULT_RETRY_DELAY_MULTIPLIER,
    DEFAULT_TOTAL_TIMEOUT_SECS,
};
use crate::error::{UploadError, UploadErrorCode};

/// Caller-supplied predicate extending the set of retriable errors.
pub type RetryableFn = Arc<dyn Fn(&UploadError) -> bool + Send + Sync>;

/// Configuration for exponential backoff when issuing upload requests.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Whether failed requests are retried at all.
    pub auto_retry: bool,
    /// Maximum number of retries before giving up.
    pub max_retries: u32,
    /// Base of the exponential delay growth.
    pub multiplier: f64,
    /// Per-attempt delay ceiling.
    pub max_delay: Duration,
    /// Total time budget for the upload, including all retries.
    pub total_timeout: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            auto_retry: true,
            max_retries: DEFAULT_MAX_RETRIES,
            multiplier: DEFAULT_RETRY_DELAY_MULTIPLIER,
            max_delay: Duration::from_secs(DEFAULT_MAX_RETRY_DELAY_SECS),
            total_timeout: Duration::from_secs(DEFAULT_TOTAL_TIMEOUT_SECS),
        }
    }
}

/// Reason `next_delay` stopped granting retries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exhaustion {
    AutoRetryDisabled,
    RetryLimit,
    TimeLimit,
}

/// Tracks the evolving backoff state across attempts of one retry cycle.
#[derive(Debug)]
pub struct BackoffState {
    config: BackoffConfig,
    retry_count: u32,
    deadline: Instant,
}

impl BackoffState {
    pub fn new(config: BackoffConfig) -> Self {
        let deadline = Instant::now() + config.total_timeout;
        Self {
            config,
            retry_count: 0,
            deadline,
        }
    }

    /// Anchors the total-timeout ceiling to an externally captured deadline,
    /// so every retry cycle of one upload shares the same budget.
    pub fn with_deadline(config: BackoffConfig, deadline: Instant) -> Self {
        Self {
            config,
            retry_count: 0,
            deadline,
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// A success within the cycle starts the attempt count over.
    pub fn reset(&mut self) {
        self.retry_count = 0;
    }

    /// The delay before the next attempt, or the reason no further attempt is
    /// allowed. Delay is `multiplier^n * 1s` plus up to one second of jitter,
    /// clamped by the per-attempt ceiling and the remaining total budget.
    pub fn next_delay(&mut self) -> Result<Duration, Exhaustion> {
        if !self.config.auto_retry {
            return Err(Exhaustion::AutoRetryDisabled);
        }
        if self.retry_count >= self.config.max_retries {
            return Err(Exhaustion::RetryLimit);
        }

        let exp = self.config.multiplier.powi(self.retry_count as i32);
        let jitter: f64 = rand::thread_rng().gen();
        let raw = Duration::from_secs_f64(exp + jitter);
        let capped = raw.min(self.config.max_delay);

        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Exhaustion::TimeLimit);
        }

        self.retry_count += 1;
        Ok(capped.min(remaining))
    }
}

/// Whether an error may be retried: transport failures, 404, and 5xx always
/// are; anything else only if the caller's predicate says so.
pub fn is_retriable(error: &UploadError, retryable_fn: Option<&RetryableFn>) -> bool {
    if error.code == UploadErrorCode::Network {
        return true;
    }
    match error.status {
        Some(404) => true,
        Some(status) if (500..600).contains(&status) => true,
        _ => retryable_fn.map(|f| f(error)).unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{network_error, request_failed};

    #[test]
    fn delays_grow_with_the_attempt_count() {
        let mut backoff = BackoffState::new(BackoffConfig::default());
        let d0 = backoff.next_delay().unwrap();
        let d1 = backoff.next_delay().unwrap();
        let d2 = backoff.next_delay().unwrap();
        // Jitter is at most one second, so each step dominates the last.
        assert!(d0 >= Duration::from_secs(1));
        assert!(d0 < Duration::from_secs(2));
        assert!(d1 >= Duration::from_secs(2));
        assert!(d2 >= Duration::from_secs(4));
    }

    #[test]
    fn per_attempt_ceiling_applies() {
        let config = BackoffConfig {
            max_delay: Duration::from_secs(3),
            max_retries: 10,
            ..BackoffConfig::default()
        };
        let mut backoff = BackoffState::new(config);
        for _ in 0..6 {
            assert!(backoff.next_delay().unwrap() <= Duration::from_secs(3));
        }
    }

    #[test]
    fn retry_limit_is_enforced() {
        let config = BackoffConfig {
            max_retries: 2,
            ..BackoffConfig::default()
        };
        let mut backoff = BackoffState::new(config);
        assert!(backoff.next_delay().is_ok());
        assert!(backoff.next_delay().is_ok());
        assert_eq!(backoff.next_delay(), Err(Exhaustion::RetryLimit));
    }

    #[test]
    fn elapsed_budget_exhausts_retries() {
        let config = BackoffConfig::default();
        let deadline = Instant::now() - Duration::from_secs(1);
        let mut backoff = BackoffState::with_deadline(config, deadline);
        assert_eq!(backoff.next_delay(), Err(Exhaustion::TimeLimit));
    }

    #[test]
    fn disabled_auto_retry_never_delays() {
        let config = BackoffConfig {
            auto_retry: false,
            ..BackoffConfig::default()
        };
        let mut backoff = BackoffState::new(config);
        assert_eq!(backoff.next_delay(), Err(Exhaustion::AutoRetryDisabled));
    }

    #[test]
    fn classifies_retriable_errors() {
        assert!(is_retriable(&network_error("reset"), None));
        assert!(is_retriable(&request_failed(404), None));
        assert!(is_retriable(&request_failed(503), None));
        assert!(!is_retriable(&request_failed(403), None));

        let allow_conflicts: RetryableFn = Arc::new(|error| error.status == Some(409));
        assert!(is_retriable(&request_failed(409), Some(&allow_conflicts)));
        assert!(!is_retriable(&request_failed(403), Some(&allow_conflicts)));
    }
}

//! Retry logic with exponential backoff for transient network failures.
//!
//! This module provides [`RetryPolicy`], [`FailureType`] and the generic
//! [`with_retry`] executor that every network operation of the pipeline runs
//! under.
//!
//! # Overview
//!
//! When an operation fails, the caller-supplied classifier maps the error to a
//! [`FailureType`]:
//! - [`FailureType::Transient`] - connection refused/reset, timeouts, DNS
//!   failures, HTTP 5xx. Retried until the budget is exhausted.
//! - [`FailureType::Permanent`] - everything else. Propagated on first
//!   occurrence.
//!
//! The [`RetryPolicy`] decides whether another attempt is allowed and how
//! long to wait before it:
//!
//! ```text
//! delay(retry) = min(base_delay * 2^retry, max_delay) (+ optional jitter)
//! ```
//!
//! where `retry` is 0 for the first retry.
//!
//! # Example
//!
//! ```no_run
//! use sepomex_core::download::{HttpClient, RetryPolicy, classify_error, with_retry};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::new();
//! let policy = RetryPolicy::default();
//! let page = with_retry(&policy, "landing page probe", classify_error, || {
//!     client.fetch_text("https://example.com/CodigoPostal_Exportar.aspx")
//! })
//! .await?;
//! println!("{} bytes of HTML", page.len());
//! # Ok(())
//! # }
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument, warn};

use super::DownloadError;

/// Default number of retries after the initial attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default base delay for exponential backoff (2 seconds).
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Default maximum delay cap (60 seconds).
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Classification of a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: connection refused/reset, timeout, DNS failure, 5xx.
    Transient,

    /// Failure that won't succeed regardless of retries.
    ///
    /// Examples: 404, TLS/certificate errors, local write errors, page
    /// structure changes, archives without the expected payload.
    Permanent,
}

/// Decision on whether to retry a failed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Configuration for retry behavior with exponential backoff.
///
/// # Default Values
///
/// - `max_retries`: 5 (six attempts in total)
/// - `base_delay`: 2 seconds
/// - `max_delay`: 60 seconds
/// - `max_jitter`: none
///
/// With defaults, delays are: 2s, 4s, 8s, 16s, 32s.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed after the initial attempt.
    max_retries: u32,

    /// Delay before the first retry.
    base_delay: Duration,

    /// Maximum delay cap.
    max_delay: Duration,

    /// Upper bound of random jitter added to each delay.
    max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_jitter: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with custom settings.
    ///
    /// # Arguments
    ///
    /// * `max_retries` - Retries after the initial attempt (0 disables retrying)
    /// * `base_delay` - Delay before the first retry
    /// * `max_delay` - Maximum delay cap
    #[must_use]
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            max_jitter: Duration::ZERO,
        }
    }

    /// Creates a policy with a custom retry count, using defaults for other settings.
    #[must_use]
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Adds up to `max_jitter` of random delay to every backoff.
    #[must_use]
    pub fn with_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// Returns the configured retry count.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the total attempt budget (initial attempt plus retries).
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Determines whether to retry a failed attempt.
    ///
    /// # Arguments
    ///
    /// * `failure_type` - Classification of the failure
    /// * `attempt` - The attempt number that just failed (1-indexed)
    #[instrument(skip(self), fields(max_attempts = self.max_attempts()))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if attempt >= self.max_attempts() {
            debug!(attempt, max = self.max_attempts(), "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts()),
            };
        }

        let delay = self.backoff_delay(attempt.saturating_sub(1)) + self.calculate_jitter();

        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Backoff before retry number `retry` (0-indexed), without jitter.
    ///
    /// Formula: `min(base_delay * 2^retry, max_delay)`
    #[must_use]
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn calculate_jitter(&self) -> Duration {
        if self.max_jitter.is_zero() {
            return Duration::ZERO;
        }
        let max_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter_ms = rand::thread_rng().gen_range(0..=max_ms);
        Duration::from_millis(jitter_ms)
    }
}

/// Runs `operation` under `policy`, retrying failures that `classify` marks
/// as [`FailureType::Transient`].
///
/// Permanent failures are returned after the first attempt. Transient
/// failures are returned once `policy.max_attempts()` attempts have failed;
/// the error returned is always the last one observed.
///
/// # Errors
///
/// Returns the operation's own error type unchanged.
pub async fn with_retry<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    operation_name: &str,
    classify: C,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> FailureType,
    E: Display,
{
    let mut attempt: u32 = 1;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = operation_name, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => match policy.should_retry(classify(&error), attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next_attempt,
                } => {
                    warn!(
                        operation = operation_name,
                        attempt,
                        max_attempts = policy.max_attempts(),
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "retryable failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt = next_attempt;
                }
                RetryDecision::DoNotRetry { reason } => {
                    warn!(
                        operation = operation_name,
                        attempt,
                        reason = %reason,
                        error = %error,
                        "giving up"
                    );
                    return Err(error);
                }
            },
        }
    }
}

/// Classifies a network error for retry decisions.
///
/// | Error | Type |
/// |-------|------|
/// | HTTP 5xx | Transient |
/// | Other HTTP status | Permanent |
/// | Timeout | Transient |
/// | Network (connect, DNS, reset, broken body) | Transient |
/// | Network (TLS, redirect loop, request build) | Permanent |
/// | IO (local write) | Permanent |
/// | InvalidUrl | Permanent |
#[must_use]
pub fn classify_error(error: &DownloadError) -> FailureType {
    match error {
        DownloadError::HttpStatus { status, .. } => classify_http_status(*status),
        DownloadError::Timeout { .. } => FailureType::Transient,
        DownloadError::Network { source, .. } => {
            if source.is_builder() || source.is_redirect() || is_tls_error(source) {
                FailureType::Permanent
            } else {
                FailureType::Transient
            }
        }
        DownloadError::Io { .. } | DownloadError::InvalidUrl { .. } => FailureType::Permanent,
    }
}

fn classify_http_status(status: u16) -> FailureType {
    if (500..600).contains(&status) {
        FailureType::Transient
    } else {
        FailureType::Permanent
    }
}

/// Checks if a reqwest error is a TLS/certificate error.
fn is_tls_error(error: &reqwest::Error) -> bool {
    let error_string = error.to_string().to_lowercase();
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
        || error_string.contains("handshake")
}

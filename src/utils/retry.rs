//! Bounded exponential backoff for direct, non-persisted operations.
//!
//! Work handed to the task registry is never retried automatically. This
//! is only for synchronous calls made by this process itself, such as
//! uploading a finished document.

use std::fmt::Display;
use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

/// Maximum number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Delay before the first retry; doubled for each further retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// How many times, and how far apart, to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before retry number `retry` (0-based): `base * 2^retry`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << retry.min(16))
    }

    /// Every delay the policy can produce, in order.
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.max_retries).map(|r| self.delay_for(r)).collect()
    }
}

fn server_error_regex() -> &'static Regex {
    static SERVER_ERROR: OnceLock<Regex> = OnceLock::new();
    SERVER_ERROR.get_or_init(|| Regex::new(r"\b5\d\d\b").expect("Invalid regex for 5xx status"))
}

/// Whether an error message describes a transient failure worth retrying.
///
/// Matches network and timeout failures, 5xx status codes, rate limiting
/// and quota exhaustion.
pub fn is_retryable_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    const TRANSIENT: &[&str] = &[
        "network",
        "timeout",
        "timed out",
        "connection",
        "temporarily",
        "service unavailable",
        "rate limit",
        "too many requests",
        "429",
        "quota",
    ];
    TRANSIENT.iter().any(|pattern| lowered.contains(pattern))
        || server_error_regex().is_match(&lowered)
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// the policy's retries are used up. Returns the last error in the latter
/// two cases.
///
/// `operation` receives the 0-based attempt number.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt: u32 = 0;
    let mut total_delay = Duration::ZERO;

    loop {
        let error = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let message = error.to_string();
        if !is_retryable_message(&message) {
            tracing::debug!(
                operation = operation_name,
                attempt = attempt + 1,
                error = %message,
                "Non-retryable error"
            );
            return Err(error);
        }
        if attempt >= policy.max_retries {
            tracing::warn!(
                operation = operation_name,
                attempts = attempt + 1,
                total_delay_ms = total_delay.as_millis() as u64,
                error = %message,
                "Retries exhausted"
            );
            return Err(error);
        }

        let delay = policy.delay_for(attempt);
        total_delay += delay;
        tracing::warn!(
            operation = operation_name,
            attempt = attempt + 1,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %message,
            "Transient failure, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

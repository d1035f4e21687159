//! Per-stage bounded retry with exponential backoff.
//!
//! Generalizes "retry one fallible async operation" over any
//! `Future<Output = Result<T, E>>` where `E: RetryableError`, rather than
//! baking in a specific operation (e.g. a provider call). A `sleep_fn` hook
//! is injectable so tests can assert on backoff timing without waiting in
//! wall-clock time.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crucible_core::ErrorKind;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Satisfied by any error type the retry controller can classify.
pub trait RetryableError {
    /// Classifies this error for the `retry_on_errors` membership check.
    fn error_kind(&self) -> ErrorKind;
}

impl RetryableError for crucible_core::CrucibleError {
    fn error_kind(&self) -> ErrorKind {
        crucible_core::CrucibleError::error_kind(self)
    }
}

/// Configures bounded-retry behavior for one fallible operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt. With
    /// `max_retries = 3` there are at most 4 total invocations.
    pub max_retries: u32,
    /// Base delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling on the backoff delay.
    pub max_delay: Duration,
    /// Multiplier applied to the delay on each successive attempt.
    pub exponential_base: u32,
    /// Error kinds worth retrying; any other kind breaks immediately.
    pub retry_on_errors: HashSet<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            exponential_base: 2,
            retry_on_errors: [ErrorKind::Timeout, ErrorKind::RateLimited, ErrorKind::NetworkError]
                .into_iter()
                .collect(),
        }
    }
}

/// `min(max_delay, initial_delay * exponential_base^attempt)`, computed with
/// saturating arithmetic so a large `attempt` cannot overflow into a short
/// delay. `attempt` is zero-based: the delay before the first retry (i.e.
/// after the initial attempt fails) uses `attempt = 0`.
pub fn compute_backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base_millis = policy.initial_delay.as_millis() as u64;
    let factor = (policy.exponential_base as u64).saturating_pow(attempt);
    let delay_millis = base_millis.saturating_mul(factor);
    Duration::from_millis(delay_millis).min(policy.max_delay)
}

/// An injectable sleep hook. Production callers pass `tokio_sleep`; tests
/// pass a no-op (or delay-recording) closure to run deterministically.
pub type SleepFn = Arc<dyn Fn(Duration) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// The real `tokio::time::sleep`-backed hook.
pub fn tokio_sleep() -> SleepFn {
    Arc::new(|d| Box::pin(tokio::time::sleep(d)))
}

/// Every attempt made in the course of one `retry_with_policy` call, for
/// callers that want to report attempts/delays (e.g. into progress events).
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    /// Zero-based attempt index (0 is the initial attempt).
    pub attempt: u32,
    /// The error kind observed, if this attempt failed.
    pub error_kind: Option<ErrorKind>,
    /// The delay slept before the *next* attempt, if one followed.
    pub delay_before_next: Option<Duration>,
}

/// Invokes `op` under the given retry policy.
///
/// On an error whose kind is in `policy.retry_on_errors`, sleeps for
/// `compute_backoff(policy, attempt)` via `sleep_fn` and retries, up to
/// `policy.max_retries` retries. On a non-retryable error, or after
/// exhausting retries, returns the terminal error. `on_attempt` is invoked
/// after every attempt (success or failure) for logging/metrics.
pub async fn retry_with_policy<T, E, F, Fut>(
    policy: &RetryPolicy,
    sleep_fn: &SleepFn,
    mut on_attempt: impl FnMut(&RetryAttempt),
    mut op: F,
) -> Result<T, E>
where
    E: RetryableError + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        let result = op().await;
        match result {
            Ok(value) => {
                on_attempt(&RetryAttempt { attempt, error_kind: None, delay_before_next: None });
                return Ok(value);
            }
            Err(err) => {
                let kind = err.error_kind();
                let retryable = policy.retry_on_errors.contains(&kind);
                if !retryable || attempt >= policy.max_retries {
                    on_attempt(&RetryAttempt { attempt, error_kind: Some(kind), delay_before_next: None });
                    warn!(attempt, ?kind, retryable, error = %err, "retry exhausted or non-retryable, surfacing error");
                    return Err(err);
                }
                let delay = compute_backoff(policy, attempt);
                on_attempt(&RetryAttempt {
                    attempt,
                    error_kind: Some(kind),
                    delay_before_next: Some(delay),
                });
                info!(attempt, ?kind, delay_ms = delay.as_millis() as u64, error = %err, "retryable error, backing off");
                sleep_fn(delay).await;
                attempt += 1;
            }
        }
    }
}

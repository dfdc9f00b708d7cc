//! Bounded retry with exponential backoff.
//!
//! Between attempt `k` and `k + 1` (counting from zero) the executor sleeps
//! `min(base_delay * backoff_factor^k, max_delay)`. Errors the policy
//! classifies as non-retryable end the loop immediately.

use backon::{ExponentialBuilder, Retryable};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::RetrySettings;
use crate::error::DependencyError;

type RetryPredicate = Arc<dyn Fn(&DependencyError) -> bool + Send + Sync>;

/// Retry policy for one dependency.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one (at least 1)
    pub max_attempts: u32,

    /// Delay before the first retry
    pub base_delay: Duration,

    /// Upper bound for any single delay
    pub max_delay: Duration,

    /// Multiplier applied per retry (at least 1.0)
    pub backoff_factor: f64,

    /// Timeout applied to each attempt; expiry counts as a transient failure
    pub attempt_timeout: Option<Duration>,

    retryable: RetryPredicate,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_factor", &self.backoff_factor)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: settings.base_delay,
            max_delay: settings.max_delay,
            backoff_factor: settings.backoff_factor.max(1.0),
            attempt_timeout: settings.attempt_timeout,
            retryable: Arc::new(DependencyError::is_transient),
        }
    }
}

impl RetryPolicy {
    /// Run the operation exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 1.0,
            attempt_timeout: None,
            retryable: Arc::new(DependencyError::is_transient),
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Replace the retryable predicate.
    pub fn with_retryable<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&DependencyError) -> bool + Send + Sync + 'static,
    {
        self.retryable = Arc::new(predicate);
        self
    }

    pub fn is_retryable(&self, error: &DependencyError) -> bool {
        (self.retryable)(error)
    }

    /// Delay slept after failed attempt `k` (zero-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let scaled = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_factor(self.backoff_factor as f32)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
    }
}

/// The last error of a failed execution, tagged with how many attempts ran.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed after {attempts} attempt(s): {source}")]
pub struct RetryError {
    pub attempts: u32,
    pub source: DependencyError,
}

/// Run `operation` under `policy`.
///
/// Each backoff sleep is an await point; dropping the returned future
/// cancels any remaining attempts.
pub async fn execute<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DependencyError>>,
{
    let attempts = AtomicU32::new(0);
    let attempt_timeout = policy.attempt_timeout;

    let result = (|| {
        attempts.fetch_add(1, Ordering::SeqCst);
        let call = operation();
        async move {
            match attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(DependencyError::Timeout(limit)),
                },
                None => call.await,
            }
        }
    })
    .retry(policy.backoff())
    .sleep(tokio::time::sleep)
    .when(|error: &DependencyError| policy.is_retryable(error))
    .notify(|error: &DependencyError, delay: Duration| {
        tracing::debug!(
            attempt = attempts.load(Ordering::SeqCst),
            max_attempts = policy.max_attempts,
            delay = ?delay,
            error = %error,
            "Retrying operation"
        );
    })
    .await;

    result.map_err(|source| RetryError {
        attempts: attempts.load(Ordering::SeqCst),
        source,
    })
}

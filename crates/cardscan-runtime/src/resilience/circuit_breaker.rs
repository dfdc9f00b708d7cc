//! Circuit breaker to prevent cascade failures.
//!
//! When a dependency fails repeatedly, its circuit opens and subsequent
//! calls go straight to the fallback until the recovery timeout elapses.
//!
//! ```text
//! Closed --(failure_threshold consecutive failures)--> Open
//! Open --(recovery_timeout elapsed, next check)--> HalfOpen
//! HalfOpen --(success_threshold consecutive successes)--> Closed
//! HalfOpen --(any failure)--> Open
//! ```

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{humantime_duration, ConfigError};

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,

    /// Time before attempting recovery
    #[serde(with = "humantime_duration")]
    pub recovery_timeout: Duration,

    /// Consecutive half-open successes needed to close the circuit.
    /// Defaults to `failure_threshold`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<u32>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: None,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            success_threshold: None,
        }
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = Some(threshold);
        self
    }

    /// Successes required in half-open before closing.
    pub fn success_threshold(&self) -> u32 {
        self.success_threshold.unwrap_or(self.failure_threshold)
    }

    pub(crate) fn validate(&self, scope: &str) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid(format!(
                "{}: breaker.failure_threshold must be at least 1",
                scope
            )));
        }
        if self.success_threshold == Some(0) {
            return Err(ConfigError::Invalid(format!(
                "{}: breaker.success_threshold must be at least 1",
                scope
            )));
        }
        Ok(())
    }
}

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,

    /// Dependency is unhealthy, calls bypass it
    Open,

    /// Probing whether the dependency recovered
    HalfOpen,
}

/// Point-in-time view of a breaker for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub can_execute: bool,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_at: Option<Instant>,
    last_failure_wall: Option<DateTime<Utc>>,
}

impl BreakerInner {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure_at: None,
            last_failure_wall: None,
        }
    }

    fn recovery_due(&self, recovery_timeout: Duration) -> bool {
        self.last_failure_at
            .map(|at| Instant::now().duration_since(at) > recovery_timeout)
            .unwrap_or(true)
    }
}

/// Circuit breaker guarding a single dependency.
///
/// State and both counters sit behind one lock, so concurrent callers
/// can never double-transition the circuit or lose a count.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker for the named dependency.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::closed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Check whether a call may go through.
    ///
    /// An open circuit whose recovery timeout has elapsed moves to
    /// half-open here and lets the probing call through.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if inner.recovery_due(self.config.recovery_timeout) {
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                    tracing::info!(
                        dependency = %self.name,
                        "Circuit transitioning to half-open for recovery test"
                    );
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call.
    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.consecutive_successes = inner.consecutive_successes.saturating_add(1);

        if inner.state == CircuitState::HalfOpen
            && inner.consecutive_successes >= self.config.success_threshold()
        {
            inner.state = CircuitState::Closed;
            inner.consecutive_successes = 0;
            tracing::info!(dependency = %self.name, "Circuit closed after successful recovery");
        }
    }

    /// Record a failed call.
    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        let previous = inner.state;
        inner.consecutive_successes = 0;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure_at = Some(Instant::now());
        inner.last_failure_wall = Some(Utc::now());

        if previous == CircuitState::HalfOpen {
            inner.state = CircuitState::Open;
            tracing::warn!(
                dependency = %self.name,
                "Circuit reopened after failed recovery attempt"
            );
        } else if inner.consecutive_failures >= self.config.failure_threshold
            && previous != CircuitState::Open
        {
            inner.state = CircuitState::Open;
            tracing::warn!(
                dependency = %self.name,
                failures = inner.consecutive_failures,
                "Circuit opened after repeated failures"
            );
        }
    }

    /// Get current state of the circuit.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Status view; reports `can_execute` without triggering a transition.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        let can_execute = match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => inner.recovery_due(self.config.recovery_timeout),
        };
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            last_failure_at: inner.last_failure_wall,
            can_execute,
        }
    }

    /// Force the circuit closed and clear its counters.
    pub fn reset(&self) {
        *self.inner.lock() = BreakerInner::closed();
        tracing::info!(dependency = %self.name, "Circuit breaker reset");
    }
}

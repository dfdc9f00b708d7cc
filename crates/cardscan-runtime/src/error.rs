//! Error types shared by the resilience layer and its collaborators.

use std::time::Duration;
use thiserror::Error;

/// Failure of an external dependency call.
///
/// Transient variants are retried and count toward the circuit breaker;
/// permanent variants fail fast but still count.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DependencyError {
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Dependency unavailable: {0}")]
    Unavailable(String),

    #[error("Dependency rejected the request: {0}")]
    Rejected(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DependencyError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }

    /// Timeouts and unavailability are worth retrying; rejections are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Unavailable(_))
    }
}

/// Errors surfaced by the orchestrator.
///
/// Dependency failures never appear here; they are absorbed into a
/// degraded outcome. Only misconfiguration does.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResilienceError {
    #[error("Fallback for '{dependency}' was registered for a different value type")]
    FallbackTypeMismatch { dependency: String },
}

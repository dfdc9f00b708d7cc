//! Fallback providers used when a dependency is unavailable.
//!
//! Each dependency has at most one fallback. The registry stores them
//! type-erased so a single orchestrator can serve dependencies returning
//! different value types; lookup re-checks the type at the call site.

use parking_lot::RwLock;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{DependencyError, ResilienceError};

/// Why a call fell back instead of returning a live value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DegradeReason {
    /// The breaker rejected the call without invoking the dependency
    CircuitOpen,

    /// The dependency was invoked and every attempt failed
    Failed {
        attempts: u32,
        #[serde(serialize_with = "serialize_error")]
        error: DependencyError,
    },
}

impl DegradeReason {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen)
    }
}

impl fmt::Display for DegradeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen => write!(f, "circuit open"),
            Self::Failed { attempts, error } => {
                write!(f, "failed after {} attempt(s): {}", attempts, error)
            }
        }
    }
}

fn serialize_error<S>(error: &DependencyError, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.collect_str(error)
}

type Provider<T> = Arc<dyn Fn(&DegradeReason) -> T + Send + Sync>;

/// Fallback providers keyed by dependency name.
#[derive(Default)]
pub struct FallbackRegistry {
    providers: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl fmt::Debug for FallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackRegistry")
            .field("dependencies", &self.names())
            .finish()
    }
}

impl FallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the fallback for `dependency`, replacing any previous one.
    pub fn register<T, F>(&self, dependency: impl Into<String>, provider: F)
    where
        T: 'static,
        F: Fn(&DegradeReason) -> T + Send + Sync + 'static,
    {
        let provider: Provider<T> = Arc::new(provider);
        self.providers
            .write()
            .insert(dependency.into(), Arc::new(provider));
    }

    /// Produce the fallback value for `dependency`.
    ///
    /// `Ok(None)` when nothing is registered; an error when the registered
    /// provider yields a different type than the caller expects.
    pub fn resolve<T: 'static>(
        &self,
        dependency: &str,
        reason: &DegradeReason,
    ) -> Result<Option<T>, ResilienceError> {
        let entry = match self.providers.read().get(dependency) {
            Some(entry) => Arc::clone(entry),
            None => return Ok(None),
        };

        let provider = entry.downcast_ref::<Provider<T>>().ok_or_else(|| {
            ResilienceError::FallbackTypeMismatch {
                dependency: dependency.to_string(),
            }
        })?;

        Ok(Some(provider(reason)))
    }

    pub fn contains(&self, dependency: &str) -> bool {
        self.providers.read().contains_key(dependency)
    }

    /// Registered dependency names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_registered() {
        let registry = FallbackRegistry::new();
        registry.register("ml_identification", |reason: &DegradeReason| {
            format!("fallback: {}", reason)
        });

        let value: Option<String> = registry
            .resolve("ml_identification", &DegradeReason::CircuitOpen)
            .unwrap();
        assert_eq!(value.as_deref(), Some("fallback: circuit open"));
    }

    #[test]
    fn test_resolve_missing_is_none() {
        let registry = FallbackRegistry::new();
        let value: Option<u32> = registry
            .resolve("analytics_write", &DegradeReason::CircuitOpen)
            .unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn test_type_mismatch() {
        let registry = FallbackRegistry::new();
        registry.register("card_detection", |_: &DegradeReason| 42u32);

        let err = registry
            .resolve::<String>("card_detection", &DegradeReason::CircuitOpen)
            .unwrap_err();
        assert_eq!(
            err,
            ResilienceError::FallbackTypeMismatch {
                dependency: "card_detection".to_string()
            }
        );
    }

    #[test]
    fn test_register_replaces_and_names_sorted() {
        let registry = FallbackRegistry::new();
        registry.register("ml_identification", |_: &DegradeReason| 1u8);
        registry.register("card_detection", |_: &DegradeReason| 2u8);
        registry.register("ml_identification", |_: &DegradeReason| 3u8);

        assert_eq!(registry.names(), vec!["card_detection", "ml_identification"]);
        let value: Option<u8> = registry
            .resolve("ml_identification", &DegradeReason::CircuitOpen)
            .unwrap();
        assert_eq!(value, Some(3));
    }

    #[test]
    fn test_reason_display() {
        let reason = DegradeReason::Failed {
            attempts: 3,
            error: DependencyError::unavailable("down"),
        };
        assert_eq!(
            reason.to_string(),
            "failed after 3 attempt(s): Dependency unavailable: down"
        );
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["reason"], "failed");
        assert_eq!(json["attempts"], 3);
    }
}

//! # cardscan-runtime
//!
//! Resilience layer and scan pipeline for cardscan.
//!
//! Every unreliable dependency of a scan (card detection, identification,
//! analytics writes) is called through a [`ResilienceOrchestrator`], which
//! combines:
//! - A circuit breaker per dependency
//! - Bounded retry with exponential backoff and per-attempt timeouts
//! - Fallback values when the dependency is unavailable
//! - An offline queue for writes that could not complete
//!
//! [`ScanPipeline`] sequences the scan stages through the orchestrator so a
//! scan always produces a usable result. [`HealthMonitor`] probes
//! connectivity in the background and replays queued writes once online.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cardscan_runtime::{
//!     FullFrameDetector, JsonlScanStore, ResilienceOrchestrator, RuntimeConfig, ScanPipeline,
//! };
//!
//! let config = RuntimeConfig::from_file("cardscan.yaml")?;
//! let orchestrator = Arc::new(ResilienceOrchestrator::open(config.resilience.clone()).await?);
//! let pipeline = ScanPipeline::new(
//!     orchestrator,
//!     Arc::new(FullFrameDetector),
//!     Arc::new(my_identifier),
//!     Arc::new(JsonlScanStore::new("scans.jsonl")),
//!     &config,
//! );
//!
//! let result = pipeline.run(&image_bytes, "image/jpeg", None).await?;
//! println!("{} ({:.2})", result.card_name, result.confidence);
//!
//! // Wait for the background analytics write before exiting
//! pipeline.flush().await;
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod orchestrator;
pub mod pipeline;
pub mod providers;
pub mod resilience;

pub use cache::{CacheKey, IdentificationCache};
pub use config::{
    CacheSettings, ConfigError, DependencySettings, HealthSettings, QueueSettings,
    ResilienceConfig, RetrySettings, RuntimeConfig, ANALYTICS_WRITE, CARD_DETECTION,
    ML_IDENTIFICATION,
};
pub use error::{DependencyError, ResilienceError};
pub use health::{HealthMonitor, TickReport};
pub use orchestrator::{
    Degraded, DependencyStatus, Outcome, ResilienceOrchestrator, ResilienceStatus, RetrySummary,
};
pub use pipeline::{
    PersistReplayer, ScanPipeline, ScanRequest, ERROR_FALLBACK_MODEL, OFFLINE_FALLBACK_MODEL,
    PERSIST_SCAN_RESULT,
};
pub use providers::{
    CardDetector, CardIdentifier, FullFrameDetector, HealthProbe, JsonlScanStore, ScanStore,
    StaticProbe,
};
#[cfg(feature = "http")]
pub use providers::{HttpHealthProbe, HttpIdentifier};
pub use resilience::{
    ActionReplayer, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    DegradeReason, DrainReport, FallbackRegistry, OfflineAction, OfflineQueue, PendingAction,
    QueueError, RetryError, RetryPolicy,
};

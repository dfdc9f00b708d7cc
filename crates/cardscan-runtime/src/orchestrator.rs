//! Resilience orchestrator.
//!
//! Single entry point for calling unreliable dependencies. For each
//! dependency name it owns:
//! - A circuit breaker, created on first use
//! - A retry policy, from configuration unless overridden
//! - An optional fallback provider
//!
//! and it shares one offline queue for mutating calls that could not run.
//! Dependency failures never surface as errors; callers get an
//! [`Outcome`] that is either the live value or a degraded one.

use cardscan_core::ConnectionStatus;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ResilienceConfig;
use crate::error::{DependencyError, ResilienceError};
use crate::resilience::{
    retry, ActionReplayer, BreakerSnapshot, CircuitBreaker, CircuitState, DegradeReason,
    DrainReport, FallbackRegistry, OfflineQueue, PendingAction, QueueError, RetryError,
    RetryPolicy,
};

/// Result of an orchestrated call.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// The dependency answered.
    Live(T),

    /// The dependency was skipped or failed.
    Degraded(Degraded<T>),
}

/// Details of a degraded call.
#[derive(Debug, Clone, PartialEq)]
pub struct Degraded<T> {
    pub dependency: String,
    pub reason: DegradeReason,

    /// Value from the registered fallback, if any
    pub fallback: Option<T>,

    /// Offline queue id when the call was deferred
    pub queued: Option<u64>,
}

impl<T> Outcome<T> {
    pub fn is_live(&self) -> bool {
        matches!(self, Outcome::Live(_))
    }

    /// The live value or the fallback value.
    pub fn value(self) -> Option<T> {
        match self {
            Outcome::Live(value) => Some(value),
            Outcome::Degraded(degraded) => degraded.fallback,
        }
    }

    pub fn degraded(&self) -> Option<&Degraded<T>> {
        match self {
            Outcome::Live(_) => None,
            Outcome::Degraded(degraded) => Some(degraded),
        }
    }
}

impl<T: Default> Outcome<T> {
    /// The live value, the fallback, or an empty value.
    pub fn into_value_or_default(self) -> T {
        self.value().unwrap_or_default()
    }
}

/// Retry policy as shown in status reports.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RetrySummary {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub attempt_timeout_ms: Option<u64>,
}

impl From<&RetryPolicy> for RetrySummary {
    fn from(policy: &RetryPolicy) -> Self {
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: duration_ms(policy.base_delay),
            max_delay_ms: duration_ms(policy.max_delay),
            backoff_factor: policy.backoff_factor,
            attempt_timeout_ms: policy.attempt_timeout.map(duration_ms),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Per-dependency entry of the status report.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DependencyStatus {
    #[serde(flatten)]
    pub breaker: BreakerSnapshot,
    pub retry: RetrySummary,
}

/// Administrative view of the resilience layer.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResilienceStatus {
    pub connection_status: ConnectionStatus,
    pub offline_queue_size: usize,
    pub dependencies: BTreeMap<String, DependencyStatus>,
    pub fallbacks: Vec<String>,
}

/// Owns breakers, retry policies, fallbacks and the offline queue.
pub struct ResilienceOrchestrator {
    config: ResilienceConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    policies: RwLock<HashMap<String, RetryPolicy>>,
    fallbacks: FallbackRegistry,
    queue: Arc<OfflineQueue>,
    probed_status: RwLock<ConnectionStatus>,
}

impl ResilienceOrchestrator {
    /// Create an orchestrator with a memory-only offline queue.
    ///
    /// A configured queue path is not attached here; use
    /// [`ResilienceOrchestrator::open`] to restore and keep persisting it.
    pub fn new(config: ResilienceConfig) -> Self {
        if let Some(path) = &config.offline_queue.path {
            tracing::warn!(
                path = %path.display(),
                "Offline queue path ignored; queue is memory-only"
            );
        }
        let queue = Arc::new(OfflineQueue::in_memory(config.offline_queue.max_retries));
        Self::with_queue(config, queue)
    }

    /// Create an orchestrator whose offline queue is restored from, and
    /// persisted to, the configured snapshot file.
    pub async fn open(config: ResilienceConfig) -> Result<Self, QueueError> {
        let queue = Arc::new(OfflineQueue::open(&config.offline_queue).await?);
        Ok(Self::with_queue(config, queue))
    }

    pub fn with_queue(config: ResilienceConfig, queue: Arc<OfflineQueue>) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
            policies: RwLock::new(HashMap::new()),
            fallbacks: FallbackRegistry::new(),
            queue,
            probed_status: RwLock::new(ConnectionStatus::Online),
        }
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// The breaker for `dependency`, created on first use.
    pub fn breaker(&self, dependency: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(dependency) {
            return Arc::clone(breaker);
        }

        let mut breakers = self.breakers.write();
        let breaker = breakers.entry(dependency.to_string()).or_insert_with(|| {
            tracing::debug!(dependency, "Creating circuit breaker");
            Arc::new(CircuitBreaker::new(
                dependency,
                self.config.breaker_for(dependency),
            ))
        });
        Arc::clone(breaker)
    }

    /// The retry policy for `dependency`.
    pub fn policy(&self, dependency: &str) -> RetryPolicy {
        if let Some(policy) = self.policies.read().get(dependency) {
            return policy.clone();
        }
        RetryPolicy::from(&self.config.retry_for(dependency))
    }

    /// Override the retry policy for `dependency`.
    pub fn set_retry_policy(&self, dependency: impl Into<String>, policy: RetryPolicy) {
        self.policies.write().insert(dependency.into(), policy);
    }

    /// Register the fallback used when `dependency` degrades.
    pub fn register_fallback<T, F>(&self, dependency: impl Into<String>, provider: F)
    where
        T: 'static,
        F: Fn(&DegradeReason) -> T + Send + Sync + 'static,
    {
        self.fallbacks.register(dependency, provider);
    }

    /// Run a read-only call through breaker, retry and fallback.
    pub async fn execute<T, F, Fut>(
        &self,
        dependency: &str,
        operation: F,
    ) -> Result<Outcome<T>, ResilienceError>
    where
        T: 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DependencyError>>,
    {
        self.run(dependency, None, operation).await
    }

    /// Run a mutating call; if it cannot complete, `action` is queued for
    /// replay.
    pub async fn execute_mutating<T, F, Fut>(
        &self,
        dependency: &str,
        action: PendingAction,
        operation: F,
    ) -> Result<Outcome<T>, ResilienceError>
    where
        T: 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DependencyError>>,
    {
        self.run(dependency, Some(action), operation).await
    }

    async fn run<T, F, Fut>(
        &self,
        dependency: &str,
        action: Option<PendingAction>,
        operation: F,
    ) -> Result<Outcome<T>, ResilienceError>
    where
        T: 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DependencyError>>,
    {
        let breaker = self.breaker(dependency);

        if !breaker.can_execute() {
            tracing::warn!(dependency, "Circuit open, using fallback");
            return self
                .degrade(dependency, DegradeReason::CircuitOpen, action)
                .await;
        }

        let policy = self.policy(dependency);
        match retry::execute(&policy, operation).await {
            Ok(value) => {
                breaker.on_success();
                Ok(Outcome::Live(value))
            }
            Err(RetryError { attempts, source }) => {
                breaker.on_failure();
                tracing::warn!(
                    dependency,
                    attempts,
                    error = %source,
                    "Dependency call failed, using fallback"
                );
                let reason = DegradeReason::Failed {
                    attempts,
                    error: source,
                };
                self.degrade(dependency, reason, action).await
            }
        }
    }

    async fn degrade<T: 'static>(
        &self,
        dependency: &str,
        reason: DegradeReason,
        action: Option<PendingAction>,
    ) -> Result<Outcome<T>, ResilienceError> {
        let queued = match action {
            Some(action) => Some(self.queue.enqueue(action).await),
            None => None,
        };

        let fallback = self.fallbacks.resolve::<T>(dependency, &reason)?;

        Ok(Outcome::Degraded(Degraded {
            dependency: dependency.to_string(),
            reason,
            fallback,
            queued,
        }))
    }

    /// Record the latest health probe result.
    pub fn set_probed_status(&self, status: ConnectionStatus) {
        let previous = std::mem::replace(&mut *self.probed_status.write(), status);
        if previous != status {
            tracing::info!(from = %previous, to = %status, "Connection status changed");
        }
    }

    pub fn probed_status(&self) -> ConnectionStatus {
        *self.probed_status.read()
    }

    /// Aggregate status: the last probe, raised to degraded while any
    /// breaker is not closed.
    pub fn connection_status(&self) -> ConnectionStatus {
        let probed = self.probed_status();
        let any_unhealthy = self
            .breakers
            .read()
            .values()
            .any(|b| b.state() != CircuitState::Closed);
        if any_unhealthy {
            probed.worst(ConnectionStatus::Degraded)
        } else {
            probed
        }
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    pub fn offline_queue_size(&self) -> usize {
        self.queue.size()
    }

    /// Replay queued actions.
    pub async fn drain_offline(&self, replayer: &dyn ActionReplayer) -> DrainReport {
        self.queue.drain(replayer).await
    }

    /// Force a dependency's breaker closed. Returns false if it was never used.
    pub fn reset(&self, dependency: &str) -> bool {
        match self.breakers.read().get(dependency) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Snapshot of every breaker in use plus queue and fallback state.
    pub fn status(&self) -> ResilienceStatus {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().values().cloned().collect();

        let dependencies = breakers
            .iter()
            .map(|breaker| {
                let status = DependencyStatus {
                    breaker: breaker.snapshot(),
                    retry: RetrySummary::from(&self.policy(breaker.name())),
                };
                (breaker.name().to_string(), status)
            })
            .collect();

        ResilienceStatus {
            connection_status: self.connection_status(),
            offline_queue_size: self.queue.size(),
            dependencies,
            fallbacks: self.fallbacks.names(),
        }
    }
}

impl std::fmt::Debug for ResilienceOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceOrchestrator")
            .field("breakers", &self.breakers.read().keys().collect::<Vec<_>>())
            .field("fallbacks", &self.fallbacks)
            .field("offline_queue_size", &self.queue.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QueueSettings, RetrySettings, ANALYTICS_WRITE, ML_IDENTIFICATION};
    use crate::resilience::{CircuitBreakerConfig, OfflineAction};
    use async_trait::async_trait;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(threshold: u32) -> ResilienceConfig {
        ResilienceConfig {
            breaker: CircuitBreakerConfig::new(threshold, Duration::from_secs(60)),
            retry: RetrySettings::new(2, Duration::from_millis(10), Duration::from_millis(20), 2.0),
            dependencies: BTreeMap::new(),
            ..ResilienceConfig::default()
        }
    }

    async fn failed_write(orchestrator: &ResilienceOrchestrator) {
        let outcome = orchestrator
            .execute_mutating(
                ANALYTICS_WRITE,
                PendingAction::new("persist_scan_result", Map::new()),
                || async { Err::<(), _>(DependencyError::unavailable("db down")) },
            )
            .await
            .unwrap();
        assert!(outcome.degraded().is_some_and(|d| d.queued.is_some()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_value() {
        let orchestrator = ResilienceOrchestrator::new(config(3));
        let outcome = orchestrator
            .execute(ML_IDENTIFICATION, || async { Ok::<_, DependencyError>(5u32) })
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Live(5));
        assert_eq!(orchestrator.breaker(ML_IDENTIFICATION).state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_uses_fallback_and_counts_once() {
        let orchestrator = ResilienceOrchestrator::new(config(3));
        orchestrator.register_fallback(ML_IDENTIFICATION, |_: &DegradeReason| "unknown".to_string());

        let calls = AtomicUsize::new(0);
        let outcome = orchestrator
            .execute(ML_IDENTIFICATION, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<String, _>(DependencyError::unavailable("down")) }
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let degraded = outcome.degraded().unwrap();
        assert_eq!(degraded.fallback.as_deref(), Some("unknown"));
        assert!(matches!(degraded.reason, DegradeReason::Failed { attempts: 2, .. }));
        assert!(degraded.queued.is_none());
        assert_eq!(
            orchestrator.breaker(ML_IDENTIFICATION).snapshot().consecutive_failures,
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_skips_operation() {
        let orchestrator = ResilienceOrchestrator::new(config(2));
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let _ = orchestrator
                .execute(ML_IDENTIFICATION, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<u32, _>(DependencyError::rejected("bad input")) }
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(orchestrator.breaker(ML_IDENTIFICATION).state(), CircuitState::Open);

        let outcome = orchestrator
            .execute(ML_IDENTIFICATION, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<u32, DependencyError>(1) }
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.degraded().unwrap().reason, DegradeReason::CircuitOpen);
        // Rejection by an open circuit is not a failure
        assert_eq!(
            orchestrator.breaker(ML_IDENTIFICATION).snapshot().consecutive_failures,
            2
        );
        assert_eq!(orchestrator.connection_status(), ConnectionStatus::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_fallback_gives_empty_value() {
        let orchestrator = ResilienceOrchestrator::new(config(3));
        let outcome = orchestrator
            .execute("cloud_sync", || async {
                Err::<Vec<String>, _>(DependencyError::unavailable("down"))
            })
            .await
            .unwrap();
        assert!(!outcome.is_live());
        assert!(outcome.into_value_or_default().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_type_mismatch_is_reported() {
        let orchestrator = ResilienceOrchestrator::new(config(3));
        orchestrator.register_fallback(ML_IDENTIFICATION, |_: &DegradeReason| 0u8);

        let err = orchestrator
            .execute(ML_IDENTIFICATION, || async {
                Err::<String, _>(DependencyError::unavailable("down"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::FallbackTypeMismatch { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_type_mismatch_still_queues_write() {
        let orchestrator = ResilienceOrchestrator::new(config(3));
        orchestrator.register_fallback(ANALYTICS_WRITE, |_: &DegradeReason| 0u8);

        let err = orchestrator
            .execute_mutating(
                ANALYTICS_WRITE,
                PendingAction::new("persist_scan_result", Map::new()),
                || async { Err::<(), _>(DependencyError::unavailable("db down")) },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ResilienceError::FallbackTypeMismatch { .. }));
        assert_eq!(orchestrator.offline_queue_size(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_call_stops_retrying() {
        let orchestrator = ResilienceOrchestrator::new(config(3));
        orchestrator.set_retry_policy(
            ML_IDENTIFICATION,
            RetryPolicy::from(&RetrySettings::new(
                5,
                Duration::from_secs(1),
                Duration::from_secs(10),
                2.0,
            )),
        );
        let failing = |calls: &AtomicUsize| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<u8, _>(DependencyError::unavailable("down")) }
        };

        // One call runs to exhaustion and is recorded
        let finished = AtomicUsize::new(0);
        let _ = orchestrator
            .execute(ML_IDENTIFICATION, || failing(&finished))
            .await
            .unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 5);
        let before = orchestrator.breaker(ML_IDENTIFICATION).snapshot();
        assert_eq!(before.consecutive_failures, 1);

        // Attempts at 0s and 1s, then dropped while sleeping toward 3s
        let abandoned = AtomicUsize::new(0);
        let result = tokio::time::timeout(
            Duration::from_millis(1500),
            orchestrator.execute(ML_IDENTIFICATION, || failing(&abandoned)),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(abandoned.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(abandoned.load(Ordering::SeqCst), 2);

        let after = orchestrator.breaker(ML_IDENTIFICATION).snapshot();
        assert_eq!(after.state, CircuitState::Closed);
        assert_eq!(after.consecutive_failures, before.consecutive_failures);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_restores_persisted_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offline.json");
        let config = ResilienceConfig {
            offline_queue: QueueSettings {
                max_retries: 3,
                path: Some(path.clone()),
            },
            ..config(3)
        };
        let first = ResilienceOrchestrator::open(config.clone()).await.unwrap();
        failed_write(&first).await;
        failed_write(&first).await;
        drop(first);

        // A memory-only orchestrator never touches the snapshot
        let memory_only = ResilienceOrchestrator::new(config.clone());
        failed_write(&memory_only).await;
        assert_eq!(OfflineQueue::load(&path).await.unwrap().len(), 2);

        let restarted = ResilienceOrchestrator::open(config).await.unwrap();
        assert_eq!(restarted.offline_queue_size(), 2);
        failed_write(&restarted).await;

        let ids: Vec<u64> = OfflineQueue::load(&path)
            .await
            .unwrap()
            .iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutating_failure_and_open_circuit_enqueue() {
        let orchestrator = ResilienceOrchestrator::new(config(1));
        let write = |label: &str| PendingAction::new(label, Map::new());

        let first = orchestrator
            .execute_mutating(ANALYTICS_WRITE, write("first"), || async {
                Err::<(), _>(DependencyError::unavailable("db down"))
            })
            .await
            .unwrap();
        assert!(first.degraded().unwrap().queued.is_some());

        // Breaker is now open; the second write is deferred without running
        let second = orchestrator
            .execute_mutating(ANALYTICS_WRITE, write("second"), || async { Ok::<(), DependencyError>(()) })
            .await
            .unwrap();
        let degraded = second.degraded().unwrap();
        assert_eq!(degraded.reason, DegradeReason::CircuitOpen);
        assert!(degraded.queued.is_some());
        assert_eq!(orchestrator.offline_queue_size(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_override() {
        let orchestrator = ResilienceOrchestrator::new(config(5));
        orchestrator.set_retry_policy(
            ML_IDENTIFICATION,
            RetryPolicy::no_retry().with_retryable(|_| true),
        );

        let calls = AtomicUsize::new(0);
        let _ = orchestrator
            .execute(ML_IDENTIFICATION, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<u8, _>(DependencyError::unavailable("down")) }
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_and_reset() {
        let orchestrator = ResilienceOrchestrator::new(config(1));
        orchestrator.register_fallback(ML_IDENTIFICATION, |_: &DegradeReason| 0u8);
        let _ = orchestrator
            .execute(ML_IDENTIFICATION, || async {
                Err::<u8, _>(DependencyError::unavailable("down"))
            })
            .await
            .unwrap();

        let status = orchestrator.status();
        let ml = &status.dependencies[ML_IDENTIFICATION];
        assert_eq!(ml.breaker.state, CircuitState::Open);
        assert!(!ml.breaker.can_execute);
        assert!(ml.breaker.last_failure_at.is_some());
        assert_eq!(ml.retry.max_attempts, 2);
        assert_eq!(status.fallbacks, vec![ML_IDENTIFICATION.to_string()]);
        assert_eq!(status.connection_status, ConnectionStatus::Degraded);

        assert!(orchestrator.reset(ML_IDENTIFICATION));
        assert!(!orchestrator.reset("never_used"));
        assert_eq!(orchestrator.connection_status(), ConnectionStatus::Online);

        let json = serde_json::to_value(orchestrator.status()).unwrap();
        assert_eq!(json["dependencies"][ML_IDENTIFICATION]["state"], "closed");
    }

    #[tokio::test]
    async fn test_probed_status_dominates() {
        let orchestrator = ResilienceOrchestrator::new(config(1));
        orchestrator.set_probed_status(ConnectionStatus::Offline);
        assert_eq!(orchestrator.connection_status(), ConnectionStatus::Offline);
        orchestrator.set_probed_status(ConnectionStatus::Online);
        assert_eq!(orchestrator.connection_status(), ConnectionStatus::Online);
    }

    #[tokio::test]
    async fn test_drain_offline() {
        struct Accept;

        #[async_trait]
        impl ActionReplayer for Accept {
            async fn replay(&self, _action: &OfflineAction) -> Result<(), DependencyError> {
                Ok(())
            }
        }

        let orchestrator = ResilienceOrchestrator::new(config(1));
        orchestrator
            .queue()
            .enqueue(PendingAction::new("persist_scan_result", Map::new()))
            .await;

        let report = orchestrator.drain_offline(&Accept).await;
        assert_eq!(report.processed, 1);
        assert_eq!(orchestrator.offline_queue_size(), 0);
    }
}

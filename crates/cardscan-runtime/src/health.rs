//! Background health monitoring and offline queue replay.

use cardscan_core::ConnectionStatus;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::HealthSettings;
use crate::orchestrator::ResilienceOrchestrator;
use crate::providers::HealthProbe;
use crate::resilience::{ActionReplayer, DrainReport};

/// What one monitoring pass observed and did.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub status: ConnectionStatus,
    pub drained: Option<DrainReport>,
}

/// Periodically probes connectivity and drains the offline queue while online.
pub struct HealthMonitor {
    orchestrator: Arc<ResilienceOrchestrator>,
    probe: Arc<dyn HealthProbe>,
    replayer: Arc<dyn ActionReplayer>,
    settings: HealthSettings,
}

impl HealthMonitor {
    pub fn new(
        orchestrator: Arc<ResilienceOrchestrator>,
        probe: Arc<dyn HealthProbe>,
        replayer: Arc<dyn ActionReplayer>,
        settings: HealthSettings,
    ) -> Self {
        Self {
            orchestrator,
            probe,
            replayer,
            settings,
        }
    }

    /// Probe once, record the status and drain if online.
    ///
    /// A probe that does not answer within `probe_timeout` counts as offline.
    pub async fn tick(&self) -> TickReport {
        let status = match tokio::time::timeout(self.settings.probe_timeout, self.probe.probe()).await
        {
            Ok(status) => status,
            Err(_) => {
                tracing::warn!(
                    timeout = ?self.settings.probe_timeout,
                    "Health probe timed out"
                );
                ConnectionStatus::Offline
            }
        };
        self.orchestrator.set_probed_status(status);

        let drained = if status == ConnectionStatus::Online && !self.orchestrator.queue().is_empty()
        {
            let report = self.orchestrator.drain_offline(self.replayer.as_ref()).await;
            tracing::info!(
                processed = report.processed,
                dropped = report.dropped.len(),
                remaining = report.remaining,
                "Drained offline queue"
            );
            Some(report)
        } else {
            None
        };

        TickReport { status, drained }
    }

    /// Run until `token` is cancelled.
    pub async fn run(self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(interval = ?self.settings.interval, "Starting health monitor");
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("Health monitor received shutdown signal");
                    break;
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(token))
    }
}

//! Scan pipeline.
//!
//! One scan moves through these stages, strictly in order:
//!
//! 1. Validate the upload (content type, size). Only this stage can fail.
//! 2. Detect card regions and crop to the best one. Failure means the full
//!    image is used.
//! 3. Identify the card. Failure degrades to a cached prediction for the same
//!    image, or to an unknown placeholder. While offline this stage is skipped.
//! 4. Attach system status, retry advice and user guidance.
//! 5. Persist the analytics record in a background task. The response does
//!    not wait for it; a failed write is queued for replay.

use async_trait::async_trait;
use cardscan_core::{
    ConnectionStatus, ErrorKind, HistoryEntry, Prediction, Region, ScanHistory, ScanLimits,
    ScanMode, ScanRecord, ScanResult, ScanStats, SystemStatus, UploadError,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::borrow::Cow;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::cache::{CacheKey, IdentificationCache};
use crate::config::{RuntimeConfig, ANALYTICS_WRITE, CARD_DETECTION, ML_IDENTIFICATION};
use crate::error::DependencyError;
use crate::orchestrator::{Outcome, ResilienceOrchestrator, ResilienceStatus};
use crate::providers::{CardDetector, CardIdentifier, ScanStore};
use crate::resilience::{ActionReplayer, DegradeReason, OfflineAction, PendingAction};

/// Offline action kind for deferred analytics writes.
pub const PERSIST_SCAN_RESULT: &str = "persist_scan_result";

/// Model version reported when identification was skipped while offline.
pub const OFFLINE_FALLBACK_MODEL: &str = "offline_fallback";

/// Model version reported when identification failed.
pub const ERROR_FALLBACK_MODEL: &str = "error_fallback";

const OFFLINE_MESSAGE: &str = "Scanning unavailable in offline mode. Please try again when online.";

/// One scan request.
#[derive(Debug, Clone, Copy)]
pub struct ScanRequest<'a> {
    pub image: &'a [u8],
    pub content_type: &'a str,

    /// Declared upload size, if the transport reported one
    pub content_length: Option<u64>,

    /// How many times the client already retried this scan
    pub retry_count: u32,
}

impl<'a> ScanRequest<'a> {
    pub fn new(image: &'a [u8], content_type: &'a str) -> Self {
        Self {
            image,
            content_type,
            content_length: None,
            retry_count: 0,
        }
    }

    pub fn with_content_length(mut self, content_length: u64) -> Self {
        self.content_length = Some(content_length);
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// Sequences detection, identification and analytics through the
/// resilience orchestrator.
///
/// Analytics writes still running when the pipeline is dropped are aborted;
/// call [`ScanPipeline::flush`] before shutting down.
pub struct ScanPipeline {
    orchestrator: Arc<ResilienceOrchestrator>,
    detector: Arc<dyn CardDetector>,
    identifier: Arc<dyn CardIdentifier>,
    store: Arc<dyn ScanStore>,
    limits: ScanLimits,
    cache: IdentificationCache,
    history: Mutex<ScanHistory>,
    writes: Mutex<JoinSet<()>>,
}

impl ScanPipeline {
    /// Create a pipeline and register its fallbacks on the orchestrator.
    pub fn new(
        orchestrator: Arc<ResilienceOrchestrator>,
        detector: Arc<dyn CardDetector>,
        identifier: Arc<dyn CardIdentifier>,
        store: Arc<dyn ScanStore>,
        config: &RuntimeConfig,
    ) -> Self {
        orchestrator.register_fallback(CARD_DETECTION, |_: &DegradeReason| Vec::<Region>::new());
        orchestrator.register_fallback(ML_IDENTIFICATION, |_: &DegradeReason| {
            Prediction::unknown(ERROR_FALLBACK_MODEL)
        });
        orchestrator.register_fallback(ANALYTICS_WRITE, |_: &DegradeReason| ());

        Self {
            orchestrator,
            detector,
            identifier,
            store,
            limits: config.limits.clone(),
            cache: IdentificationCache::new(&config.cache),
            history: Mutex::new(ScanHistory::default()),
            writes: Mutex::new(JoinSet::new()),
        }
    }

    pub fn orchestrator(&self) -> &Arc<ResilienceOrchestrator> {
        &self.orchestrator
    }

    /// Scan an image. Only upload validation errors are returned.
    pub async fn run(
        &self,
        image: &[u8],
        content_type: &str,
        content_length: Option<u64>,
    ) -> Result<ScanResult, UploadError> {
        let mut request = ScanRequest::new(image, content_type);
        request.content_length = content_length;
        self.run_request(request).await
    }

    pub async fn run_request(&self, request: ScanRequest<'_>) -> Result<ScanResult, UploadError> {
        let started = Instant::now();

        self.limits.validate(
            request.content_type,
            request.content_length.unwrap_or(0),
            request.image.len(),
        )?;

        let mut record = if self.orchestrator.connection_status() == ConnectionStatus::Offline {
            tracing::info!("Offline, skipping identification");
            offline_record()
        } else {
            let (detections, image) = self.detect(request.image).await;
            self.identify(&image, request.retry_count)
                .await
                .with_detections(detections)
        };
        record.processing_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let system_status = SystemStatus::new(
            self.orchestrator.connection_status(),
            self.orchestrator.offline_queue_size(),
        );
        self.spawn_log(record.clone());
        let result = ScanResult::assemble(record, system_status, request.retry_count);

        tracing::info!(
            card = %result.card_name,
            confidence = result.confidence,
            mode = ?result.mode,
            error_kind = ?result.error_kind,
            processing_time_ms = result.processing_time_ms,
            "Scan completed"
        );
        Ok(result)
    }

    /// Detect regions and return them with the image to identify.
    async fn detect<'a>(&self, image: &'a [u8]) -> (Vec<Region>, Cow<'a, [u8]>) {
        let regions = match self
            .orchestrator
            .execute(CARD_DETECTION, || self.detector.detect(image))
            .await
        {
            Ok(outcome) => outcome.into_value_or_default(),
            Err(e) => {
                tracing::error!(error = %e, "Card detection misconfigured, using full image");
                Vec::new()
            }
        };

        let image = match Region::best(&regions) {
            Some(best) => match self.detector.crop(image, &best.bounding_box) {
                Ok(cropped) => Cow::Owned(cropped),
                Err(e) => {
                    tracing::debug!(
                        detector = self.detector.name(),
                        error = %e,
                        "Crop failed, using full image"
                    );
                    Cow::Borrowed(image)
                }
            },
            None => Cow::Borrowed(image),
        };

        (regions, image)
    }

    async fn identify(&self, image: &[u8], retry_count: u32) -> ScanRecord {
        let key = CacheKey::for_image(image);
        let outcome = self
            .orchestrator
            .execute(ML_IDENTIFICATION, || self.identifier.identify(image))
            .await;

        let (fallback, message) = match outcome {
            Ok(Outcome::Live(prediction)) => {
                self.cache.insert(key, prediction.clone()).await;
                return ScanRecord::from_prediction(prediction, ScanMode::Online);
            }
            Ok(Outcome::Degraded(degraded)) => (degraded.fallback, degraded.reason.to_string()),
            Err(e) => {
                tracing::error!(error = %e, "Identification misconfigured");
                (None, e.to_string())
            }
        };

        if let Some(cached) = self.cache.get(&key).await {
            tracing::info!(
                identifier = self.identifier.name(),
                card = %cached.name,
                "Serving cached identification"
            );
            return ScanRecord::from_prediction(cached, ScanMode::Cached);
        }

        let message = if retry_count > 0 {
            format!("Retry {}: {}", retry_count, message)
        } else {
            message
        };
        let prediction = fallback.unwrap_or_else(|| Prediction::unknown(ERROR_FALLBACK_MODEL));
        ScanRecord::from_prediction(prediction, ScanMode::Error).with_error(ErrorKind::MlError, message)
    }

    /// Start the analytics write without waiting for it.
    fn spawn_log(&self, record: ScanRecord) {
        let orchestrator = Arc::clone(&self.orchestrator);
        let store = Arc::clone(&self.store);

        let mut writes = self.writes.lock();
        while writes.try_join_next().is_some() {}
        writes.spawn(async move { log_scan(&orchestrator, store.as_ref(), &record).await });
    }

    /// Wait for analytics writes started by earlier scans.
    pub async fn flush(&self) {
        let mut writes = std::mem::take(&mut *self.writes.lock());
        while let Some(joined) = writes.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "Scan analytics task did not complete");
            }
        }
    }

    /// Record a scan the user accepted.
    pub fn accept(&self, result: &ScanResult) -> HistoryEntry {
        let entry = HistoryEntry::from(result);
        self.history.lock().record(entry.clone());
        entry
    }

    /// Recently accepted scans, oldest first.
    pub fn history(&self, limit: Option<usize>) -> Vec<HistoryEntry> {
        self.history.lock().recent(limit)
    }

    pub fn stats(&self) -> ScanStats {
        self.history.lock().stats()
    }

    pub fn status(&self) -> ResilienceStatus {
        self.orchestrator.status()
    }

    /// Replayer for analytics writes queued by this pipeline.
    pub fn replayer(&self) -> PersistReplayer {
        PersistReplayer::new(Arc::clone(&self.store))
    }
}

/// Persist the analytics record; failures are queued and logged only.
async fn log_scan(orchestrator: &ResilienceOrchestrator, store: &dyn ScanStore, record: &ScanRecord) {
    let action = match PendingAction::from_serialize(PERSIST_SCAN_RESULT, record) {
        Ok(action) => action,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode scan record for the offline queue");
            return;
        }
    };

    let outcome = orchestrator
        .execute_mutating(ANALYTICS_WRITE, action, || store.persist(record))
        .await;

    match outcome {
        Ok(Outcome::Live(())) => {}
        Ok(Outcome::Degraded(degraded)) => {
            tracing::warn!(
                reason = %degraded.reason,
                queued = ?degraded.queued,
                "Scan analytics write degraded"
            );
        }
        Err(e) => {
            tracing::warn!(error = %e, "Scan analytics write misconfigured");
        }
    }
}

fn offline_record() -> ScanRecord {
    ScanRecord::from_prediction(Prediction::unknown(OFFLINE_FALLBACK_MODEL), ScanMode::Offline)
        .with_error(ErrorKind::OfflineMode, OFFLINE_MESSAGE)
}

/// Replays deferred analytics writes against a scan store.
pub struct PersistReplayer {
    store: Arc<dyn ScanStore>,
}

impl PersistReplayer {
    pub fn new(store: Arc<dyn ScanStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ActionReplayer for PersistReplayer {
    async fn replay(&self, action: &OfflineAction) -> Result<(), DependencyError> {
        if action.action_kind != PERSIST_SCAN_RESULT {
            return Err(DependencyError::rejected(format!(
                "Unknown offline action kind '{}'",
                action.action_kind
            )));
        }
        let record: ScanRecord = serde_json::from_value(Value::Object(action.payload.clone()))
            .map_err(|e| DependencyError::rejected(format!("Malformed scan record: {}", e)))?;
        self.store.persist(&record).await
    }
}

//! Core types for card scanning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::guidance::UserGuidance;

/// Card name reported when identification cannot produce one.
pub const UNKNOWN_CARD: &str = "Unknown";

/// Pixel rectangle of a detected card, `(x, y)` is the top-left corner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// A region of the image that likely contains a card.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Region {
    pub bounding_box: BoundingBox,

    /// Detector confidence (0.0 - 1.0)
    pub confidence: f64,
}

impl Region {
    pub fn new(bounding_box: BoundingBox, confidence: f64) -> Self {
        Self {
            bounding_box,
            confidence,
        }
    }

    /// Pick the highest-confidence region, if any.
    ///
    /// Ties keep the earliest region so the choice is stable.
    pub fn best(regions: &[Region]) -> Option<&Region> {
        regions.iter().fold(None, |best: Option<&Region>, region| match best {
            Some(current) if current.confidence >= region.confidence => Some(current),
            _ => Some(region),
        })
    }
}

/// Structured prediction returned by the identification service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Prediction {
    pub name: String,

    pub set: String,

    #[serde(default)]
    pub number: Option<String>,

    #[serde(default = "unknown")]
    pub rarity: String,

    /// Model confidence (0.0 - 1.0)
    #[serde(default)]
    pub confidence: f64,

    #[serde(default = "unknown")]
    pub model_version: String,

    #[serde(default)]
    pub processing_time_ms: u64,
}

fn unknown() -> String {
    UNKNOWN_CARD.to_string()
}

impl Prediction {
    /// The zero-confidence placeholder used whenever identification degrades.
    pub fn unknown(model_version: impl Into<String>) -> Self {
        Self {
            name: UNKNOWN_CARD.to_string(),
            set: UNKNOWN_CARD.to_string(),
            number: None,
            rarity: UNKNOWN_CARD.to_string(),
            confidence: 0.0,
            model_version: model_version.into(),
            processing_time_ms: 0,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.name == UNKNOWN_CARD && self.confidence == 0.0
    }
}

/// Aggregate connectivity as seen by the resilience layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Online,
    Degraded,
    Offline,
}

impl ConnectionStatus {
    /// The worse of two statuses.
    pub fn worst(self, other: ConnectionStatus) -> ConnectionStatus {
        self.max(other)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Online => "online",
            ConnectionStatus::Degraded => "degraded",
            ConnectionStatus::Offline => "offline",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a scan produced a degraded result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Identification failed or its circuit is open.
    MlError,

    /// The system is offline; identification was not attempted.
    OfflineMode,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MlError => "ml_error",
            ErrorKind::OfflineMode => "offline_mode",
        }
    }
}

/// Where the card data in a result came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// Live identification succeeded.
    Online,

    /// Identification degraded, a recent prediction for the same image was reused.
    Cached,

    /// Identification skipped because the system is offline.
    Offline,

    /// Identification failed; the result is a placeholder.
    Error,
}

/// Caller-visible retry schedule attached to degraded results.
///
/// This is independent of the internal retry executor's backoff.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryAdvice {
    pub retry_count: u32,
    pub suggest_retry: bool,
    pub retry_delay_seconds: u64,
}

impl RetryAdvice {
    /// Retries the client may still attempt before giving up.
    pub const MAX_CLIENT_RETRIES: u32 = 2;

    /// Build the advice for a degraded scan.
    ///
    /// `retry_count` is how many times the client already retried.
    pub fn for_failure(retry_count: u32, error_kind: ErrorKind) -> Self {
        Self {
            retry_count,
            suggest_retry: retry_count < Self::MAX_CLIENT_RETRIES
                && error_kind != ErrorKind::OfflineMode,
            retry_delay_seconds: if retry_count == 0 { 10 } else { 20 },
        }
    }
}

/// Snapshot of the resilience layer attached to every result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SystemStatus {
    pub connection_status: ConnectionStatus,
    pub offline_queue_size: usize,
    pub suggest_offline_mode: bool,
}

impl SystemStatus {
    pub fn new(connection_status: ConnectionStatus, offline_queue_size: usize) -> Self {
        Self {
            connection_status,
            offline_queue_size,
            suggest_offline_mode: connection_status == ConnectionStatus::Offline,
        }
    }
}

impl Default for SystemStatus {
    fn default() -> Self {
        Self::new(ConnectionStatus::Online, 0)
    }
}

/// The record persisted for analytics, before system status is attached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanRecord {
    pub card_name: String,
    pub set: String,
    pub rarity: String,
    #[serde(default)]
    pub number: Option<String>,
    pub confidence: f64,
    pub model_version: String,
    pub processing_time_ms: u64,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub mode: ScanMode,
    #[serde(default)]
    pub detections: Vec<Region>,
    pub scanned_at: DateTime<Utc>,
}

impl ScanRecord {
    /// Build a record from a prediction; confidence is clamped to [0, 1].
    pub fn from_prediction(prediction: Prediction, mode: ScanMode) -> Self {
        Self {
            card_name: prediction.name,
            set: prediction.set,
            rarity: prediction.rarity,
            number: prediction.number,
            confidence: prediction.confidence.clamp(0.0, 1.0),
            model_version: prediction.model_version,
            processing_time_ms: prediction.processing_time_ms,
            error_kind: None,
            error_message: None,
            mode,
            detections: Vec::new(),
            scanned_at: Utc::now(),
        }
    }

    pub fn with_error(mut self, kind: ErrorKind, message: impl Into<String>) -> Self {
        self.error_kind = Some(kind);
        self.error_message = Some(message.into());
        self
    }

    pub fn with_detections(mut self, detections: Vec<Region>) -> Self {
        self.detections = detections;
        self
    }
}

/// Final result of one scan request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanResult {
    pub card_name: String,
    pub set: String,
    pub rarity: String,
    #[serde(default)]
    pub number: Option<String>,
    pub confidence: f64,
    pub model_version: String,
    pub processing_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryAdvice>,
    pub mode: ScanMode,
    #[serde(default)]
    pub detections: Vec<Region>,
    pub system_status: SystemStatus,
    pub user_guidance: UserGuidance,
    pub scanned_at: DateTime<Utc>,
}

impl ScanResult {
    /// Assemble the response from a persisted record.
    ///
    /// Guidance and retry advice are derived here so that every result
    /// carries them consistently.
    pub fn assemble(record: ScanRecord, system_status: SystemStatus, retry_count: u32) -> Self {
        let user_guidance = UserGuidance::for_outcome(record.error_kind, record.confidence);
        let retry = record
            .error_kind
            .map(|kind| RetryAdvice::for_failure(retry_count, kind));

        Self {
            card_name: record.card_name,
            set: record.set,
            rarity: record.rarity,
            number: record.number,
            confidence: record.confidence,
            model_version: record.model_version,
            processing_time_ms: record.processing_time_ms,
            error_kind: record.error_kind,
            error_message: record.error_message,
            retry,
            mode: record.mode,
            detections: record.detections,
            system_status,
            user_guidance,
            scanned_at: record.scanned_at,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.error_kind.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guidance::GuidanceAction;

    #[test]
    fn test_best_region_prefers_confidence() {
        let regions = vec![
            Region::new(BoundingBox::new(0, 0, 10, 10), 0.4),
            Region::new(BoundingBox::new(5, 5, 20, 30), 0.9),
            Region::new(BoundingBox::new(1, 1, 5, 5), 0.9),
        ];
        let best = Region::best(&regions).unwrap();
        assert_eq!(best.bounding_box, BoundingBox::new(5, 5, 20, 30));
        assert!(Region::best(&[]).is_none());
    }

    #[test]
    fn test_connection_status_worst() {
        assert_eq!(
            ConnectionStatus::Online.worst(ConnectionStatus::Degraded),
            ConnectionStatus::Degraded
        );
        assert_eq!(
            ConnectionStatus::Offline.worst(ConnectionStatus::Degraded),
            ConnectionStatus::Offline
        );
    }

    #[test]
    fn test_retry_advice_schedule() {
        let first = RetryAdvice::for_failure(0, ErrorKind::MlError);
        assert!(first.suggest_retry);
        assert_eq!(first.retry_delay_seconds, 10);

        let second = RetryAdvice::for_failure(1, ErrorKind::MlError);
        assert!(second.suggest_retry);
        assert_eq!(second.retry_delay_seconds, 20);

        let last = RetryAdvice::for_failure(2, ErrorKind::MlError);
        assert!(!last.suggest_retry);

        let offline = RetryAdvice::for_failure(0, ErrorKind::OfflineMode);
        assert!(!offline.suggest_retry);
    }

    #[test]
    fn test_assemble_degraded_result() {
        let record = ScanRecord::from_prediction(Prediction::unknown("error_fallback"), ScanMode::Error)
            .with_error(ErrorKind::MlError, "identification unavailable");
        let result = ScanResult::assemble(record, SystemStatus::new(ConnectionStatus::Degraded, 2), 0);

        assert!(result.is_degraded());
        assert_eq!(result.card_name, UNKNOWN_CARD);
        assert_eq!(result.retry.unwrap().retry_delay_seconds, 10);
        assert_eq!(result.user_guidance.action, GuidanceAction::RetryWithBetterImage);
        assert_eq!(result.system_status.offline_queue_size, 2);
    }

    #[test]
    fn test_prediction_defaults_from_json() {
        let prediction: Prediction =
            serde_json::from_str(r#"{"name": "Pikachu", "set": "Base Set", "confidence": 0.95}"#)
                .unwrap();
        assert_eq!(prediction.rarity, "Unknown");
        assert_eq!(prediction.number, None);
        assert!(!prediction.is_unknown());
    }

    #[test]
    fn test_confidence_clamped() {
        let mut prediction = Prediction::unknown("v1");
        prediction.confidence = 1.7;
        let record = ScanRecord::from_prediction(prediction, ScanMode::Online);
        assert_eq!(record.confidence, 1.0);
    }
}

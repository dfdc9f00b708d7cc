//! Collaborator abstractions for the scan pipeline.
//!
//! The pipeline never talks to a model, detector, database or network
//! directly; it goes through these traits so each can be swapped or
//! scripted in tests. Every call is made through the resilience
//! orchestrator, which adds timeouts, retries and fallbacks.

use async_trait::async_trait;
use cardscan_core::{BoundingBox, ConnectionStatus, Prediction, Region, ScanRecord};

use crate::error::DependencyError;

mod jsonl;

#[cfg(feature = "http")]
mod http;

pub use jsonl::JsonlScanStore;

#[cfg(feature = "http")]
pub use http::{HttpHealthProbe, HttpIdentifier};

/// Locates cards in an image.
#[async_trait]
pub trait CardDetector: Send + Sync {
    /// Regions likely to contain a card, in no particular order.
    async fn detect(&self, image: &[u8]) -> Result<Vec<Region>, DependencyError>;

    /// Cut `bounding_box` out of `image`.
    fn crop(&self, image: &[u8], bounding_box: &BoundingBox) -> Result<Vec<u8>, DependencyError>;

    /// Detector name for logs.
    fn name(&self) -> &str;
}

/// Identifies the card shown in an image.
#[async_trait]
pub trait CardIdentifier: Send + Sync {
    async fn identify(&self, image: &[u8]) -> Result<Prediction, DependencyError>;

    /// Identifier name for logs.
    fn name(&self) -> &str;
}

/// Persists scan analytics records.
#[async_trait]
pub trait ScanStore: Send + Sync {
    async fn persist(&self, record: &ScanRecord) -> Result<(), DependencyError>;
}

/// Reports current connectivity.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> ConnectionStatus;
}

/// Detector that never finds a region, so the whole frame is identified.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullFrameDetector;

#[async_trait]
impl CardDetector for FullFrameDetector {
    async fn detect(&self, _image: &[u8]) -> Result<Vec<Region>, DependencyError> {
        Ok(Vec::new())
    }

    fn crop(&self, image: &[u8], _bounding_box: &BoundingBox) -> Result<Vec<u8>, DependencyError> {
        Ok(image.to_vec())
    }

    fn name(&self) -> &str {
        "full_frame"
    }
}

/// Probe that always reports the same status.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticProbe(pub ConnectionStatus);

#[async_trait]
impl HealthProbe for StaticProbe {
    async fn probe(&self) -> ConnectionStatus {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_frame_detector() {
        let detector = FullFrameDetector;
        assert!(detector.detect(b"image").await.unwrap().is_empty());
        let cropped = detector
            .crop(b"image", &BoundingBox::new(0, 0, 10, 10))
            .unwrap();
        assert_eq!(cropped, b"image");
    }

    #[tokio::test]
    async fn test_static_probe() {
        assert_eq!(
            StaticProbe(ConnectionStatus::Offline).probe().await,
            ConnectionStatus::Offline
        );
    }
}
